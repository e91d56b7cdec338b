//! Engine error taxonomy

use crate::store::StoreError;

/// Error class, used to decide how the edge reports a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Surfaced to the caller, never retried.
    Validation,
    /// Owner mismatch. Surfaced without details about the target.
    Authorization,
    /// Lost a claim race. The user may retry, the engine never does.
    Concurrency,
    /// Applying an effect failed. The job is parked as FAILED.
    EffectApplication,
    /// Anything else.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient troops of type {unit}: requested {requested}, available {available}")]
    InsufficientTroops {
        unit: String,
        requested: u32,
        available: u32,
    },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Cancellation window has expired")]
    CancelWindowExpired,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Already processing")]
    AlreadyProcessing,

    #[error("Job cannot be cancelled in its current state")]
    NotCancellable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Effect application failed: {0}")]
    EffectFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::InsufficientTroops { .. } => "INSUFFICIENT_TROOPS",
            EngineError::InvalidDestination(_) => "INVALID_DESTINATION",
            EngineError::CancelWindowExpired => "CANCEL_WINDOW_EXPIRED",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::AlreadyProcessing => "ALREADY_PROCESSING",
            EngineError::NotCancellable => "NOT_CANCELLABLE",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::EffectFailed(_) => "EFFECT_FAILED",
            EngineError::Store(StoreError::Conflict { .. }) => "ALREADY_PROCESSING",
            EngineError::Store(_) => "INTERNAL",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::InsufficientTroops { .. }
            | EngineError::InvalidDestination(_)
            | EngineError::CancelWindowExpired
            | EngineError::NotCancellable
            | EngineError::NotFound(_) => ErrorClass::Validation,
            EngineError::Unauthorized => ErrorClass::Authorization,
            EngineError::AlreadyProcessing | EngineError::Store(StoreError::Conflict { .. }) => {
                ErrorClass::Concurrency
            }
            EngineError::EffectFailed(_) => ErrorClass::EffectApplication,
            EngineError::Store(_) => ErrorClass::Internal,
        }
    }

    /// Store unavailable or misbehaving, as opposed to a rejected write.
    /// Such errors abort a sweep instead of failing the job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(
                StoreError::Backend(_)
                    | StoreError::Request(_)
                    | StoreError::Api { .. }
                    | StoreError::Parse(_)
            )
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_classes_line_up() {
        assert_eq!(EngineError::CancelWindowExpired.code(), "CANCEL_WINDOW_EXPIRED");
        assert_eq!(EngineError::Unauthorized.class(), ErrorClass::Authorization);
        assert_eq!(EngineError::AlreadyProcessing.class(), ErrorClass::Concurrency);

        let conflict = EngineError::Store(StoreError::Conflict {
            expected: "pending".into(),
            actual: "processing".into(),
        });
        assert_eq!(conflict.code(), "ALREADY_PROCESSING");
        assert_eq!(conflict.class(), ErrorClass::Concurrency);

        let backend = EngineError::Store(StoreError::Backend("down".into()));
        assert_eq!(backend.class(), ErrorClass::Internal);
    }
}
