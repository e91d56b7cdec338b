//! Scheduled job lifecycle shared by movements and village queues
//!
//! Every timed action is a tagged job: a movement on the rally point, or a
//! training, building or quest job in a village queue. They share one state
//! machine:
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──▶ DONE
//!    │                    └───────▶ FAILED
//!    └──cancel──▶ CANCELLED
//! ```
//!
//! A claim is a compare-and-set on the status plus a fresh claim token. Nothing
//! ever leaves PROCESSING except to DONE or FAILED.

pub mod queue;

pub use queue::{JobRequest, QueueManager, QueueState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::world::{UnitStack, UnitTypeId, VillageId};

pub type JobId = Uuid;

/// Kind tag used by the tick scheduler to pick an apply handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Movement,
    Training,
    Building,
    Quest,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Movement => "movement",
            JobKind::Training => "training",
            JobKind::Building => "building",
            JobKind::Quest => "quest",
        }
    }

    /// Queue kinds whose jobs run one after another
    pub fn is_serialized(&self) -> bool {
        matches!(self, JobKind::Training | JobKind::Building)
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobKind::Training),
            "building" => Ok(JobKind::Building),
            "quest" => Ok(JobKind::Quest),
            other => Err(format!("unknown queue kind {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Failed)
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Done)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// Proof that one tick run owns a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            claimed_at: now,
        }
    }
}

/// Result of trying to claim and apply one due job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Effect applied and committed
    Applied,
    /// Another actor owned the job first; nothing was applied
    Lost,
    /// Due, but an earlier job of the same serialized queue is still active
    Deferred,
    /// Effect failed; the job is parked as FAILED
    Failed,
}

/// Effect carried by a queue job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Train { unit: UnitTypeId, count: u32 },
    Build { building: String, target_level: u8 },
    QuestReward { quest: String, reward: Vec<UnitStack> },
}

/// A job in a village-scoped queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_village_id: VillageId,
    /// Position in the village queue
    pub seq: u64,
    pub duration_ms: i64,
    pub due_at: DateTime<Utc>,
    pub status: JobStatus,
    pub claim: Option<Claim>,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    /// Bumped on every write; guards queue-wide rewrites
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_only_leaves_to_done_or_failed() {
        use JobStatus::*;
        for next in [Pending, Cancelled] {
            assert!(!Processing.can_transition_to(next));
        }
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        use JobStatus::*;
        for from in [Done, Cancelled, Failed] {
            assert!(from.is_terminal());
            for to in [Pending, Processing, Done, Cancelled, Failed] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn queue_kinds_parse() {
        assert_eq!("building".parse::<JobKind>(), Ok(JobKind::Building));
        assert!("movement".parse::<JobKind>().is_err());
        assert!(JobKind::Training.is_serialized());
        assert!(!JobKind::Quest.is_serialized());
    }
}
