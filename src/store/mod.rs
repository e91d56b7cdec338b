//! Durable record store
//!
//! The engine only ever mutates shared state through the conditional writes
//! declared here: status compare-and-set on movements and jobs, and guarded,
//! op-keyed village effects. Two backends exist: an in-process store and a
//! PostgREST-backed one.

pub mod memory;
pub mod postgrest;
pub mod remote;
pub mod seed;

pub use memory::MemoryStore;
pub use postgrest::PostgrestClient;
pub use remote::PostgrestStore;
pub use seed::WorldSeed;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{Claim, JobId, JobKind, JobStatus, ScheduledJob};
use crate::rally::{Movement, MovementId, MovementStatus};
use crate::world::{CombatOutcome, Garrison, UnitTypeId, Village, VillageId};

/// Idempotency key of one village mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpKey(pub String);

impl OpKey {
    /// Troops leaving the origin on send
    pub fn depart(movement: MovementId) -> Self {
        Self(format!("movement:{}:depart", movement))
    }

    /// Undo of a depart whose movement never went out
    pub fn rollback(movement: MovementId) -> Self {
        Self(format!("movement:{}:rollback", movement))
    }

    /// Arrival effect on the receiving village
    pub fn arrive(movement: MovementId) -> Self {
        Self(format!("movement:{}:arrive", movement))
    }

    pub fn job(job: JobId) -> Self {
        Self(format!("job:{}", job))
    }
}

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarrisonDelta {
    pub unit: UnitTypeId,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingUpgrade {
    pub building: String,
    /// Level after the upgrade; the current level must be one below
    pub target_level: u8,
}

/// A guarded change to one village row.
///
/// Applied all-or-nothing. Without `saturating`, a delta that would take a
/// count below zero rejects the whole effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillageEffect {
    pub garrison: Vec<GarrisonDelta>,
    pub building: Option<BuildingUpgrade>,
    #[serde(default)]
    pub saturating: bool,
}

impl VillageEffect {
    pub fn add(stacks: &[crate::world::UnitStack]) -> Self {
        Self {
            garrison: stacks
                .iter()
                .map(|s| GarrisonDelta {
                    unit: s.unit.clone(),
                    delta: i64::from(s.count),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn remove(stacks: &[crate::world::UnitStack]) -> Self {
        Self {
            garrison: stacks
                .iter()
                .map(|s| GarrisonDelta {
                    unit: s.unit.clone(),
                    delta: -i64::from(s.count),
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectOutcome {
    Applied,
    /// The op key was already recorded; nothing changed
    AlreadyApplied,
}

/// Compare-and-set on a movement row
#[derive(Debug, Clone)]
pub struct MovementTransition {
    /// The write only happens if the current status is one of these
    pub expected: &'static [MovementStatus],
    /// When set, the current claim token must match
    pub expected_claim: Option<Uuid>,
    pub status: MovementStatus,
    pub claim: Option<Claim>,
    pub outcome: Option<CombatOutcome>,
    pub failure: Option<String>,
    pub at: DateTime<Utc>,
}

impl MovementTransition {
    pub fn new(expected: &'static [MovementStatus], status: MovementStatus, at: DateTime<Utc>) -> Self {
        Self {
            expected,
            expected_claim: None,
            status,
            claim: None,
            outcome: None,
            failure: None,
            at,
        }
    }

    pub fn claimed_by(mut self, token: Uuid) -> Self {
        self.expected_claim = Some(token);
        self
    }

    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.claim = Some(claim);
        self
    }

    pub fn with_outcome(mut self, outcome: CombatOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }
}

/// Compare-and-set on a queue job row
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub expected: JobStatus,
    pub expected_claim: Option<Uuid>,
    pub status: JobStatus,
    pub claim: Option<Claim>,
    pub failure: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobTransition {
    pub fn new(expected: JobStatus, status: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            expected,
            expected_claim: None,
            status,
            claim: None,
            failure: None,
            at,
        }
    }

    pub fn claimed_by(mut self, token: Uuid) -> Self {
        self.expected_claim = Some(token);
        self
    }

    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.claim = Some(claim);
        self
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }
}

/// Expected queue tail when appending a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailGuard {
    pub job_id: JobId,
    pub version: u64,
}

/// Rewrite of a job behind a cancellation: new due time and, for upgrades of
/// the same building, the level it now leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueShift {
    pub job_id: JobId,
    pub expected_version: u64,
    pub due_at: DateTime<Utc>,
    pub target_level: Option<u8>,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Conditional write failed: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Insufficient {unit}: requested {requested}, available {available}")]
    Insufficient {
        unit: String,
        requested: u64,
        available: u64,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl StoreError {
    pub fn conflict(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        StoreError::Conflict {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait WorldStore: Send + Sync {
    /// Backend name for health output
    fn backend(&self) -> &'static str;

    // Villages

    async fn village(&self, id: VillageId) -> StoreResult<Option<Village>>;

    async fn garrison(&self, id: VillageId) -> StoreResult<Garrison>;

    async fn buildings(&self, id: VillageId) -> StoreResult<BTreeMap<String, u8>>;

    /// Apply `effect` unless `op` was already applied to this village
    async fn apply_village_effect(
        &self,
        village: VillageId,
        op: &OpKey,
        effect: &VillageEffect,
    ) -> StoreResult<EffectOutcome>;

    async fn op_applied(&self, village: VillageId, op: &OpKey) -> StoreResult<bool>;

    // Movements

    /// Insert unless a movement with the same id exists; returns whether it was inserted
    async fn insert_movement(&self, movement: &Movement) -> StoreResult<bool>;

    async fn movement(&self, id: MovementId) -> StoreResult<Option<Movement>>;

    async fn transition_movement(
        &self,
        id: MovementId,
        transition: MovementTransition,
    ) -> StoreResult<Movement>;

    /// Claimable movements with `arrive_at <= now`, earliest first
    async fn due_movements(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<MovementId>>;

    /// Movements stuck in `status` since before `before`
    async fn stuck_movements(
        &self,
        status: MovementStatus,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Movement>>;

    // Queue jobs

    /// Append to the village queue if its active tail is still `tail`
    async fn insert_job(&self, job: &ScheduledJob, tail: Option<TailGuard>) -> StoreResult<()>;

    async fn job(&self, id: JobId) -> StoreResult<Option<ScheduledJob>>;

    /// Pending and processing jobs of one queue in queue order
    async fn active_queue(&self, village: VillageId, kind: JobKind) -> StoreResult<Vec<ScheduledJob>>;

    async fn transition_job(&self, id: JobId, transition: JobTransition) -> StoreResult<ScheduledJob>;

    /// Cancel a pending job and move later jobs, all or nothing
    async fn cancel_and_reschedule(
        &self,
        id: JobId,
        expected_version: u64,
        shifts: &[DueShift],
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Pending jobs with `due_at <= now`, earliest first
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<(JobKind, JobId)>>;

    /// Processing jobs claimed before `before`
    async fn stale_jobs(&self, before: DateTime<Utc>) -> StoreResult<Vec<ScheduledJob>>;
}
