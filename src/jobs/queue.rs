//! Village queues: training, building and quest timers

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::game::GameConfig;
use crate::error::{EngineError, EngineResult};
use crate::store::{
    BuildingUpgrade, DueShift, JobTransition, OpKey, StoreError, TailGuard, VillageEffect,
    WorldStore,
};
use crate::util::time::Clock;
use crate::world::{AccountId, UnitStack, UnitTypeId, VillageId};

use super::{Claim, JobId, JobKind, JobPayload, JobStatus, ProcessOutcome, ScheduledJob};

/// Active jobs allowed per queue
pub const MAX_QUEUE_LEN: usize = 5;

/// Tail races tolerated before an append gives up
const APPEND_ATTEMPTS: usize = 5;

/// Version races tolerated before a cancel gives up
const RESCHEDULE_ATTEMPTS: usize = 3;

/// What a player asks a village queue to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobRequest {
    Train { unit: UnitTypeId, count: u32 },
    Build { building: String },
    Quest { quest: String },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Train { .. } => JobKind::Training,
            JobRequest::Build { .. } => JobKind::Building,
            JobRequest::Quest { .. } => JobKind::Quest,
        }
    }
}

/// Active jobs of one village queue in queue order
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub village_id: VillageId,
    pub kind: JobKind,
    pub jobs: Vec<ScheduledJob>,
}

pub struct QueueManager {
    store: Arc<dyn WorldStore>,
    config: Arc<GameConfig>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn WorldStore>, config: Arc<GameConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    async fn ensure_owner(&self, village_id: VillageId, account: AccountId) -> EngineResult<()> {
        match self.store.village(village_id).await? {
            Some(v) if v.owner_id == account => Ok(()),
            _ => {
                warn!(account_id = %account, "Queue access rejected");
                Err(EngineError::Unauthorized)
            }
        }
    }

    /// Append a job to a village queue.
    ///
    /// Training and building jobs run back to back: a new job is due one
    /// duration after the current tail. Quest timers run side by side.
    pub async fn enqueue(
        &self,
        account: AccountId,
        village_id: VillageId,
        request: JobRequest,
    ) -> EngineResult<ScheduledJob> {
        self.ensure_owner(village_id, account).await?;
        let kind = request.kind();

        for _ in 0..APPEND_ATTEMPTS {
            let active = self.store.active_queue(village_id, kind).await?;
            if active.len() >= MAX_QUEUE_LEN {
                return Err(EngineError::InvalidInput(format!(
                    "{} queue is full",
                    kind.as_str()
                )));
            }

            let (payload, secs) = self.plan(village_id, &request, &active).await?;
            let duration_ms = self.config.scaled_ms(secs);
            let now = self.clock.now();
            let tail = active.last();

            let start = match tail {
                Some(last) if kind.is_serialized() => last.due_at,
                _ => now,
            };
            let job = ScheduledJob {
                id: Uuid::new_v4(),
                kind,
                owner_village_id: village_id,
                seq: tail.map_or(0, |t| t.seq + 1),
                duration_ms,
                due_at: start + Duration::milliseconds(duration_ms),
                status: JobStatus::Pending,
                claim: None,
                payload,
                created_at: now,
                finished_at: None,
                failure: None,
                version: 0,
            };
            let guard = tail.map(|t| TailGuard {
                job_id: t.id,
                version: t.version,
            });

            match self.store.insert_job(&job, guard).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        village_id,
                        kind = kind.as_str(),
                        due_at = %job.due_at,
                        "Job queued"
                    );
                    return Ok(job);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(village_id, kind = kind.as_str(), "Queue tail moved, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::AlreadyProcessing)
    }

    /// Payload and game-time duration in seconds for a request
    async fn plan(
        &self,
        village_id: VillageId,
        request: &JobRequest,
        active: &[ScheduledJob],
    ) -> EngineResult<(JobPayload, f64)> {
        match request {
            JobRequest::Train { unit, count } => {
                let stats = self
                    .config
                    .unit(unit)
                    .ok_or_else(|| EngineError::InvalidInput(format!("unknown unit type {}", unit)))?;
                if *count == 0 {
                    return Err(EngineError::InvalidInput("count must be positive".into()));
                }
                Ok((
                    JobPayload::Train {
                        unit: unit.clone(),
                        count: *count,
                    },
                    f64::from(stats.train_secs) * f64::from(*count),
                ))
            }
            JobRequest::Build { building } => {
                let stats = self.config.building(building).ok_or_else(|| {
                    EngineError::InvalidInput(format!("unknown building {}", building))
                })?;
                let current = self
                    .store
                    .buildings(village_id)
                    .await?
                    .get(building)
                    .copied()
                    .unwrap_or(0);
                let queued = active
                    .iter()
                    .filter(|j| matches!(&j.payload, JobPayload::Build { building: b, .. } if b == building))
                    .count();
                let target = usize::from(current) + queued + 1;
                if target > usize::from(stats.max_level) {
                    return Err(EngineError::InvalidInput(format!(
                        "{} is already at its maximum level",
                        building
                    )));
                }
                let target_level = target as u8;
                Ok((
                    JobPayload::Build {
                        building: building.clone(),
                        target_level,
                    },
                    stats.upgrade_secs(target_level),
                ))
            }
            JobRequest::Quest { quest } => {
                let stats = self
                    .config
                    .quest(quest)
                    .ok_or_else(|| EngineError::InvalidInput(format!("unknown quest {}", quest)))?;
                Ok((
                    JobPayload::QuestReward {
                        quest: quest.clone(),
                        reward: stats.reward.clone(),
                    },
                    f64::from(stats.duration_secs),
                ))
            }
        }
    }

    pub async fn queue_state(
        &self,
        account: AccountId,
        village_id: VillageId,
        kind: JobKind,
    ) -> EngineResult<QueueState> {
        self.ensure_owner(village_id, account).await?;
        self.load_state(village_id, kind).await
    }

    async fn load_state(&self, village_id: VillageId, kind: JobKind) -> EngineResult<QueueState> {
        let jobs = self.store.active_queue(village_id, kind).await?;
        Ok(QueueState {
            village_id,
            kind,
            jobs,
        })
    }

    /// Cancel a pending job and pull every later job of a serialized queue
    /// forward by the cancelled job's duration.
    pub async fn cancel_job(&self, job_id: JobId, account: AccountId) -> EngineResult<QueueState> {
        for attempt in 0..RESCHEDULE_ATTEMPTS {
            let Some(job) = self.store.job(job_id).await? else {
                warn!(account_id = %account, "Cancel rejected");
                return Err(EngineError::Unauthorized);
            };
            self.ensure_owner(job.owner_village_id, account).await?;

            match job.status {
                JobStatus::Pending => {}
                JobStatus::Processing => return Err(EngineError::AlreadyProcessing),
                _ => return Err(EngineError::NotCancellable),
            }

            let now = self.clock.now();
            let shifts = if job.kind.is_serialized() {
                let active = self.store.active_queue(job.owner_village_id, job.kind).await?;
                reschedule_after(&job, &active)
            } else {
                Vec::new()
            };

            match self
                .store
                .cancel_and_reschedule(job.id, job.version, &shifts, now)
                .await
            {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        village_id = job.owner_village_id,
                        shifted = shifts.len(),
                        "Job cancelled"
                    );
                    return self.load_state(job.owner_village_id, job.kind).await;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(job_id = %job.id, attempt, "Queue changed under cancel, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::AlreadyProcessing)
    }

    /// Claim and apply one due job.
    ///
    /// A job of a serialized queue only runs once every job ahead of it is
    /// finished; otherwise it is left for a later tick.
    pub async fn process_due(&self, job_id: JobId) -> EngineResult<ProcessOutcome> {
        let now = self.clock.now();
        let Some(job) = self.store.job(job_id).await? else {
            return Ok(ProcessOutcome::Lost);
        };
        if job.status != JobStatus::Pending || job.due_at > now {
            return Ok(ProcessOutcome::Lost);
        }

        if job.kind.is_serialized() {
            let active = self.store.active_queue(job.owner_village_id, job.kind).await?;
            if active.first().map(|head| head.id) != Some(job.id) {
                debug!(job_id = %job.id, "Waiting on earlier job");
                return Ok(ProcessOutcome::Deferred);
            }
        }

        let claim = Claim::new(now);
        let claimed = self
            .store
            .transition_job(
                job_id,
                JobTransition::new(JobStatus::Pending, JobStatus::Processing, now).with_claim(claim),
            )
            .await;
        match claimed {
            Ok(job) => self.apply_claimed(job, claim.token).await,
            Err(StoreError::Conflict { .. }) => {
                debug!(job_id = %job_id, "Claim lost");
                Ok(ProcessOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_claimed(&self, job: ScheduledJob, token: Uuid) -> EngineResult<ProcessOutcome> {
        let effect = match &job.payload {
            JobPayload::Train { unit, count } => VillageEffect::add(&[UnitStack {
                unit: unit.clone(),
                count: *count,
            }]),
            JobPayload::Build {
                building,
                target_level,
            } => VillageEffect {
                building: Some(BuildingUpgrade {
                    building: building.clone(),
                    target_level: *target_level,
                }),
                ..Default::default()
            },
            JobPayload::QuestReward { reward, .. } => VillageEffect::add(reward),
        };

        let applied = self
            .store
            .apply_village_effect(job.owner_village_id, &OpKey::job(job.id), &effect)
            .await
            .map_err(EngineError::from);

        match applied {
            Ok(_) => {
                self.store
                    .transition_job(
                        job.id,
                        JobTransition::new(JobStatus::Processing, JobStatus::Done, self.clock.now())
                            .claimed_by(token),
                    )
                    .await?;
                info!(
                    job_id = %job.id,
                    village_id = job.owner_village_id,
                    kind = job.kind.as_str(),
                    "Job done"
                );
                Ok(ProcessOutcome::Applied)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job effect failed; parked for operator");
                self.store
                    .transition_job(
                        job.id,
                        JobTransition::new(JobStatus::Processing, JobStatus::Failed, self.clock.now())
                            .claimed_by(token)
                            .with_failure(e.to_string()),
                    )
                    .await?;
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    /// Take over PROCESSING jobs claimed before `before` and finish them
    pub async fn recover_stale(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        let mut resumed = 0;
        for stale in self.store.stale_jobs(before).await? {
            let Some(old) = stale.claim else { continue };
            let now = self.clock.now();
            let claim = Claim::new(now);
            let taken = self
                .store
                .transition_job(
                    stale.id,
                    JobTransition::new(JobStatus::Processing, JobStatus::Processing, now)
                        .claimed_by(old.token)
                        .with_claim(claim),
                )
                .await;
            match taken {
                Ok(job) => {
                    warn!(job_id = %job.id, "Resuming stale job claim");
                    self.apply_claimed(job, claim.token).await?;
                    resumed += 1;
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(resumed)
    }
}

/// Due-time rewrites for the pending jobs behind `cancelled`.
///
/// Each due time is chained on the one before it, so every later job moves
/// forward by exactly the cancelled job's duration, whether or not the
/// cancelled job was already due.
fn reschedule_after(cancelled: &ScheduledJob, active: &[ScheduledJob]) -> Vec<DueShift> {
    let shift = Duration::milliseconds(cancelled.duration_ms);
    let cancelled_building = match &cancelled.payload {
        JobPayload::Build { building, .. } => Some(building.as_str()),
        _ => None,
    };

    active
        .iter()
        .filter(|j| j.seq > cancelled.seq && j.status == JobStatus::Pending)
        .map(|j| {
            let target_level = match (&j.payload, cancelled_building) {
                (JobPayload::Build { building, target_level }, Some(b)) if building == b => {
                    Some(target_level.saturating_sub(1))
                }
                _ => None,
            };
            DueShift {
                job_id: j.id,
                expected_version: j.version,
                due_at: j.due_at - shift,
                target_level,
            }
        })
        .collect()
}
