//! In-process store
//!
//! Each village row and each village queue is a single `DashMap` entry, so a
//! guarded write holds that row's shard lock for the check and the write
//! together. State is lost on restart.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::jobs::{JobId, JobKind, JobPayload, JobStatus, ScheduledJob};
use crate::rally::{Movement, MovementId, MovementStatus};
use crate::world::{Garrison, Village, VillageId};

use super::{
    DueShift, EffectOutcome, JobTransition, MovementTransition, OpKey, StoreError, StoreResult,
    TailGuard, VillageEffect, WorldStore,
};

#[derive(Debug, Clone)]
struct VillageRow {
    village: Village,
    garrison: Garrison,
    buildings: BTreeMap<String, u8>,
    applied: HashSet<OpKey>,
}

type QueueKey = (VillageId, JobKind);

#[derive(Debug, Default)]
pub struct MemoryStore {
    villages: DashMap<VillageId, VillageRow>,
    movements: DashMap<MovementId, Movement>,
    queues: DashMap<QueueKey, Vec<ScheduledJob>>,
    job_index: DashMap<JobId, QueueKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a village row
    pub fn insert_village(
        &self,
        village: Village,
        garrison: Garrison,
        buildings: BTreeMap<String, u8>,
    ) {
        self.villages.insert(
            village.id,
            VillageRow {
                village,
                garrison,
                buildings,
                applied: HashSet::new(),
            },
        );
    }

    pub fn village_count(&self) -> usize {
        self.villages.len()
    }

    #[cfg(test)]
    pub fn remove_village(&self, id: VillageId) {
        self.villages.remove(&id);
    }

    fn queue_key(&self, id: JobId) -> StoreResult<QueueKey> {
        self.job_index
            .get(&id)
            .map(|k| *k)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))
    }
}

#[async_trait]
impl WorldStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn village(&self, id: VillageId) -> StoreResult<Option<Village>> {
        Ok(self.villages.get(&id).map(|row| row.village.clone()))
    }

    async fn garrison(&self, id: VillageId) -> StoreResult<Garrison> {
        self.villages
            .get(&id)
            .map(|row| row.garrison.clone())
            .ok_or_else(|| StoreError::NotFound(format!("village {}", id)))
    }

    async fn buildings(&self, id: VillageId) -> StoreResult<BTreeMap<String, u8>> {
        self.villages
            .get(&id)
            .map(|row| row.buildings.clone())
            .ok_or_else(|| StoreError::NotFound(format!("village {}", id)))
    }

    async fn apply_village_effect(
        &self,
        village: VillageId,
        op: &OpKey,
        effect: &VillageEffect,
    ) -> StoreResult<EffectOutcome> {
        let mut row = self
            .villages
            .get_mut(&village)
            .ok_or_else(|| StoreError::NotFound(format!("village {}", village)))?;

        if row.applied.contains(op) {
            return Ok(EffectOutcome::AlreadyApplied);
        }

        let mut garrison = row.garrison.clone();
        for change in &effect.garrison {
            let current = i64::from(garrison.get(&change.unit).copied().unwrap_or(0));
            let mut updated = current + change.delta;
            if updated < 0 {
                if !effect.saturating {
                    return Err(StoreError::Insufficient {
                        unit: change.unit.to_string(),
                        requested: change.delta.unsigned_abs(),
                        available: current as u64,
                    });
                }
                updated = 0;
            }
            let updated = u32::try_from(updated).map_err(|_| {
                StoreError::Rejected(format!("garrison count overflow for {}", change.unit))
            })?;
            garrison.insert(change.unit.clone(), updated);
        }

        if let Some(upgrade) = &effect.building {
            let current = row.buildings.get(&upgrade.building).copied().unwrap_or(0);
            if current.checked_add(1) != Some(upgrade.target_level) {
                return Err(StoreError::Conflict {
                    expected: format!(
                        "{} level {}",
                        upgrade.building,
                        upgrade.target_level.saturating_sub(1)
                    ),
                    actual: format!("{} level {}", upgrade.building, current),
                });
            }
        }

        row.garrison = garrison;
        if let Some(upgrade) = &effect.building {
            row.buildings
                .insert(upgrade.building.clone(), upgrade.target_level);
        }
        row.applied.insert(op.clone());

        Ok(EffectOutcome::Applied)
    }

    async fn op_applied(&self, village: VillageId, op: &OpKey) -> StoreResult<bool> {
        self.villages
            .get(&village)
            .map(|row| row.applied.contains(op))
            .ok_or_else(|| StoreError::NotFound(format!("village {}", village)))
    }

    async fn insert_movement(&self, movement: &Movement) -> StoreResult<bool> {
        match self.movements.entry(movement.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(movement.clone());
                Ok(true)
            }
        }
    }

    async fn movement(&self, id: MovementId) -> StoreResult<Option<Movement>> {
        Ok(self.movements.get(&id).map(|m| m.clone()))
    }

    async fn transition_movement(
        &self,
        id: MovementId,
        transition: MovementTransition,
    ) -> StoreResult<Movement> {
        let mut movement = self
            .movements
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("movement {}", id)))?;

        if !transition.expected.contains(&movement.status) {
            return Err(StoreError::conflict(transition.expected, movement.status));
        }
        if let Some(token) = transition.expected_claim {
            if movement.claim.map(|c| c.token) != Some(token) {
                return Err(StoreError::conflict(token, movement.claim.map(|c| c.token)));
            }
        }

        movement.status = transition.status;
        if let Some(claim) = transition.claim {
            movement.claim = Some(claim);
        }
        if let Some(outcome) = transition.outcome {
            movement.outcome = Some(outcome);
        }
        if let Some(failure) = transition.failure {
            movement.failure = Some(failure);
        }
        if transition.status.is_terminal() {
            movement.finished_at = Some(transition.at);
        }

        Ok(movement.clone())
    }

    async fn due_movements(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<MovementId>> {
        let mut due: Vec<(DateTime<Utc>, MovementId)> = self
            .movements
            .iter()
            .filter(|m| MovementStatus::CLAIMABLE.contains(&m.status) && m.arrive_at <= now)
            .map(|m| (m.arrive_at, m.id))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn stuck_movements(
        &self,
        status: MovementStatus,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Movement>> {
        Ok(self
            .movements
            .iter()
            .filter(|m| m.status == status)
            .filter(|m| match (status, m.claim) {
                (MovementStatus::Processing, Some(claim)) => claim.claimed_at < before,
                _ => m.depart_at < before,
            })
            .map(|m| m.clone())
            .collect())
    }

    async fn insert_job(&self, job: &ScheduledJob, tail: Option<TailGuard>) -> StoreResult<()> {
        if self.job_index.contains_key(&job.id) {
            return Err(StoreError::Rejected(format!("duplicate job id {}", job.id)));
        }

        let key = (job.owner_village_id, job.kind);
        let mut queue = self.queues.entry(key).or_default();

        let current_tail = queue
            .iter()
            .rev()
            .find(|j| !j.status.is_terminal())
            .map(|j| TailGuard {
                job_id: j.id,
                version: j.version,
            });
        if current_tail != tail {
            return Err(StoreError::conflict(tail, current_tail));
        }

        queue.push(job.clone());
        self.job_index.insert(job.id, key);
        Ok(())
    }

    async fn job(&self, id: JobId) -> StoreResult<Option<ScheduledJob>> {
        let Some(key) = self.job_index.get(&id).map(|k| *k) else {
            return Ok(None);
        };
        Ok(self
            .queues
            .get(&key)
            .and_then(|queue| queue.iter().find(|j| j.id == id).cloned()))
    }

    async fn active_queue(&self, village: VillageId, kind: JobKind) -> StoreResult<Vec<ScheduledJob>> {
        Ok(self
            .queues
            .get(&(village, kind))
            .map(|queue| {
                queue
                    .iter()
                    .filter(|j| !j.status.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transition_job(&self, id: JobId, transition: JobTransition) -> StoreResult<ScheduledJob> {
        let key = self.queue_key(id)?;
        let mut queue = self
            .queues
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        let job = queue
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;

        if job.status != transition.expected || !job.status.can_transition_to(transition.status) {
            return Err(StoreError::conflict(transition.expected, job.status));
        }
        if let Some(token) = transition.expected_claim {
            if job.claim.map(|c| c.token) != Some(token) {
                return Err(StoreError::conflict(token, job.claim.map(|c| c.token)));
            }
        }

        job.status = transition.status;
        if let Some(claim) = transition.claim {
            job.claim = Some(claim);
        }
        if let Some(failure) = transition.failure {
            job.failure = Some(failure);
        }
        if transition.status.is_terminal() {
            job.finished_at = Some(transition.at);
        }
        job.version += 1;

        Ok(job.clone())
    }

    async fn cancel_and_reschedule(
        &self,
        id: JobId,
        expected_version: u64,
        shifts: &[DueShift],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = self.queue_key(id)?;
        let mut queue = self
            .queues
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;

        // Validate every row first so the rewrite is all or nothing.
        let target = queue
            .iter()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        if target.status != JobStatus::Pending {
            return Err(StoreError::conflict(JobStatus::Pending, target.status));
        }
        if target.version != expected_version {
            return Err(StoreError::conflict(
                format!("version {}", expected_version),
                format!("version {}", target.version),
            ));
        }
        for shift in shifts {
            let job = queue
                .iter()
                .find(|j| j.id == shift.job_id)
                .ok_or_else(|| StoreError::NotFound(format!("job {}", shift.job_id)))?;
            if job.status != JobStatus::Pending || job.version != shift.expected_version {
                return Err(StoreError::conflict(
                    format!("pending v{}", shift.expected_version),
                    format!("{} v{}", job.status.as_str(), job.version),
                ));
            }
        }

        for job in queue.iter_mut() {
            if job.id == id {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(at);
                job.version += 1;
            } else if let Some(shift) = shifts.iter().find(|s| s.job_id == job.id) {
                job.due_at = shift.due_at;
                if let (Some(level), JobPayload::Build { target_level, .. }) =
                    (shift.target_level, &mut job.payload)
                {
                    *target_level = level;
                }
                job.version += 1;
            }
        }
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<(JobKind, JobId)>> {
        let mut due: Vec<(DateTime<Utc>, JobKind, JobId)> = Vec::new();
        for queue in self.queues.iter() {
            due.extend(
                queue
                    .iter()
                    .filter(|j| j.status == JobStatus::Pending && j.due_at <= now)
                    .map(|j| (j.due_at, j.kind, j.id)),
            );
        }
        due.sort_by_key(|(due_at, _, id)| (*due_at, *id));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|(_, kind, id)| (kind, id))
            .collect())
    }

    async fn stale_jobs(&self, before: DateTime<Utc>) -> StoreResult<Vec<ScheduledJob>> {
        let mut stale = Vec::new();
        for queue in self.queues.iter() {
            stale.extend(
                queue
                    .iter()
                    .filter(|j| j.status == JobStatus::Processing)
                    .filter(|j| j.claim.map_or(true, |c| c.claimed_at < before))
                    .cloned(),
            );
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Claim;
    use crate::store::GarrisonDelta;
    use crate::world::{Coordinate, Mission, UnitStack};
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn store_with_village() -> MemoryStore {
        let store = MemoryStore::new();
        let mut garrison = Garrison::new();
        garrison.insert("warrior".into(), 50);
        store.insert_village(
            Village {
                id: 1,
                owner_id: Uuid::new_v4(),
                name: "Home".into(),
                coord: Coordinate::new(0, 0),
                fortification: 0,
            },
            garrison,
            BTreeMap::new(),
        );
        store
    }

    fn movement(status: MovementStatus) -> Movement {
        Movement {
            id: Uuid::new_v4(),
            owner_account_id: Uuid::new_v4(),
            from_village_id: 1,
            to_village_id: 2,
            mission: Mission::Support,
            stacks: vec![UnitStack::new("warrior", 5)],
            depart_at: now(),
            arrive_at: now() + Duration::minutes(10),
            status,
            claim: None,
            parent_id: None,
            outcome: None,
            failure: None,
            finished_at: None,
        }
    }

    fn job(village: VillageId, seq: u64, due_at: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::new_v4(),
            kind: JobKind::Building,
            owner_village_id: village,
            seq,
            duration_ms: 60_000,
            due_at,
            status: JobStatus::Pending,
            claim: None,
            payload: JobPayload::Build {
                building: "barracks".into(),
                target_level: seq as u8 + 1,
            },
            created_at: now(),
            finished_at: None,
            failure: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn effect_is_applied_once_per_op_key() {
        let store = store_with_village();
        let op = OpKey("test:once".into());
        let effect = VillageEffect::remove(&[UnitStack::new("warrior", 20)]);

        assert_eq!(
            store.apply_village_effect(1, &op, &effect).await.unwrap(),
            EffectOutcome::Applied
        );
        assert_eq!(
            store.apply_village_effect(1, &op, &effect).await.unwrap(),
            EffectOutcome::AlreadyApplied
        );
        assert_eq!(store.garrison(1).await.unwrap()[&"warrior".into()], 30);
        assert!(store.op_applied(1, &op).await.unwrap());
    }

    #[tokio::test]
    async fn insufficient_effect_changes_nothing() {
        let store = store_with_village();
        let effect = VillageEffect {
            garrison: vec![
                GarrisonDelta {
                    unit: "scout".into(),
                    delta: 3,
                },
                GarrisonDelta {
                    unit: "warrior".into(),
                    delta: -51,
                },
            ],
            ..Default::default()
        };

        let err = store
            .apply_village_effect(1, &OpKey("test:too-many".into()), &effect)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Insufficient { available: 50, .. }));

        let garrison = store.garrison(1).await.unwrap();
        assert_eq!(garrison[&"warrior".into()], 50);
        assert!(!garrison.contains_key(&"scout".into()));
    }

    #[tokio::test]
    async fn movement_cas_admits_one_winner() {
        let store = MemoryStore::new();
        let m = movement(MovementStatus::InTransit);
        assert!(store.insert_movement(&m).await.unwrap());
        assert!(!store.insert_movement(&m).await.unwrap());

        let claim = Claim::new(now());
        let claimed = store
            .transition_movement(
                m.id,
                MovementTransition::new(MovementStatus::CLAIMABLE, MovementStatus::Processing, now())
                    .with_claim(claim),
            )
            .await;
        assert_ok!(claimed);

        let second = store
            .transition_movement(
                m.id,
                MovementTransition::new(MovementStatus::CLAIMABLE, MovementStatus::Processing, now())
                    .with_claim(Claim::new(now())),
            )
            .await;
        assert_err!(second);

        let wrong_token = store
            .transition_movement(
                m.id,
                MovementTransition::new(&[MovementStatus::Processing], MovementStatus::Arrived, now())
                    .claimed_by(Uuid::new_v4()),
            )
            .await;
        assert!(matches!(wrong_token, Err(StoreError::Conflict { .. })));

        let done = store
            .transition_movement(
                m.id,
                MovementTransition::new(&[MovementStatus::Processing], MovementStatus::Arrived, now())
                    .claimed_by(claim.token),
            )
            .await
            .unwrap();
        assert_eq!(done.finished_at, Some(now()));
    }

    #[tokio::test]
    async fn due_movements_are_ordered_and_filtered() {
        let store = MemoryStore::new();
        let mut early = movement(MovementStatus::InTransit);
        early.arrive_at = now() - Duration::minutes(5);
        let mut late = movement(MovementStatus::Returning);
        late.arrive_at = now() - Duration::minutes(1);
        let future = movement(MovementStatus::InTransit);
        let mut done = movement(MovementStatus::Arrived);
        done.arrive_at = now() - Duration::minutes(9);

        for m in [&late, &future, &done, &early] {
            store.insert_movement(m).await.unwrap();
        }

        assert_eq!(
            store.due_movements(now(), 10).await.unwrap(),
            vec![early.id, late.id]
        );
        assert_eq!(store.due_movements(now(), 1).await.unwrap(), vec![early.id]);
    }

    #[tokio::test]
    async fn insert_job_checks_the_tail() {
        let store = store_with_village();
        let first = job(1, 0, now() + Duration::minutes(1));
        assert_ok!(store.insert_job(&first, None).await);

        let second = job(1, 1, now() + Duration::minutes(2));
        assert!(matches!(
            store.insert_job(&second, None).await,
            Err(StoreError::Conflict { .. })
        ));
        let guard = TailGuard {
            job_id: first.id,
            version: 0,
        };
        assert_ok!(store.insert_job(&second, Some(guard)).await);
        assert_eq!(store.active_queue(1, JobKind::Building).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reschedule_is_all_or_nothing() {
        let store = store_with_village();
        let a = job(1, 0, now() + Duration::minutes(1));
        let b = job(1, 1, now() + Duration::minutes(2));
        store.insert_job(&a, None).await.unwrap();
        store
            .insert_job(
                &b,
                Some(TailGuard {
                    job_id: a.id,
                    version: 0,
                }),
            )
            .await
            .unwrap();

        let stale_shift = DueShift {
            job_id: b.id,
            expected_version: 7,
            due_at: now() + Duration::minutes(1),
            target_level: Some(1),
        };
        assert_err!(store.cancel_and_reschedule(a.id, 0, &[stale_shift], now()).await);
        assert_eq!(store.job(a.id).await.unwrap().unwrap().status, JobStatus::Pending);

        let shift = DueShift {
            expected_version: 0,
            ..stale_shift
        };
        assert_ok!(store.cancel_and_reschedule(a.id, 0, &[shift], now()).await);
        assert_eq!(store.job(a.id).await.unwrap().unwrap().status, JobStatus::Cancelled);
        let b = store.job(b.id).await.unwrap().unwrap();
        assert_eq!(b.due_at, now() + Duration::minutes(1));
        assert_eq!(
            b.payload,
            JobPayload::Build {
                building: "barracks".into(),
                target_level: 1
            }
        );
    }

    #[tokio::test]
    async fn job_claims_do_not_go_back_to_pending() {
        let store = store_with_village();
        let a = job(1, 0, now());
        store.insert_job(&a, None).await.unwrap();

        let claim = Claim::new(now());
        store
            .transition_job(
                a.id,
                JobTransition::new(JobStatus::Pending, JobStatus::Processing, now()).with_claim(claim),
            )
            .await
            .unwrap();

        assert_err!(
            store
                .transition_job(a.id, JobTransition::new(JobStatus::Processing, JobStatus::Pending, now()))
                .await
        );
        assert_eq!(store.stale_jobs(now() + Duration::seconds(1)).await.unwrap().len(), 1);
        assert!(store.due_jobs(now(), 10).await.unwrap().is_empty());
    }
}
