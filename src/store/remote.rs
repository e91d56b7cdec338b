//! PostgREST-backed world store
//!
//! Single-row status changes are conditional PATCHes whose filter carries the
//! expected status (and claim token or version); an empty result means the
//! condition failed. Writes that touch several rows at once go through the
//! database functions in `sql/schema.sql`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{Claim, JobId, JobKind, JobPayload, JobStatus, ScheduledJob};
use crate::rally::{Movement, MovementId, MovementStatus};
use crate::world::{
    AccountId, CombatOutcome, Coordinate, Garrison, Mission, UnitStack, Village, VillageId,
};

use super::{
    DueShift, EffectOutcome, JobTransition, MovementTransition, OpKey, PostgrestClient,
    StoreError, StoreResult, TailGuard, VillageEffect, WorldStore,
};

const VILLAGES: &str = "villages";
const VILLAGE_OPS: &str = "village_ops";
const MOVEMENTS: &str = "movements";
const JOBS: &str = "queue_jobs";

#[derive(Debug, Deserialize)]
struct VillageRow {
    id: VillageId,
    owner_id: AccountId,
    name: String,
    x: i32,
    y: i32,
    #[serde(default)]
    fortification: u32,
    #[serde(default)]
    garrison: Garrison,
    #[serde(default)]
    buildings: BTreeMap<String, u8>,
}

impl From<VillageRow> for Village {
    fn from(row: VillageRow) -> Self {
        Village {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            coord: Coordinate::new(row.x, row.y),
            fortification: row.fortification,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MovementRow {
    id: MovementId,
    owner_account_id: AccountId,
    from_village_id: VillageId,
    to_village_id: VillageId,
    mission: Mission,
    stacks: Vec<UnitStack>,
    depart_at: DateTime<Utc>,
    arrive_at: DateTime<Utc>,
    status: MovementStatus,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    parent_id: Option<MovementId>,
    outcome: Option<CombatOutcome>,
    failure: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<&Movement> for MovementRow {
    fn from(m: &Movement) -> Self {
        MovementRow {
            id: m.id,
            owner_account_id: m.owner_account_id,
            from_village_id: m.from_village_id,
            to_village_id: m.to_village_id,
            mission: m.mission,
            stacks: m.stacks.clone(),
            depart_at: m.depart_at,
            arrive_at: m.arrive_at,
            status: m.status,
            claim_token: m.claim.map(|c| c.token),
            claimed_at: m.claim.map(|c| c.claimed_at),
            parent_id: m.parent_id,
            outcome: m.outcome.clone(),
            failure: m.failure.clone(),
            finished_at: m.finished_at,
        }
    }
}

impl From<MovementRow> for Movement {
    fn from(row: MovementRow) -> Self {
        Movement {
            id: row.id,
            owner_account_id: row.owner_account_id,
            from_village_id: row.from_village_id,
            to_village_id: row.to_village_id,
            mission: row.mission,
            stacks: row.stacks,
            depart_at: row.depart_at,
            arrive_at: row.arrive_at,
            status: row.status,
            claim: claim_of(row.claim_token, row.claimed_at),
            parent_id: row.parent_id,
            outcome: row.outcome,
            failure: row.failure,
            finished_at: row.finished_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    id: JobId,
    kind: JobKind,
    owner_village_id: VillageId,
    seq: u64,
    duration_ms: i64,
    due_at: DateTime<Utc>,
    status: JobStatus,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    payload: JobPayload,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failure: Option<String>,
    version: u64,
}

impl From<&ScheduledJob> for JobRow {
    fn from(j: &ScheduledJob) -> Self {
        JobRow {
            id: j.id,
            kind: j.kind,
            owner_village_id: j.owner_village_id,
            seq: j.seq,
            duration_ms: j.duration_ms,
            due_at: j.due_at,
            status: j.status,
            claim_token: j.claim.map(|c| c.token),
            claimed_at: j.claim.map(|c| c.claimed_at),
            payload: j.payload.clone(),
            created_at: j.created_at,
            finished_at: j.finished_at,
            failure: j.failure.clone(),
            version: j.version,
        }
    }
}

impl From<JobRow> for ScheduledJob {
    fn from(row: JobRow) -> Self {
        ScheduledJob {
            id: row.id,
            kind: row.kind,
            owner_village_id: row.owner_village_id,
            seq: row.seq,
            duration_ms: row.duration_ms,
            due_at: row.due_at,
            status: row.status,
            claim: claim_of(row.claim_token, row.claimed_at),
            payload: row.payload,
            created_at: row.created_at,
            finished_at: row.finished_at,
            failure: row.failure,
            version: row.version,
        }
    }
}

fn claim_of(token: Option<Uuid>, claimed_at: Option<DateTime<Utc>>) -> Option<Claim> {
    match (token, claimed_at) {
        (Some(token), Some(claimed_at)) => Some(Claim { token, claimed_at }),
        _ => None,
    }
}

/// Partial row written by a status change
#[derive(Debug, Serialize)]
struct StatusPatch<S> {
    status: S,
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_token: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<CombatOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

/// Error payload PostgREST returns when a database function raises
#[derive(Debug, Deserialize)]
struct PgError {
    message: String,
}

/// Turn the `kind:detail` messages raised by the database functions back into
/// store errors
fn rpc_error(error: StoreError) -> StoreError {
    let StoreError::Api { body, .. } = &error else {
        return error;
    };
    let Ok(pg) = serde_json::from_str::<PgError>(body) else {
        return error;
    };
    let mut parts = pg.message.splitn(4, ':');
    match parts.next() {
        Some("insufficient") => {
            let unit = parts.next().unwrap_or_default().to_string();
            let requested = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let available = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            StoreError::Insufficient {
                unit,
                requested,
                available,
            }
        }
        Some("conflict") => StoreError::Conflict {
            expected: parts.next().unwrap_or_default().to_string(),
            actual: parts.next().unwrap_or_default().to_string(),
        },
        Some("not_found") => StoreError::NotFound(parts.next().unwrap_or_default().to_string()),
        Some("rejected") => StoreError::Rejected(parts.next().unwrap_or_default().to_string()),
        _ => error,
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn status_list(statuses: &[MovementStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

pub struct PostgrestStore {
    client: PostgrestClient,
}

impl PostgrestStore {
    pub fn new(client: PostgrestClient) -> Self {
        Self { client }
    }

    async fn village_row(&self, id: VillageId) -> StoreResult<VillageRow> {
        self.client
            .get_one(VILLAGES, &format!("id=eq.{}", id))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("village {}", id)))
    }
}

#[async_trait]
impl WorldStore for PostgrestStore {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn village(&self, id: VillageId) -> StoreResult<Option<Village>> {
        let row: Option<VillageRow> = self.client.get_one(VILLAGES, &format!("id=eq.{}", id)).await?;
        Ok(row.map(Village::from))
    }

    async fn garrison(&self, id: VillageId) -> StoreResult<Garrison> {
        Ok(self.village_row(id).await?.garrison)
    }

    async fn buildings(&self, id: VillageId) -> StoreResult<BTreeMap<String, u8>> {
        Ok(self.village_row(id).await?.buildings)
    }

    async fn apply_village_effect(
        &self,
        village: VillageId,
        op: &OpKey,
        effect: &VillageEffect,
    ) -> StoreResult<EffectOutcome> {
        let args = serde_json::json!({
            "p_village_id": village,
            "p_op_key": op,
            "p_effect": effect,
        });
        let applied: bool = self
            .client
            .rpc("apply_village_effect", &args)
            .await
            .map_err(rpc_error)?;
        Ok(if applied {
            EffectOutcome::Applied
        } else {
            EffectOutcome::AlreadyApplied
        })
    }

    async fn op_applied(&self, village: VillageId, op: &OpKey) -> StoreResult<bool> {
        #[derive(Deserialize)]
        struct OpRow {
            #[allow(dead_code)]
            op_key: String,
        }
        let row: Option<OpRow> = self
            .client
            .get_one(
                VILLAGE_OPS,
                &format!("select=op_key&village_id=eq.{}&op_key=eq.{}", village, op),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn insert_movement(&self, movement: &Movement) -> StoreResult<bool> {
        let written: Vec<MovementRow> = self
            .client
            .insert_ignoring_duplicates(MOVEMENTS, &MovementRow::from(movement))
            .await?;
        Ok(!written.is_empty())
    }

    async fn movement(&self, id: MovementId) -> StoreResult<Option<Movement>> {
        let row: Option<MovementRow> = self.client.get_one(MOVEMENTS, &format!("id=eq.{}", id)).await?;
        Ok(row.map(Movement::from))
    }

    async fn transition_movement(
        &self,
        id: MovementId,
        transition: MovementTransition,
    ) -> StoreResult<Movement> {
        let mut filter = format!("id=eq.{}&status=in.({})", id, status_list(transition.expected));
        if let Some(token) = transition.expected_claim {
            filter.push_str(&format!("&claim_token=eq.{}", token));
        }

        let patch = StatusPatch {
            status: transition.status,
            claim_token: transition.claim.map(|c| c.token),
            claimed_at: transition.claim.map(|c| c.claimed_at),
            outcome: transition.outcome,
            failure: transition.failure,
            finished_at: transition.status.is_terminal().then_some(transition.at),
            version: None,
        };

        let mut updated: Vec<MovementRow> = self.client.update_where(MOVEMENTS, &filter, &patch).await?;
        match updated.pop() {
            Some(row) => Ok(row.into()),
            None => match self.movement(id).await? {
                Some(current) => Err(StoreError::conflict(transition.expected, current.status)),
                None => Err(StoreError::NotFound(format!("movement {}", id))),
            },
        }
    }

    async fn due_movements(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<MovementId>> {
        #[derive(Deserialize)]
        struct IdRow {
            id: MovementId,
        }
        let rows: Vec<IdRow> = self
            .client
            .get(
                MOVEMENTS,
                &format!(
                    "select=id&status=in.({})&arrive_at=lte.{}&order=arrive_at.asc,id.asc&limit={}",
                    status_list(MovementStatus::CLAIMABLE),
                    ts(now),
                    limit
                ),
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn stuck_movements(
        &self,
        status: MovementStatus,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Movement>> {
        let age_column = match status {
            MovementStatus::Processing => "claimed_at",
            _ => "depart_at",
        };
        let rows: Vec<MovementRow> = self
            .client
            .get(
                MOVEMENTS,
                &format!("status=eq.{}&{}=lt.{}", status.as_str(), age_column, ts(before)),
            )
            .await?;
        Ok(rows.into_iter().map(Movement::from).collect())
    }

    async fn insert_job(&self, job: &ScheduledJob, tail: Option<TailGuard>) -> StoreResult<()> {
        let args = serde_json::json!({
            "p_job": JobRow::from(job),
            "p_tail_id": tail.map(|t| t.job_id),
            "p_tail_version": tail.map(|t| t.version),
        });
        let appended: bool = self
            .client
            .rpc("append_queue_job", &args)
            .await
            .map_err(rpc_error)?;
        if appended {
            Ok(())
        } else {
            Err(StoreError::conflict(tail, "a different queue tail"))
        }
    }

    async fn job(&self, id: JobId) -> StoreResult<Option<ScheduledJob>> {
        let row: Option<JobRow> = self.client.get_one(JOBS, &format!("id=eq.{}", id)).await?;
        Ok(row.map(ScheduledJob::from))
    }

    async fn active_queue(&self, village: VillageId, kind: JobKind) -> StoreResult<Vec<ScheduledJob>> {
        let rows: Vec<JobRow> = self
            .client
            .get(
                JOBS,
                &format!(
                    "owner_village_id=eq.{}&kind=eq.{}&status=in.(pending,processing)&order=seq.asc",
                    village,
                    kind.as_str()
                ),
            )
            .await?;
        Ok(rows.into_iter().map(ScheduledJob::from).collect())
    }

    async fn transition_job(&self, id: JobId, transition: JobTransition) -> StoreResult<ScheduledJob> {
        let current = self
            .job(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        if current.status != transition.expected || !current.status.can_transition_to(transition.status)
        {
            return Err(StoreError::conflict(transition.expected, current.status));
        }

        let mut filter = format!(
            "id=eq.{}&status=eq.{}&version=eq.{}",
            id,
            transition.expected.as_str(),
            current.version
        );
        if let Some(token) = transition.expected_claim {
            filter.push_str(&format!("&claim_token=eq.{}", token));
        }

        let patch = StatusPatch {
            status: transition.status,
            claim_token: transition.claim.map(|c| c.token),
            claimed_at: transition.claim.map(|c| c.claimed_at),
            outcome: None,
            failure: transition.failure,
            finished_at: transition.status.is_terminal().then_some(transition.at),
            version: Some(current.version + 1),
        };

        let mut updated: Vec<JobRow> = self.client.update_where(JOBS, &filter, &patch).await?;
        updated
            .pop()
            .map(ScheduledJob::from)
            .ok_or_else(|| StoreError::conflict(transition.expected, "concurrent change"))
    }

    async fn cancel_and_reschedule(
        &self,
        id: JobId,
        expected_version: u64,
        shifts: &[DueShift],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let args = serde_json::json!({
            "p_job_id": id,
            "p_expected_version": expected_version,
            "p_shifts": shifts,
            "p_at": at,
        });
        let done: bool = self
            .client
            .rpc("cancel_queue_job", &args)
            .await
            .map_err(rpc_error)?;
        if done {
            Ok(())
        } else {
            Err(StoreError::conflict(
                format!("version {}", expected_version),
                "queue changed",
            ))
        }
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<(JobKind, JobId)>> {
        #[derive(Deserialize)]
        struct DueRow {
            id: JobId,
            kind: JobKind,
        }
        let rows: Vec<DueRow> = self
            .client
            .get(
                JOBS,
                &format!(
                    "select=id,kind&status=eq.pending&due_at=lte.{}&order=due_at.asc,id.asc&limit={}",
                    ts(now),
                    limit
                ),
            )
            .await?;
        Ok(rows.into_iter().map(|r| (r.kind, r.id)).collect())
    }

    async fn stale_jobs(&self, before: DateTime<Utc>) -> StoreResult<Vec<ScheduledJob>> {
        let rows: Vec<JobRow> = self
            .client
            .get(JOBS, &format!("status=eq.processing&claimed_at=lt.{}", ts(before)))
            .await?;
        Ok(rows.into_iter().map(ScheduledJob::from).collect())
    }
}
