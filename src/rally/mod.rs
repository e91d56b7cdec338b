//! Rally point: troop movements between villages

pub mod engine;

pub use engine::{
    CancelMode, CancelPolicy, MovementRecovery, RallyPointEngine, SendReceipt, TravelPreview,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::Claim;
use crate::world::{AccountId, CombatOutcome, Mission, UnitStack, VillageId};

pub type MovementId = Uuid;

/// Movement lifecycle.
///
/// `Queued` is the short-lived state between record creation and garrison
/// commit. `Processing` is the tick claim. `Arrived`, `Cancelled` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementStatus {
    Queued,
    InTransit,
    Processing,
    Arrived,
    Cancelled,
    Returning,
    Failed,
}

impl MovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementStatus::Queued => "queued",
            MovementStatus::InTransit => "in_transit",
            MovementStatus::Processing => "processing",
            MovementStatus::Arrived => "arrived",
            MovementStatus::Cancelled => "cancelled",
            MovementStatus::Returning => "returning",
            MovementStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MovementStatus::Arrived | MovementStatus::Cancelled | MovementStatus::Failed
        )
    }

    /// Statuses a tick may claim once `arrive_at` has passed
    pub const CLAIMABLE: &'static [MovementStatus] =
        &[MovementStatus::InTransit, MovementStatus::Returning];
}

/// Troops on the road
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub owner_account_id: AccountId,
    pub from_village_id: VillageId,
    pub to_village_id: VillageId,
    pub mission: Mission,
    pub stacks: Vec<UnitStack>,
    pub depart_at: DateTime<Utc>,
    pub arrive_at: DateTime<Utc>,
    pub status: MovementStatus,
    pub claim: Option<Claim>,
    /// Movement this return leg belongs to
    pub parent_id: Option<MovementId>,
    /// Battle result, written before any garrison change of an attack
    pub outcome: Option<CombatOutcome>,
    pub failure: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Movement {
    pub fn duration_ms(&self) -> i64 {
        (self.arrive_at - self.depart_at).num_milliseconds()
    }
}

/// Deterministic id for a follow-up leg of `parent`
pub fn leg_id(parent: MovementId, leg: &str) -> MovementId {
    Uuid::new_v5(&parent, leg.as_bytes())
}
