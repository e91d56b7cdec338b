//! World model: coordinates, unit stacks, distance and travel time, combat

pub mod combat;
pub mod coords;
pub mod distance;
pub mod travel;
pub mod units;

pub use combat::{CombatContext, CombatOutcome, CombatResolver, PowerCombat};
pub use coords::{Coordinate, WorldBounds};
pub use distance::{DistanceCache, DistanceResult};
pub use travel::{TravelCalculator, TravelPlan, TravelRequest};
pub use units::{Garrison, Mission, UnitStack, UnitTypeId};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AccountId = Uuid;
pub type VillageId = u32;

/// A village as the engine sees it: an owner and a fixed map position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Village {
    pub id: VillageId,
    pub owner_id: AccountId,
    pub name: String,
    pub coord: Coordinate,
    /// Wall bonus used by combat, in percent
    #[serde(default)]
    pub fortification: u32,
}
