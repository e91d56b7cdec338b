//! Travel time between villages

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::game::GameConfig;
use crate::error::{EngineError, EngineResult};

use super::coords::Coordinate;
use super::distance::DistanceCache;
use super::units::{Mission, UnitStack};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Input to a travel computation
#[derive(Debug, Clone)]
pub struct TravelRequest<'a> {
    pub from: Coordinate,
    pub to: Coordinate,
    pub stacks: &'a [UnitStack],
    pub mission: Mission,
    /// Departure instant; callers pass the clock's `now`
    pub depart_at: DateTime<Utc>,
}

/// Computed schedule for a movement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TravelPlan {
    pub distance: u64,
    pub slowest_speed: f64,
    pub duration_hours: f64,
    pub duration_ms: i64,
    pub depart_at: DateTime<Utc>,
    pub arrive_at: DateTime<Utc>,
}

/// Converts stacks and distance into a travel schedule.
///
/// Pure for a fixed `depart_at`, so a recomputation always matches an
/// already persisted movement.
#[derive(Debug, Clone)]
pub struct TravelCalculator {
    distances: Arc<DistanceCache>,
}

impl TravelCalculator {
    pub fn new(distances: Arc<DistanceCache>) -> Self {
        Self { distances }
    }

    pub fn distances(&self) -> &DistanceCache {
        &self.distances
    }

    pub fn compute_travel(
        &self,
        request: &TravelRequest<'_>,
        config: &GameConfig,
    ) -> EngineResult<TravelPlan> {
        let slowest_speed = slowest_speed(request.stacks, config)?;

        let server_speed = config.globals.server_speed;
        if !server_speed.is_finite() || server_speed <= 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "server speed {} is not usable",
                server_speed
            )));
        }

        // Committed travel never uses the approximation.
        let distance = self.distances.exact(request.from, request.to);
        let duration_hours = distance as f64 / slowest_speed / server_speed;

        // At least one millisecond so arrival is strictly after departure.
        let duration_ms = ((duration_hours * MILLIS_PER_HOUR).ceil() as i64).max(1);
        let arrive_at = request.depart_at + Duration::milliseconds(duration_ms);

        tracing::trace!(
            mission = request.mission.as_str(),
            distance,
            slowest_speed,
            duration_ms,
            "Computed travel"
        );

        Ok(TravelPlan {
            distance,
            slowest_speed,
            duration_hours,
            duration_ms,
            depart_at: request.depart_at,
            arrive_at,
        })
    }
}

/// Minimum speed among the unit types present with a positive count
pub fn slowest_speed(stacks: &[UnitStack], config: &GameConfig) -> EngineResult<f64> {
    let mut slowest: Option<f64> = None;

    for stack in stacks.iter().filter(|s| s.count > 0) {
        let stats = config
            .unit(&stack.unit)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown unit type {}", stack.unit)))?;
        let speed = stats.speed_tiles_per_hour;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "unit type {} has no usable speed",
                stack.unit
            )));
        }
        slowest = Some(slowest.map_or(speed, |s: f64| s.min(speed)));
    }

    slowest.ok_or_else(|| EngineError::InvalidInput("stacks must not be empty".into()))
}
