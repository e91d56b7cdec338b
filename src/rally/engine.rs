//! Movement lifecycle: send, cancel, arrival and recovery

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::game::GameConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::{Claim, ProcessOutcome};
use crate::store::{MovementTransition, OpKey, StoreError, VillageEffect, WorldStore};
use crate::util::time::Clock;
use crate::world::units::normalize_stacks;
use crate::world::{
    AccountId, CombatContext, CombatResolver, DistanceResult, Mission, TravelCalculator,
    TravelPlan, TravelRequest, UnitStack, Village, VillageId,
};

use super::{leg_id, Movement, MovementId, MovementStatus};

/// What happens to troops whose march is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Troops walk back for as long as they had been marching
    TravelBack,
    /// Troops are home again immediately
    Instant,
}

impl std::str::FromStr for CancelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "return" | "travel_back" => Ok(CancelMode::TravelBack),
            "instant" => Ok(CancelMode::Instant),
            other => Err(format!("unknown cancel mode {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CancelPolicy {
    /// Share of the journey during which a cancel is accepted
    pub window_fraction: f64,
    pub mode: CancelMode,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            window_fraction: 0.5,
            mode: CancelMode::TravelBack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReceipt {
    pub movement_id: MovementId,
    pub depart_at: DateTime<Utc>,
    pub arrive_at: DateTime<Utc>,
}

/// Travel estimate shown before sending
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TravelPreview {
    pub distance: DistanceResult,
    pub plan: TravelPlan,
}

/// Approximate distances may be shown while the heuristic is off by at most this
const PREVIEW_APPROXIMATION_TOLERANCE: u64 = 2;

/// Movements resolved by a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MovementRecovery {
    /// Stale PROCESSING claims taken over and finished
    pub resumed: usize,
    /// QUEUED records settled to IN_TRANSIT/RETURNING or CANCELLED
    pub settled: usize,
}

const PROCESSING: &[MovementStatus] = &[MovementStatus::Processing];
const QUEUED: &[MovementStatus] = &[MovementStatus::Queued];
const IN_TRANSIT: &[MovementStatus] = &[MovementStatus::InTransit];

pub struct RallyPointEngine {
    store: Arc<dyn WorldStore>,
    travel: TravelCalculator,
    combat: Arc<dyn CombatResolver>,
    config: Arc<GameConfig>,
    clock: Arc<dyn Clock>,
    policy: CancelPolicy,
}

impl RallyPointEngine {
    pub fn new(
        store: Arc<dyn WorldStore>,
        travel: TravelCalculator,
        combat: Arc<dyn CombatResolver>,
        config: Arc<GameConfig>,
        clock: Arc<dyn Clock>,
        policy: CancelPolicy,
    ) -> Self {
        Self {
            store,
            travel,
            combat,
            config,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> CancelPolicy {
        self.policy
    }

    /// Send troops from one village to another.
    ///
    /// The movement is written as QUEUED, the garrison is decremented under an
    /// op key, and only then does the movement go IN_TRANSIT.
    pub async fn send_movement(
        &self,
        owner_account_id: AccountId,
        from_village_id: VillageId,
        to_village_id: VillageId,
        stacks: &[UnitStack],
        mission: Mission,
    ) -> EngineResult<SendReceipt> {
        if mission == Mission::Return {
            return Err(EngineError::InvalidInput(
                "return legs are scheduled by the engine".into(),
            ));
        }
        let stacks = normalize_stacks(stacks)?;

        let origin = self
            .store
            .village(from_village_id)
            .await?
            .ok_or(EngineError::Unauthorized)?;
        if origin.owner_id != owner_account_id {
            warn!(account_id = %owner_account_id, "Send rejected: not the origin owner");
            return Err(EngineError::Unauthorized);
        }

        let target = self
            .store
            .village(to_village_id)
            .await?
            .ok_or_else(|| EngineError::InvalidDestination("unknown village".into()))?;
        self.validate_destination(&origin, &target, mission)?;

        let garrison = self.store.garrison(from_village_id).await?;
        for stack in &stacks {
            let available = garrison.get(&stack.unit).copied().unwrap_or(0);
            if stack.count > available {
                return Err(EngineError::InsufficientTroops {
                    unit: stack.unit.to_string(),
                    requested: stack.count,
                    available,
                });
            }
        }

        let now = self.clock.now();
        let plan = self.travel.compute_travel(
            &TravelRequest {
                from: origin.coord,
                to: target.coord,
                stacks: &stacks,
                mission,
                depart_at: now,
            },
            &self.config,
        )?;

        let movement = Movement {
            id: Uuid::new_v4(),
            owner_account_id,
            from_village_id,
            to_village_id,
            mission,
            stacks,
            depart_at: plan.depart_at,
            arrive_at: plan.arrive_at,
            status: MovementStatus::Queued,
            claim: None,
            parent_id: None,
            outcome: None,
            failure: None,
            finished_at: None,
        };
        self.store.insert_movement(&movement).await?;

        let depart = VillageEffect::remove(&movement.stacks);
        if let Err(e) = self
            .store
            .apply_village_effect(from_village_id, &OpKey::depart(movement.id), &depart)
            .await
        {
            let abandon = MovementTransition::new(QUEUED, MovementStatus::Cancelled, now)
                .with_failure(e.to_string());
            if let Err(cancel_err) = self.store.transition_movement(movement.id, abandon).await {
                warn!(movement_id = %movement.id, error = %cancel_err, "Could not abandon queued movement");
            }
            return Err(match e {
                StoreError::Insufficient {
                    unit,
                    requested,
                    available,
                } => EngineError::InsufficientTroops {
                    unit,
                    requested: requested as u32,
                    available: available as u32,
                },
                other => other.into(),
            });
        }

        let dispatched = self
            .store
            .transition_movement(
                movement.id,
                MovementTransition::new(QUEUED, MovementStatus::InTransit, now),
            )
            .await;
        match dispatched {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                // A recovery pass settled the record first.
                let current = self.store.movement(movement.id).await?;
                match current.map(|m| m.status) {
                    Some(MovementStatus::Cancelled) => {
                        self.store
                            .apply_village_effect(
                                from_village_id,
                                &OpKey::rollback(movement.id),
                                &VillageEffect::add(&movement.stacks),
                            )
                            .await?;
                        return Err(EngineError::AlreadyProcessing);
                    }
                    Some(_) => {}
                    None => return Err(EngineError::NotFound(format!("movement {}", movement.id))),
                }
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            movement_id = %movement.id,
            account_id = %owner_account_id,
            from = from_village_id,
            to = to_village_id,
            mission = mission.as_str(),
            arrive_at = %movement.arrive_at,
            "Movement sent"
        );

        Ok(SendReceipt {
            movement_id: movement.id,
            depart_at: movement.depart_at,
            arrive_at: movement.arrive_at,
        })
    }

    /// Distance and arrival estimate for a march that is not sent
    pub async fn preview(
        &self,
        from_village_id: VillageId,
        to_village_id: VillageId,
        stacks: &[UnitStack],
        mission: Mission,
    ) -> EngineResult<TravelPreview> {
        let stacks = normalize_stacks(stacks)?;
        let origin = self
            .store
            .village(from_village_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("village {}", from_village_id)))?;
        let target = self
            .store
            .village(to_village_id)
            .await?
            .ok_or_else(|| EngineError::InvalidDestination("unknown village".into()))?;
        self.validate_destination(&origin, &target, mission)?;

        let distance = self.travel.distances().distance(
            origin.coord,
            target.coord,
            true,
            PREVIEW_APPROXIMATION_TOLERANCE,
        );
        let plan = self.travel.compute_travel(
            &TravelRequest {
                from: origin.coord,
                to: target.coord,
                stacks: &stacks,
                mission,
                depart_at: self.clock.now(),
            },
            &self.config,
        )?;
        Ok(TravelPreview { distance, plan })
    }

    fn validate_destination(
        &self,
        origin: &Village,
        target: &Village,
        mission: Mission,
    ) -> EngineResult<()> {
        let bounds = self.config.bounds();
        if !bounds.contains(&origin.coord) || !bounds.contains(&target.coord) {
            return Err(EngineError::InvalidDestination(format!(
                "{} is outside the world",
                target.coord
            )));
        }
        let same_place = origin.id == target.id || origin.coord == target.coord;
        if same_place && mission != Mission::Scout {
            return Err(EngineError::InvalidDestination(
                "destination is the origin village".into(),
            ));
        }
        Ok(())
    }

    /// Cancel a march early in its journey.
    ///
    /// A return leg is written first in QUEUED, then the march is moved to
    /// CANCELLED, then the leg is released. Losing the race to a tick claim
    /// surfaces as `ALREADY_PROCESSING`.
    pub async fn cancel_movement(
        &self,
        movement_id: MovementId,
        owner_account_id: AccountId,
    ) -> EngineResult<bool> {
        let movement = match self.store.movement(movement_id).await? {
            Some(m) if m.owner_account_id == owner_account_id => m,
            _ => {
                warn!(account_id = %owner_account_id, "Cancel rejected");
                return Err(EngineError::Unauthorized);
            }
        };

        match movement.status {
            MovementStatus::InTransit => {}
            MovementStatus::Processing => return Err(EngineError::AlreadyProcessing),
            _ => return Err(EngineError::CancelWindowExpired),
        }

        let now = self.clock.now();
        let elapsed_ms = (now - movement.depart_at).num_milliseconds().max(0);
        let window_ms = movement.duration_ms() as f64 * self.policy.window_fraction;
        if now >= movement.arrive_at || elapsed_ms as f64 >= window_ms {
            return Err(EngineError::CancelWindowExpired);
        }

        let back_ms = match self.policy.mode {
            CancelMode::TravelBack => elapsed_ms.max(1),
            CancelMode::Instant => 1,
        };
        let leg = Movement {
            id: leg_id(movement.id, "cancel-return"),
            owner_account_id,
            from_village_id: movement.to_village_id,
            to_village_id: movement.from_village_id,
            mission: Mission::Return,
            stacks: movement.stacks.clone(),
            depart_at: now,
            arrive_at: now + Duration::milliseconds(back_ms),
            status: MovementStatus::Queued,
            claim: None,
            parent_id: Some(movement.id),
            outcome: None,
            failure: None,
            finished_at: None,
        };
        if !self.store.insert_movement(&leg).await? {
            // Left over from an earlier attempt; only a still-queued leg may be reused.
            let existing = self.store.movement(leg.id).await?.map(|m| m.status);
            if existing != Some(MovementStatus::Queued) {
                warn!(movement_id = %movement.id, leg_status = ?existing, "Return leg already settled");
                return Err(EngineError::CancelWindowExpired);
            }
        }

        let cancelled = self
            .store
            .transition_movement(
                movement.id,
                MovementTransition::new(IN_TRANSIT, MovementStatus::Cancelled, now),
            )
            .await;
        if let Err(e) = cancelled {
            if !matches!(e, StoreError::Conflict { .. }) {
                return Err(e.into());
            }
            let status = self.store.movement(movement.id).await?.map(|m| m.status);
            if status == Some(MovementStatus::Cancelled) {
                // A concurrent cancel owns the leg.
                return Err(EngineError::CancelWindowExpired);
            }
            if let Err(e) = self
                .store
                .transition_movement(
                    leg.id,
                    MovementTransition::new(QUEUED, MovementStatus::Cancelled, now),
                )
                .await
            {
                warn!(movement_id = %leg.id, error = %e, "Could not drop unused return leg");
            }
            debug!(movement_id = %movement.id, status = ?status, "Cancel lost to tick");
            return Err(match status {
                Some(MovementStatus::Processing) => EngineError::AlreadyProcessing,
                _ => EngineError::CancelWindowExpired,
            });
        }

        if let Err(e) = self
            .store
            .transition_movement(
                leg.id,
                MovementTransition::new(QUEUED, MovementStatus::Returning, now),
            )
            .await
        {
            let status = self.store.movement(leg.id).await?.map(|m| m.status);
            if status != Some(MovementStatus::Returning) {
                error!(movement_id = %leg.id, error = %e, "Return leg left queued; recovery will release it");
            }
        }

        info!(
            movement_id = %movement.id,
            return_leg = %leg.id,
            mode = ?self.policy.mode,
            "Movement cancelled"
        );

        if self.policy.mode == CancelMode::Instant {
            // The cancel is committed; a failed refund is left to the tick.
            if let Err(e) = self.claim_and_apply(leg.id, now).await {
                warn!(movement_id = %leg.id, error = %e, "Instant return deferred to tick");
            }
        }

        Ok(true)
    }

    /// Movement visible to its owner only
    pub async fn movement_for(
        &self,
        movement_id: MovementId,
        owner_account_id: AccountId,
    ) -> EngineResult<Movement> {
        match self.store.movement(movement_id).await? {
            Some(m) if m.owner_account_id == owner_account_id => Ok(m),
            _ => Err(EngineError::Unauthorized),
        }
    }

    /// Claim and apply one movement whose arrival time has passed
    pub async fn process_due(&self, movement_id: MovementId) -> EngineResult<ProcessOutcome> {
        let now = self.clock.now();
        match self.store.movement(movement_id).await? {
            Some(m) if m.arrive_at <= now => self.claim_and_apply(movement_id, now).await,
            _ => Ok(ProcessOutcome::Lost),
        }
    }

    async fn claim_and_apply(
        &self,
        movement_id: MovementId,
        now: DateTime<Utc>,
    ) -> EngineResult<ProcessOutcome> {
        let claim = Claim::new(now);
        let claimed = self
            .store
            .transition_movement(
                movement_id,
                MovementTransition::new(MovementStatus::CLAIMABLE, MovementStatus::Processing, now)
                    .with_claim(claim),
            )
            .await;

        match claimed {
            Ok(movement) => self.apply_claimed(movement, claim.token).await,
            Err(StoreError::Conflict { .. }) => {
                debug!(movement_id = %movement_id, "Claim lost");
                Ok(ProcessOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_claimed(&self, movement: Movement, token: Uuid) -> EngineResult<ProcessOutcome> {
        let id = movement.id;
        match self.apply_arrival(&movement, token).await {
            Ok(()) => {
                self.store
                    .transition_movement(
                        id,
                        MovementTransition::new(
                            PROCESSING,
                            MovementStatus::Arrived,
                            self.clock.now(),
                        )
                        .claimed_by(token),
                    )
                    .await?;
                info!(
                    movement_id = %id,
                    mission = movement.mission.as_str(),
                    village_id = movement.to_village_id,
                    "Movement arrived"
                );
                Ok(ProcessOutcome::Applied)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                error!(movement_id = %id, error = %e, "Arrival failed; parked for operator");
                self.store
                    .transition_movement(
                        id,
                        MovementTransition::new(PROCESSING, MovementStatus::Failed, self.clock.now())
                            .claimed_by(token)
                            .with_failure(e.to_string()),
                    )
                    .await?;
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    /// Arrival effects. Every write is idempotent so a recovery pass may run
    /// this again for the same claim.
    async fn apply_arrival(&self, movement: &Movement, token: Uuid) -> EngineResult<()> {
        let arrive = OpKey::arrive(movement.id);

        match movement.mission {
            Mission::Attack => {
                let outcome = match &movement.outcome {
                    Some(outcome) => outcome.clone(),
                    None => {
                        let target = self
                            .store
                            .village(movement.to_village_id)
                            .await?
                            .ok_or_else(|| EngineError::EffectFailed("target village is gone".into()))?;
                        let defending = self.store.garrison(movement.to_village_id).await?;
                        let context = CombatContext {
                            config: &self.config,
                            fortification: target.fortification,
                            seed: combat_seed(movement.id),
                        };
                        let outcome = self.combat.resolve(&movement.stacks, &defending, &context);

                        // Persist before touching any garrison so a replay reuses it.
                        self.store
                            .transition_movement(
                                movement.id,
                                MovementTransition::new(
                                    PROCESSING,
                                    MovementStatus::Processing,
                                    self.clock.now(),
                                )
                                .claimed_by(token)
                                .with_outcome(outcome.clone()),
                            )
                            .await?;
                        outcome
                    }
                };

                let losses = VillageEffect {
                    saturating: true,
                    ..VillageEffect::remove(&outcome.defender_losses)
                };
                self.store
                    .apply_village_effect(movement.to_village_id, &arrive, &losses)
                    .await?;

                info!(
                    movement_id = %movement.id,
                    attacker_won = outcome.attacker_won,
                    loot = outcome.loot,
                    "Battle resolved"
                );

                if !outcome.survivors_attacker.is_empty() {
                    self.schedule_return(movement, &outcome.survivors_attacker).await?;
                }
            }
            Mission::Scout => {
                let defending = self.store.garrison(movement.to_village_id).await?;
                info!(
                    movement_id = %movement.id,
                    village_id = movement.to_village_id,
                    defenders = defending.values().map(|c| u64::from(*c)).sum::<u64>(),
                    "Scouts reported"
                );
                self.schedule_return(movement, &movement.stacks).await?;
            }
            Mission::Support | Mission::Settle | Mission::Return => {
                self.store
                    .apply_village_effect(
                        movement.to_village_id,
                        &arrive,
                        &VillageEffect::add(&movement.stacks),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Send `stacks` home from the movement's destination
    async fn schedule_return(&self, movement: &Movement, stacks: &[UnitStack]) -> EngineResult<()> {
        let home = self
            .store
            .village(movement.from_village_id)
            .await?
            .ok_or_else(|| EngineError::EffectFailed("home village is gone".into()))?;
        let target = self
            .store
            .village(movement.to_village_id)
            .await?
            .ok_or_else(|| EngineError::EffectFailed("target village is gone".into()))?;

        // Departure is the arrival instant so a replay computes the same leg.
        let plan = self.travel.compute_travel(
            &TravelRequest {
                from: target.coord,
                to: home.coord,
                stacks,
                mission: Mission::Return,
                depart_at: movement.arrive_at,
            },
            &self.config,
        )?;

        let leg = Movement {
            id: leg_id(movement.id, "return"),
            owner_account_id: movement.owner_account_id,
            from_village_id: movement.to_village_id,
            to_village_id: movement.from_village_id,
            mission: Mission::Return,
            stacks: stacks.to_vec(),
            depart_at: plan.depart_at,
            arrive_at: plan.arrive_at,
            status: MovementStatus::Returning,
            claim: None,
            parent_id: Some(movement.id),
            outcome: None,
            failure: None,
            finished_at: None,
        };
        if self.store.insert_movement(&leg).await? {
            debug!(movement_id = %leg.id, arrive_at = %leg.arrive_at, "Return leg scheduled");
        }
        Ok(())
    }

    /// Finish movements left behind by a crashed or stalled actor.
    ///
    /// PROCESSING claims older than `before` are taken over and replayed;
    /// QUEUED records older than `before` are settled from what was committed.
    pub async fn recover_stale(&self, before: DateTime<Utc>) -> EngineResult<MovementRecovery> {
        let mut report = MovementRecovery::default();
        let now = self.clock.now();

        for stale in self
            .store
            .stuck_movements(MovementStatus::Processing, before)
            .await?
        {
            let Some(old) = stale.claim else { continue };
            let claim = Claim::new(now);
            let taken = self
                .store
                .transition_movement(
                    stale.id,
                    MovementTransition::new(PROCESSING, MovementStatus::Processing, now)
                        .claimed_by(old.token)
                        .with_claim(claim),
                )
                .await;
            match taken {
                Ok(movement) => {
                    warn!(movement_id = %movement.id, "Resuming stale claim");
                    self.apply_claimed(movement, claim.token).await?;
                    report.resumed += 1;
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        for queued in self.store.stuck_movements(MovementStatus::Queued, before).await? {
            let next = match queued.parent_id {
                Some(parent) => match self.store.movement(parent).await?.map(|p| p.status) {
                    Some(MovementStatus::Cancelled) => MovementStatus::Returning,
                    // The cancel may still be in flight.
                    Some(MovementStatus::Queued | MovementStatus::InTransit) => continue,
                    _ => MovementStatus::Cancelled,
                },
                None => {
                    let departed = self
                        .store
                        .op_applied(queued.from_village_id, &OpKey::depart(queued.id))
                        .await?;
                    if departed {
                        MovementStatus::InTransit
                    } else {
                        MovementStatus::Cancelled
                    }
                }
            };

            match self
                .store
                .transition_movement(queued.id, MovementTransition::new(QUEUED, next, now))
                .await
            {
                Ok(_) => {
                    warn!(movement_id = %queued.id, status = next.as_str(), "Settled queued movement");
                    report.settled += 1;
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}

fn combat_seed(id: MovementId) -> u64 {
    let (hi, lo) = id.as_u64_pair();
    hi ^ lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::util::time::ManualClock;
    use crate::world::{Coordinate, DistanceCache, Garrison, PowerCombat};
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: RallyPointEngine,
        alice: AccountId,
        bob: AccountId,
    }

    const HOME: VillageId = 1;
    const ALLY: VillageId = 2;
    const ENEMY: VillageId = 3;

    fn village(id: VillageId, owner: AccountId, x: i32, y: i32) -> Village {
        Village {
            id,
            owner_id: owner,
            name: format!("Village {}", id),
            coord: Coordinate::new(x, y),
            fortification: 0,
        }
    }

    fn garrison(entries: &[(&str, u32)]) -> Garrison {
        entries.iter().map(|(u, c)| ((*u).into(), *c)).collect()
    }

    fn fixture(policy: CancelPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store.insert_village(
            village(HOME, alice, 0, 0),
            garrison(&[("warrior", 100), ("scout", 10), ("axeman", 200)]),
            BTreeMap::new(),
        );
        store.insert_village(village(ALLY, alice, 6, 8), garrison(&[]), BTreeMap::new());
        store.insert_village(
            village(ENEMY, bob, -3, 4),
            garrison(&[("spearman", 20)]),
            BTreeMap::new(),
        );

        let engine = RallyPointEngine::new(
            store.clone(),
            TravelCalculator::new(Arc::new(DistanceCache::new())),
            Arc::new(PowerCombat),
            Arc::new(GameConfig::default()),
            clock.clone(),
            policy,
        );

        Fixture {
            store,
            clock,
            engine,
            alice,
            bob,
        }
    }

    async fn count(store: &MemoryStore, village: VillageId, unit: &str) -> u32 {
        store
            .garrison(village)
            .await
            .unwrap()
            .get(&unit.into())
            .copied()
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn support_conserves_troops() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 50)], Mission::Support)
            .await
            .unwrap();

        assert!(receipt.arrive_at > receipt.depart_at);
        assert_eq!(count(&f.store, HOME, "warrior").await, 50);
        assert_eq!(count(&f.store, ALLY, "warrior").await, 0);

        // Not due yet.
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Lost
        );

        f.clock.set(receipt.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Applied
        );
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Lost
        );

        assert_eq!(count(&f.store, HOME, "warrior").await, 50);
        assert_eq!(count(&f.store, ALLY, "warrior").await, 50);
        let m = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(m.status, MovementStatus::Arrived);
    }

    #[tokio::test]
    async fn send_validates_input() {
        let f = fixture(CancelPolicy::default());

        let err = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 101)], Mission::Support)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_TROOPS");

        let err = f
            .engine
            .send_movement(f.alice, HOME, HOME, &[UnitStack::new("warrior", 1)], Mission::Attack)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DESTINATION");

        let err = f
            .engine
            .send_movement(f.alice, HOME, 99, &[UnitStack::new("warrior", 1)], Mission::Attack)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DESTINATION");

        let err = f
            .engine
            .send_movement(f.bob, HOME, ENEMY, &[UnitStack::new("warrior", 1)], Mission::Attack)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let err = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[], Mission::Support)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        assert_eq!(count(&f.store, HOME, "warrior").await, 100);
    }

    #[tokio::test]
    async fn preview_matches_the_committed_schedule() {
        let f = fixture(CancelPolicy::default());
        let stacks = [UnitStack::new("warrior", 10)];
        let preview = f.engine.preview(HOME, ALLY, &stacks, Mission::Support).await.unwrap();
        assert!(!preview.distance.used_approximation);

        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &stacks, Mission::Support)
            .await
            .unwrap();
        assert_eq!(receipt.arrive_at, preview.plan.arrive_at);
    }

    #[tokio::test]
    async fn out_of_bounds_target_is_rejected() {
        let f = fixture(CancelPolicy::default());
        f.store.insert_village(village(9, f.bob, 500, 0), garrison(&[]), BTreeMap::new());

        let err = f
            .engine
            .send_movement(f.alice, HOME, 9, &[UnitStack::new("scout", 1)], Mission::Scout)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DESTINATION");
    }

    #[tokio::test]
    async fn cancel_inside_window_walks_troops_home() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(10));
        assert!(f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap());

        let original = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(original.status, MovementStatus::Cancelled);

        let leg = f
            .store
            .movement(leg_id(receipt.movement_id, "cancel-return"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leg.status, MovementStatus::Returning);
        assert_eq!(leg.to_village_id, HOME);
        assert_eq!(leg.arrive_at - leg.depart_at, Duration::minutes(10));

        f.clock.advance(Duration::minutes(10));
        assert_eq!(f.engine.process_due(leg.id).await.unwrap(), ProcessOutcome::Applied);
        assert_eq!(count(&f.store, HOME, "warrior").await, 100);
        assert_eq!(count(&f.store, ALLY, "warrior").await, 0);
    }

    #[tokio::test]
    async fn instant_cancel_refunds_immediately() {
        let f = fixture(CancelPolicy {
            window_fraction: 0.5,
            mode: CancelMode::Instant,
        });
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(30));
        assert!(f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap());
        assert_eq!(count(&f.store, HOME, "warrior").await, 100);
    }

    #[tokio::test]
    async fn cancel_guards() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        // Other accounts and unknown ids look the same.
        let err = f.engine.cancel_movement(receipt.movement_id, f.bob).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        let err = f.engine.cancel_movement(Uuid::new_v4(), f.bob).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        // Three quarters of the way.
        f.clock.set(receipt.depart_at + (receipt.arrive_at - receipt.depart_at) * 3 / 4);
        let err = f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap_err();
        assert_eq!(err.code(), "CANCEL_WINDOW_EXPIRED");
    }

    #[tokio::test]
    async fn cancel_after_claim_reports_already_processing() {
        let f = fixture(CancelPolicy {
            window_fraction: 1.0,
            mode: CancelMode::TravelBack,
        });
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        f.store
            .transition_movement(
                receipt.movement_id,
                MovementTransition::new(
                    MovementStatus::CLAIMABLE,
                    MovementStatus::Processing,
                    f.clock.now(),
                )
                .with_claim(Claim::new(f.clock.now())),
            )
            .await
            .unwrap();

        let err = f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSING");
        assert!(f
            .store
            .movement(leg_id(receipt.movement_id, "cancel-return"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn attack_survivors_return_home() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ENEMY, &[UnitStack::new("axeman", 200)], Mission::Attack)
            .await
            .unwrap();
        assert_eq!(count(&f.store, HOME, "axeman").await, 0);

        f.clock.set(receipt.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Applied
        );

        let attack = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        let outcome = attack.outcome.clone().unwrap();
        assert!(outcome.attacker_won);
        assert_eq!(count(&f.store, ENEMY, "spearman").await, 0);

        let leg = f
            .store
            .movement(leg_id(receipt.movement_id, "return"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leg.status, MovementStatus::Returning);
        assert_eq!(leg.depart_at, attack.arrive_at);
        assert_eq!(leg.stacks, outcome.survivors_attacker);

        f.clock.set(leg.arrive_at);
        assert_eq!(f.engine.process_due(leg.id).await.unwrap(), ProcessOutcome::Applied);
        assert_eq!(
            count(&f.store, HOME, "axeman").await,
            outcome.survivors_attacker[0].count
        );
    }

    #[tokio::test]
    async fn stale_claim_is_replayed_once() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 40)], Mission::Support)
            .await
            .unwrap();
        f.clock.set(receipt.arrive_at);

        // A tick that claimed and applied, then died before committing.
        let claim = Claim::new(f.clock.now());
        let claimed = f
            .store
            .transition_movement(
                receipt.movement_id,
                MovementTransition::new(
                    MovementStatus::CLAIMABLE,
                    MovementStatus::Processing,
                    f.clock.now(),
                )
                .with_claim(claim),
            )
            .await
            .unwrap();
        f.store
            .apply_village_effect(
                ALLY,
                &OpKey::arrive(claimed.id),
                &VillageEffect::add(&claimed.stacks),
            )
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(5));
        let report = f
            .engine
            .recover_stale(f.clock.now() - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(count(&f.store, ALLY, "warrior").await, 40);

        let again = f.engine.recover_stale(f.clock.now()).await.unwrap();
        assert_eq!(again, MovementRecovery::default());
        let m = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(m.status, MovementStatus::Arrived);
    }

    #[tokio::test]
    async fn queued_record_without_departure_is_cancelled() {
        let f = fixture(CancelPolicy::default());
        let now = f.clock.now();
        let orphan = Movement {
            id: Uuid::new_v4(),
            owner_account_id: f.alice,
            from_village_id: HOME,
            to_village_id: ALLY,
            mission: Mission::Support,
            stacks: vec![UnitStack::new("warrior", 5)],
            depart_at: now,
            arrive_at: now + Duration::hours(1),
            status: MovementStatus::Queued,
            claim: None,
            parent_id: None,
            outcome: None,
            failure: None,
            finished_at: None,
        };
        f.store.insert_movement(&orphan).await.unwrap();

        f.clock.advance(Duration::minutes(10));
        let report = f.engine.recover_stale(f.clock.now()).await.unwrap();
        assert_eq!(report.settled, 1);
        let m = f.store.movement(orphan.id).await.unwrap().unwrap();
        assert_eq!(m.status, MovementStatus::Cancelled);
        assert_eq!(count(&f.store, HOME, "warrior").await, 100);
    }

    #[tokio::test]
    async fn recovery_leaves_an_in_flight_cancel_leg_alone() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        // A cancel that wrote its leg and then stalled.
        f.clock.advance(Duration::minutes(5));
        let now = f.clock.now();
        let stalled = Movement {
            id: leg_id(receipt.movement_id, "cancel-return"),
            owner_account_id: f.alice,
            from_village_id: ALLY,
            to_village_id: HOME,
            mission: Mission::Return,
            stacks: vec![UnitStack::new("warrior", 30)],
            depart_at: now,
            arrive_at: now + Duration::minutes(5),
            status: MovementStatus::Queued,
            claim: None,
            parent_id: Some(receipt.movement_id),
            outcome: None,
            failure: None,
            finished_at: None,
        };
        f.store.insert_movement(&stalled).await.unwrap();

        f.clock.advance(Duration::minutes(6));
        let report = f.engine.recover_stale(f.clock.now()).await.unwrap();
        assert_eq!(report.settled, 0);
        let leg = f.store.movement(stalled.id).await.unwrap().unwrap();
        assert_eq!(leg.status, MovementStatus::Queued);

        // The retried cancel reuses the queued leg and the troops come home.
        assert!(f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap());
        let leg = f.store.movement(stalled.id).await.unwrap().unwrap();
        assert_eq!(leg.status, MovementStatus::Returning);

        f.clock.set(leg.arrive_at);
        assert_eq!(f.engine.process_due(leg.id).await.unwrap(), ProcessOutcome::Applied);
        assert_eq!(count(&f.store, HOME, "warrior").await, 100);
        assert_eq!(count(&f.store, ALLY, "warrior").await, 0);
    }

    #[tokio::test]
    async fn settled_leg_blocks_a_later_cancel() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        let now = f.clock.now();
        let dead = Movement {
            id: leg_id(receipt.movement_id, "cancel-return"),
            owner_account_id: f.alice,
            from_village_id: ALLY,
            to_village_id: HOME,
            mission: Mission::Return,
            stacks: vec![UnitStack::new("warrior", 30)],
            depart_at: now,
            arrive_at: now + Duration::minutes(1),
            status: MovementStatus::Cancelled,
            claim: None,
            parent_id: Some(receipt.movement_id),
            outcome: None,
            failure: None,
            finished_at: Some(now),
        };
        f.store.insert_movement(&dead).await.unwrap();

        f.clock.advance(Duration::minutes(1));
        let err = f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap_err();
        assert_eq!(err.code(), "CANCEL_WINDOW_EXPIRED");

        // The march is untouched and still delivers every warrior.
        let march = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(march.status, MovementStatus::InTransit);
        f.clock.set(march.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Applied
        );
        assert_eq!(count(&f.store, HOME, "warrior").await + count(&f.store, ALLY, "warrior").await, 100);
    }

    #[tokio::test]
    async fn instant_cancel_stands_when_the_refund_cannot_land() {
        let f = fixture(CancelPolicy {
            window_fraction: 0.5,
            mode: CancelMode::Instant,
        });
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 30)], Mission::Support)
            .await
            .unwrap();

        f.store.remove_village(HOME);
        f.clock.advance(Duration::seconds(30));
        assert!(f.engine.cancel_movement(receipt.movement_id, f.alice).await.unwrap());

        let march = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(march.status, MovementStatus::Cancelled);
    }

    #[tokio::test]
    async fn arrival_at_a_vanished_village_is_parked_as_failed() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ALLY, &[UnitStack::new("warrior", 20)], Mission::Support)
            .await
            .unwrap();

        f.store.remove_village(ALLY);
        f.clock.set(receipt.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Failed
        );

        let m = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        assert_eq!(m.status, MovementStatus::Failed);
        assert!(m.failure.is_some());

        // Never retried.
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Lost
        );
        assert_eq!(f.engine.recover_stale(f.clock.now()).await.unwrap(), MovementRecovery::default());
        assert_eq!(count(&f.store, HOME, "warrior").await, 80);
    }

    #[tokio::test]
    async fn scouts_report_and_come_back() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ENEMY, &[UnitStack::new("scout", 4)], Mission::Scout)
            .await
            .unwrap();
        assert_eq!(count(&f.store, HOME, "scout").await, 6);

        f.clock.set(receipt.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Applied
        );
        assert_eq!(count(&f.store, ENEMY, "spearman").await, 20);
        assert_eq!(count(&f.store, ENEMY, "scout").await, 0);

        let leg = f
            .store
            .movement(leg_id(receipt.movement_id, "return"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leg.stacks, vec![UnitStack::new("scout", 4)]);
        assert_eq!(leg.depart_at, receipt.arrive_at);

        f.clock.set(leg.arrive_at);
        assert_eq!(f.engine.process_due(leg.id).await.unwrap(), ProcessOutcome::Applied);
        assert_eq!(count(&f.store, HOME, "scout").await, 10);
    }

    #[tokio::test]
    async fn beaten_attack_sends_nobody_home() {
        let f = fixture(CancelPolicy::default());
        let receipt = f
            .engine
            .send_movement(f.alice, HOME, ENEMY, &[UnitStack::new("warrior", 1)], Mission::Attack)
            .await
            .unwrap();

        f.clock.set(receipt.arrive_at);
        assert_eq!(
            f.engine.process_due(receipt.movement_id).await.unwrap(),
            ProcessOutcome::Applied
        );

        let attack = f.store.movement(receipt.movement_id).await.unwrap().unwrap();
        let outcome = attack.outcome.unwrap();
        assert!(!outcome.attacker_won);
        assert!(outcome.survivors_attacker.is_empty());
        assert_eq!(outcome.loot, 0);
        assert!(f
            .store
            .movement(leg_id(receipt.movement_id, "return"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(count(&f.store, HOME, "warrior").await, 99);
    }
}
