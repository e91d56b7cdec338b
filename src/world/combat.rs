//! Combat resolution for arriving attacks

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::game::{GameConfig, UnitStats};

use super::units::{Garrison, UnitStack, UnitTypeId};

/// Inputs besides the two armies
#[derive(Debug, Clone, Copy)]
pub struct CombatContext<'a> {
    pub config: &'a GameConfig,
    /// Defender wall bonus in percent
    pub fortification: u32,
    /// Seed for the luck roll; derived from the movement so replays match
    pub seed: u64,
}

/// Result of one battle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatOutcome {
    pub attacker_won: bool,
    pub survivors_attacker: Vec<UnitStack>,
    pub survivors_defender: Garrison,
    /// Defender casualties by type, kept so a replay can apply them again
    pub defender_losses: Vec<UnitStack>,
    /// Carry capacity of the surviving attackers
    pub loot: u64,
}

/// Pure battle function, invoked once per attack arrival
pub trait CombatResolver: Send + Sync {
    fn resolve(
        &self,
        attacking: &[UnitStack],
        defending: &Garrison,
        context: &CombatContext<'_>,
    ) -> CombatOutcome;
}

/// Power-ratio combat with a seeded luck factor
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerCombat;

/// Luck swings attack power by up to this fraction either way
const LUCK_SPREAD: f64 = 0.1;

impl CombatResolver for PowerCombat {
    fn resolve(
        &self,
        attacking: &[UnitStack],
        defending: &Garrison,
        context: &CombatContext<'_>,
    ) -> CombatOutcome {
        let config = context.config;

        let attack_power: f64 = attacking
            .iter()
            .map(|s| f64::from(s.count) * f64::from(stat(config, &s.unit, |u| u.attack)))
            .sum();
        let wall = 1.0 + f64::from(context.fortification) / 100.0;
        let defense_power: f64 = defending
            .iter()
            .map(|(unit, count)| f64::from(*count) * f64::from(stat(config, unit, |u| u.defense)))
            .sum::<f64>()
            * wall;

        let mut rng = ChaCha8Rng::seed_from_u64(context.seed);
        let luck = 1.0 + rng.gen_range(-LUCK_SPREAD..=LUCK_SPREAD);
        let attack_power = attack_power * luck;

        let (attacker_won, attacker_loss, defender_loss) = if defense_power <= 0.0 {
            (true, 0.0, 1.0)
        } else if attack_power > defense_power {
            (true, (defense_power / attack_power).powf(1.5), 1.0)
        } else {
            let ratio = if attack_power > 0.0 {
                (attack_power / defense_power).powf(1.5)
            } else {
                0.0
            };
            (false, 1.0, ratio)
        };

        let survivors_attacker: Vec<UnitStack> = attacking
            .iter()
            .map(|s| UnitStack {
                unit: s.unit.clone(),
                count: surviving(s.count, attacker_loss),
            })
            .filter(|s| s.count > 0)
            .collect();

        let survivors_defender: Garrison = defending
            .iter()
            .map(|(unit, count)| (unit.clone(), surviving(*count, defender_loss)))
            .collect();

        let defender_losses: Vec<UnitStack> = defending
            .iter()
            .filter_map(|(unit, count)| {
                let left = survivors_defender.get(unit).copied().unwrap_or(0);
                (*count > left).then(|| UnitStack {
                    unit: unit.clone(),
                    count: count - left,
                })
            })
            .collect();

        let loot = if attacker_won {
            survivors_attacker
                .iter()
                .map(|s| u64::from(s.count) * u64::from(stat(config, &s.unit, |u| u.carry)))
                .sum()
        } else {
            0
        };

        CombatOutcome {
            attacker_won,
            survivors_attacker,
            survivors_defender,
            defender_losses,
            loot,
        }
    }
}

fn stat(config: &GameConfig, unit: &UnitTypeId, pick: impl Fn(&UnitStats) -> u32) -> u32 {
    config.unit(unit).map_or(0, pick)
}

fn surviving(count: u32, loss: f64) -> u32 {
    let lost = (f64::from(count) * loss.clamp(0.0, 1.0)).round() as u32;
    count.saturating_sub(lost)
}
