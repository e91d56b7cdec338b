//! Game data: world-wide multipliers, units, buildings and quests

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::world::{UnitStack, UnitTypeId, WorldBounds};

use super::ConfigError;

/// Static stats for one unit type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitStats {
    pub speed_tiles_per_hour: f64,
    pub attack: u32,
    pub defense: u32,
    /// Loot capacity per unit
    #[serde(default)]
    pub carry: u32,
    /// Barracks time for one unit at server speed 1
    #[serde(default = "default_train_secs")]
    pub train_secs: u32,
}

fn default_train_secs() -> u32 {
    60
}

/// Upgrade timing for one building
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildingStats {
    /// Seconds to reach level 1
    pub base_secs: u32,
    /// Each level takes this factor longer than the previous one
    pub growth: f64,
    pub max_level: u8,
}

impl BuildingStats {
    /// Seconds needed to go from `target_level - 1` to `target_level`
    pub fn upgrade_secs(&self, target_level: u8) -> f64 {
        f64::from(self.base_secs) * self.growth.powi(i32::from(target_level.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestStats {
    pub duration_secs: u32,
    pub reward: Vec<UnitStack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Globals {
    /// World-wide time compression, at least 1
    pub server_speed: f64,
    /// Half-width of the square map
    pub world_radius: i32,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            server_speed: 1.0,
            world_radius: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    #[serde(default)]
    pub globals: Globals,
    pub units: HashMap<UnitTypeId, UnitStats>,
    #[serde(default)]
    pub buildings: HashMap<String, BuildingStats>,
    #[serde(default)]
    pub quests: HashMap<String, QuestStats>,
}

impl GameConfig {
    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::GameData(format!("{}: {}", path.display(), e)))?;
        let config: GameConfig = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::GameData(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.globals.server_speed.is_finite() || self.globals.server_speed < 1.0 {
            return Err(ConfigError::GameData(
                "globals.server_speed must be a finite number >= 1".into(),
            ));
        }
        if self.globals.world_radius <= 0 {
            return Err(ConfigError::GameData("globals.world_radius must be positive".into()));
        }
        for (unit, stats) in &self.units {
            if !stats.speed_tiles_per_hour.is_finite() || stats.speed_tiles_per_hour <= 0.0 {
                return Err(ConfigError::GameData(format!(
                    "unit {} must have a positive speed",
                    unit
                )));
            }
        }
        for (building, stats) in &self.buildings {
            if stats.base_secs == 0 || !stats.growth.is_finite() || stats.growth < 1.0 {
                return Err(ConfigError::GameData(format!(
                    "building {} needs base_secs > 0 and growth >= 1",
                    building
                )));
            }
        }
        for (quest, stats) in &self.quests {
            if stats.duration_secs == 0 || stats.reward.iter().any(|s| !self.units.contains_key(&s.unit)) {
                return Err(ConfigError::GameData(format!(
                    "quest {} needs a duration and known reward units",
                    quest
                )));
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> WorldBounds {
        WorldBounds::new(self.globals.world_radius)
    }

    pub fn unit(&self, id: &UnitTypeId) -> Option<&UnitStats> {
        self.units.get(id)
    }

    pub fn building(&self, id: &str) -> Option<&BuildingStats> {
        self.buildings.get(id)
    }

    pub fn quest(&self, id: &str) -> Option<&QuestStats> {
        self.quests.get(id)
    }

    /// Game seconds to wall-clock milliseconds under the server speed, at least 1
    pub fn scaled_ms(&self, secs: f64) -> i64 {
        ((secs * 1000.0 / self.globals.server_speed).ceil() as i64).max(1)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        let catalogue = [
            ("warrior", 7.0, 40, 20, 50, 60),
            ("spearman", 7.0, 10, 35, 60, 75),
            ("axeman", 6.0, 60, 30, 50, 90),
            ("scout", 20.0, 0, 10, 0, 45),
            ("paladin", 10.0, 55, 100, 110, 600),
            ("ram", 4.0, 60, 30, 0, 480),
            ("settler", 5.0, 0, 80, 3000, 3600),
        ];

        let units = catalogue
            .into_iter()
            .map(|(id, speed, attack, defense, carry, train_secs)| {
                (
                    UnitTypeId::new(id),
                    UnitStats {
                        speed_tiles_per_hour: speed,
                        attack,
                        defense,
                        carry,
                        train_secs,
                    },
                )
            })
            .collect();

        let buildings = [
            ("main_building", 600, 1.2, 20),
            ("barracks", 900, 1.25, 20),
            ("wall", 1200, 1.3, 20),
            ("rally_point", 300, 1.2, 5),
        ]
        .into_iter()
        .map(|(id, base_secs, growth, max_level)| {
            (
                id.to_string(),
                BuildingStats {
                    base_secs,
                    growth,
                    max_level,
                },
            )
        })
        .collect();

        let quests = HashMap::from([
            (
                "first_steps".to_string(),
                QuestStats {
                    duration_secs: 300,
                    reward: vec![UnitStack::new("warrior", 10)],
                },
            ),
            (
                "scouting_party".to_string(),
                QuestStats {
                    duration_secs: 1800,
                    reward: vec![UnitStack::new("scout", 5)],
                },
            ),
        ]);

        Self {
            globals: Globals::default(),
            units,
            buildings,
            quests,
        }
    }
}
