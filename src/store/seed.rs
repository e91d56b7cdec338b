//! Initial world for the in-memory store

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::config::game::GameConfig;
use crate::world::{Garrison, Village};

use super::MemoryStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedVillage {
    #[serde(flatten)]
    pub village: Village,
    #[serde(default)]
    pub garrison: Garrison,
    #[serde(default)]
    pub buildings: BTreeMap<String, u8>,
}

/// Villages loaded at startup when no remote store is configured
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSeed {
    pub villages: Vec<SeedVillage>,
}

impl WorldSeed {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::GameData(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::GameData(format!("{}: {}", path.display(), e)))
    }

    /// Reject villages outside the map or garrisons with unknown units
    pub fn validate(&self, config: &GameConfig) -> Result<(), ConfigError> {
        let bounds = config.bounds();
        for seed in &self.villages {
            if !bounds.contains(&seed.village.coord) {
                return Err(ConfigError::GameData(format!(
                    "village {} at {} is outside the world",
                    seed.village.id, seed.village.coord
                )));
            }
            if let Some(unit) = seed.garrison.keys().find(|u| config.unit(u).is_none()) {
                return Err(ConfigError::GameData(format!(
                    "village {} has unknown unit {}",
                    seed.village.id, unit
                )));
            }
        }
        Ok(())
    }

    /// Write every village into `store`, replacing rows with the same id
    pub fn apply(&self, store: &MemoryStore) -> usize {
        for seed in &self.villages {
            store.insert_village(
                seed.village.clone(),
                seed.garrison.clone(),
                seed.buildings.clone(),
            );
        }
        self.villages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorldStore;

    const SEED: &str = r#"{
        "villages": [
            {
                "id": 1,
                "owner_id": "6f1c1a0e-2f43-4f51-9a53-2d4d3c9b7a10",
                "name": "Northwatch",
                "coord": { "x": 3, "y": -4 },
                "garrison": { "spearman": 40, "scout": 5 },
                "buildings": { "barracks": 2 }
            },
            {
                "id": 2,
                "owner_id": "0d7a3f8e-51b5-4b2c-8d0e-7c1a2b3c4d5e",
                "name": "Riverford",
                "coord": { "x": -10, "y": 12 },
                "fortification": 20
            }
        ]
    }"#;

    #[tokio::test]
    async fn seed_populates_the_store() {
        let seed: WorldSeed = serde_json::from_str(SEED).unwrap();
        assert!(seed.validate(&GameConfig::default()).is_ok());

        let store = MemoryStore::new();
        assert_eq!(seed.apply(&store), 2);
        assert_eq!(store.village_count(), 2);

        let garrison = store.garrison(1).await.unwrap();
        assert_eq!(garrison[&"spearman".into()], 40);
        assert_eq!(store.village(2).await.unwrap().unwrap().fortification, 20);
        assert_eq!(store.buildings(1).await.unwrap()["barracks"], 2);
    }

    #[test]
    fn unknown_units_are_rejected() {
        let mut seed: WorldSeed = serde_json::from_str(SEED).unwrap();
        seed.villages[1].garrison.insert("dragon".into(), 1);
        assert!(matches!(
            seed.validate(&GameConfig::default()),
            Err(ConfigError::GameData(_))
        ));
    }
}
