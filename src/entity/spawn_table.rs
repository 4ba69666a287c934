//! Map spawn tables
//!
//! Each map lists which monsters can appear there and how many at once.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::RegistryError;

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnEntry {
    pub monster: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_level")]
    pub level_min: i32,
    #[serde(default = "default_level")]
    pub level_max: i32,
}

fn default_weight() -> u32 {
    1
}

fn default_level() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapDef {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_min_monsters")]
    pub min_monsters: u32,
    #[serde(default = "default_max_monsters")]
    pub max_monsters: u32,
    #[serde(default)]
    pub spawns: Vec<SpawnEntry>,
}

fn default_min_monsters() -> u32 {
    1
}

fn default_max_monsters() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct MapFile {
    #[serde(default)]
    map: Vec<MapDef>,
}

/// Registry of map spawn tables keyed by map id
#[derive(Debug, Default)]
pub struct MapRegistry {
    maps: HashMap<i64, MapDef>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` in `<data_dir>/maps`
    pub fn load_from_directory(&mut self, data_dir: &Path) -> Result<(), RegistryError> {
        let dir = data_dir.join("maps");
        if !dir.exists() {
            warn!("Map directory does not exist: {:?}", dir);
            return Ok(());
        }

        let entries = std::fs::read_dir(&dir).map_err(|source| RegistryError::Read {
            path: dir.display().to_string(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let contents = std::fs::read_to_string(&path).map_err(|source| RegistryError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                let file: MapFile = toml::from_str(&contents).map_err(|source| RegistryError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;

                for map in file.map {
                    self.insert(map)?;
                }
            }
        }

        info!("Loaded {} map spawn tables", self.maps.len());
        Ok(())
    }

    pub fn insert(&mut self, map: MapDef) -> Result<(), RegistryError> {
        if map.min_monsters > map.max_monsters {
            return Err(RegistryError::Invalid(format!(
                "Map {} has min_monsters > max_monsters",
                map.id
            )));
        }
        if let Some(bad) = map.spawns.iter().find(|s| s.level_min > s.level_max) {
            return Err(RegistryError::Invalid(format!(
                "Map {} spawn '{}' has level_min > level_max",
                map.id, bad.monster
            )));
        }
        if self.maps.contains_key(&map.id) {
            warn!("Duplicate map id {}, overwriting", map.id);
        }
        self.maps.insert(map.id, map);
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&MapDef> {
        self.maps.get(&id)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }
}
