use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use super::prototype::{LootEntry, MonsterPrototype, RawMonsterPrototype, ResolvedRewards, ResolvedStats};
use crate::error::RegistryError;

/// Registry for all monster prototypes
#[derive(Default)]
pub struct MonsterRegistry {
    prototypes: HashMap<String, MonsterPrototype>,
}

impl MonsterRegistry {
    pub fn new() -> Self {
        Self {
            prototypes: HashMap::new(),
        }
    }

    /// Load all monster definitions from `<data_dir>/monsters`
    pub fn load_from_directory(&mut self, data_dir: &Path) -> Result<(), RegistryError> {
        let monsters_dir = data_dir.join("monsters");

        // First pass: load all raw prototypes
        let mut raw_prototypes: HashMap<String, RawMonsterPrototype> = HashMap::new();
        if monsters_dir.exists() {
            Self::load_toml_files(&monsters_dir, &mut raw_prototypes)?;
        } else {
            warn!("Monster directory does not exist: {:?}", monsters_dir);
        }

        info!("Loaded {} raw monster prototypes", raw_prototypes.len());

        // Second pass: resolve inheritance
        self.resolve_all_prototypes(raw_prototypes)?;

        info!("Resolved {} monster prototypes", self.prototypes.len());
        Ok(())
    }

    fn load_toml_files(
        dir: &Path,
        raw_prototypes: &mut HashMap<String, RawMonsterPrototype>,
    ) -> Result<(), RegistryError> {
        let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::Read {
            path: dir.display().to_string(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path).map_err(|source| RegistryError::Read {
                    path: path.display().to_string(),
                    source,
                })?;

                // Parse as table of monsters
                let table: HashMap<String, RawMonsterPrototype> =
                    toml::from_str(&content).map_err(|source| RegistryError::Parse {
                        path: path.display().to_string(),
                        source,
                    })?;

                for (id, proto) in table {
                    if raw_prototypes.contains_key(&id) {
                        warn!("Duplicate monster ID '{}' in {:?}, overwriting", id, path);
                    }
                    raw_prototypes.insert(id, proto);
                }
            }
        }

        Ok(())
    }

    fn resolve_all_prototypes(
        &mut self,
        raw_prototypes: HashMap<String, RawMonsterPrototype>,
    ) -> Result<(), RegistryError> {
        // Parents must be resolved before their children
        let sorted_ids = topological_sort(&raw_prototypes)?;

        for id in sorted_ids {
            if let Some(raw) = raw_prototypes.get(&id) {
                let resolved = self.resolve_prototype(&id, raw);
                self.prototypes.insert(id, resolved);
            }
        }

        Ok(())
    }

    fn resolve_prototype(&self, id: &str, raw: &RawMonsterPrototype) -> MonsterPrototype {
        let parent = raw.extends.as_ref().and_then(|parent_id| self.prototypes.get(parent_id));
        let defaults_stats = ResolvedStats::default();
        let defaults_rewards = ResolvedRewards::default();

        // Child overrides parent, parent overrides defaults
        let stats = ResolvedStats {
            max_hp: raw.stats.max_hp
                .or_else(|| parent.map(|p| p.stats.max_hp))
                .unwrap_or(defaults_stats.max_hp),
            damage: raw.stats.damage
                .or_else(|| parent.map(|p| p.stats.damage))
                .unwrap_or(defaults_stats.damage),
            defence: raw.stats.defence
                .or_else(|| parent.map(|p| p.stats.defence))
                .unwrap_or(defaults_stats.defence),
        };

        let rewards = ResolvedRewards {
            exp_base: raw.rewards.exp_base
                .or_else(|| parent.map(|p| p.rewards.exp_base))
                .unwrap_or(defaults_rewards.exp_base),
            gold_min: raw.rewards.gold_min
                .or_else(|| parent.map(|p| p.rewards.gold_min))
                .unwrap_or(defaults_rewards.gold_min),
            gold_max: raw.rewards.gold_max
                .or_else(|| parent.map(|p| p.rewards.gold_max))
                .unwrap_or(defaults_rewards.gold_max),
        };

        // Loot tables: child appends to parent
        let mut loot: Vec<LootEntry> = parent.map(|p| p.loot.clone()).unwrap_or_default();
        loot.extend(raw.loot.iter().cloned());

        MonsterPrototype {
            id: id.to_string(),
            display_name: raw.display_name.clone()
                .or_else(|| parent.map(|p| p.display_name.clone()))
                .unwrap_or_else(|| id.to_string()),
            stats,
            rewards,
            loot,
        }
    }

    pub fn insert(&mut self, prototype: MonsterPrototype) {
        self.prototypes.insert(prototype.id.clone(), prototype);
    }

    pub fn get(&self, id: &str) -> Option<&MonsterPrototype> {
        self.prototypes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.prototypes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

fn topological_sort(
    raw_prototypes: &HashMap<String, RawMonsterPrototype>,
) -> Result<Vec<String>, RegistryError> {
    let mut sorted = Vec::new();
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();

    fn visit(
        id: &str,
        raw_prototypes: &HashMap<String, RawMonsterPrototype>,
        sorted: &mut Vec<String>,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
    ) -> Result<(), RegistryError> {
        if visited.contains(id) {
            return Ok(());
        }
        if visiting.contains(id) {
            return Err(RegistryError::Invalid(format!(
                "Circular inheritance detected at '{}'",
                id
            )));
        }

        visiting.insert(id.to_string());

        if let Some(raw) = raw_prototypes.get(id) {
            if let Some(parent_id) = &raw.extends {
                if !raw_prototypes.contains_key(parent_id) {
                    return Err(RegistryError::Invalid(format!(
                        "Monster '{}' extends unknown parent '{}'",
                        id, parent_id
                    )));
                }
                visit(parent_id, raw_prototypes, sorted, visited, visiting)?;
            }
        }

        visiting.remove(id);
        visited.insert(id.to_string());
        sorted.push(id.to_string());

        Ok(())
    }

    for id in raw_prototypes.keys() {
        visit(id, raw_prototypes, &mut sorted, &mut visited, &mut visiting)?;
    }

    Ok(sorted)
}
