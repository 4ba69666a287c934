//! Combat skills and the RuneScape-style formulas behind a round.
//!
//! - Level curve: `total_xp_for_level` / `level_for_xp`
//! - Hit roll: attack roll vs defence roll
//! - Skills: data-driven loadout entries (damage or heal), loaded from TOML

use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::RegistryError;

/// Maximum character level
pub const MAX_LEVEL: i32 = 99;

/// Calculate total XP required to reach a level using RuneScape formula.
/// Level 1 = 0 XP, Level 2 = 83 XP, Level 99 = 13,034,431 XP
pub fn total_xp_for_level(level: i32) -> i64 {
    if level <= 1 {
        return 0;
    }
    let mut total = 0.0;
    for l in 1..level {
        total += (l as f64 + 300.0 * 2.0_f64.powf(l as f64 / 7.0)) / 4.0;
    }
    total.floor() as i64
}

/// Calculate level from total XP (inverse of total_xp_for_level)
pub fn level_for_xp(xp: i64) -> i32 {
    let mut low = 1;
    let mut high = MAX_LEVEL;

    while low < high {
        let mid = (low + high + 1) / 2;
        if total_xp_for_level(mid) <= xp {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    low
}

/// Attack roll vs defence roll. Returns true if the attack lands.
///
/// Attack roll: 0..=level * (attack_bonus + 64)
/// Defence roll: 0..=level * (defence_bonus + 64)
pub fn calculate_hit<R: Rng + ?Sized>(
    rng: &mut R,
    attacker_level: i32,
    attack_bonus: i32,
    defender_level: i32,
    defence_bonus: i32,
) -> bool {
    let attack_max = attacker_level * (attack_bonus + 64);
    let defence_max = defender_level * (defence_bonus + 64);

    let attack_roll = rng.gen_range(0..=attack_max.max(1));
    let defence_roll = rng.gen_range(0..=defence_max.max(1));

    attack_roll > defence_roll
}

/// Max hit from level and a flat strength bonus.
///
/// Formula: 1.3 + (level / 10) + (level * strength_bonus / 640)
/// - Level 1, no bonus: 1
/// - Level 50, no bonus: 6
/// - Level 99, no bonus: 11
pub fn calculate_max_hit(level: i32, strength_bonus: i32) -> i32 {
    let base = 1.3 + (level as f64 / 10.0);
    let bonus = (level * strength_bonus) as f64 / 640.0;
    (base + bonus).floor() as i32
}

/// Roll damage between 0 and max_hit (inclusive).
pub fn roll_damage<R: Rng + ?Sized>(rng: &mut R, max_hit: i32) -> i32 {
    if max_hit <= 0 {
        return 0;
    }
    rng.gen_range(0..=max_hit)
}

// ============================================================================
// Skill definitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    Damage,
    Heal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillDef {
    pub id: u32,
    pub name: String,
    pub kind: SkillKind,
    #[serde(default)]
    pub mana_cost: i32,
    /// Percent of a basic hit (damage) or of max hp (heal)
    #[serde(default = "default_power")]
    pub power: i32,
}

fn default_power() -> i32 {
    100
}

#[derive(Debug, Deserialize)]
struct SkillFile {
    #[serde(default)]
    skill: Vec<SkillDef>,
}

/// Registry of loadout skills keyed by numeric id
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: HashMap<u32, SkillDef>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` in `<data_dir>/skills`
    pub fn load_from_directory(&mut self, data_dir: &Path) -> Result<(), RegistryError> {
        let dir = data_dir.join("skills");
        if !dir.exists() {
            warn!("Skill directory does not exist: {:?}", dir);
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
                let file: SkillFile = toml::from_str(&contents).map_err(|source| RegistryError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;

                for skill in file.skill {
                    self.insert(skill)?;
                }
            }
        }

        info!("Loaded {} skill definitions", self.skills.len());
        Ok(())
    }

    pub fn insert(&mut self, skill: SkillDef) -> Result<(), RegistryError> {
        if skill.id == 0 {
            return Err(RegistryError::Invalid(format!(
                "Skill '{}' must have a positive id",
                skill.name
            )));
        }
        if self.skills.contains_key(&skill.id) {
            warn!("Duplicate skill id {}, overwriting", skill.id);
        }
        self.skills.insert(skill.id, skill);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&SkillDef> {
        self.skills.get(&id)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
