use serde::{Deserialize, Serialize};

// ============================================================================
// Raw TOML Structures (direct deserialization)
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawMonsterStats {
    pub max_hp: Option<i32>,
    pub damage: Option<i32>,
    pub defence: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawMonsterRewards {
    pub exp_base: Option<i32>,
    pub gold_min: Option<i32>,
    pub gold_max: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootEntry {
    pub item_id: String,
    pub drop_chance: f32,
    #[serde(default = "default_one")]
    pub quantity_min: i32,
    #[serde(default = "default_one")]
    pub quantity_max: i32,
}

fn default_one() -> i32 {
    1
}

/// Raw monster prototype as loaded directly from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawMonsterPrototype {
    pub extends: Option<String>,
    pub display_name: Option<String>,

    #[serde(default)]
    pub stats: RawMonsterStats,

    #[serde(default)]
    pub rewards: RawMonsterRewards,

    #[serde(default)]
    pub loot: Vec<LootEntry>,
}

// ============================================================================
// Resolved Structures (after inheritance)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedStats {
    pub max_hp: i32,
    pub damage: i32,
    pub defence: i32,
}

impl Default for ResolvedStats {
    fn default() -> Self {
        Self {
            max_hp: 20,
            damage: 2,
            defence: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRewards {
    pub exp_base: i32,
    pub gold_min: i32,
    pub gold_max: i32,
}

impl Default for ResolvedRewards {
    fn default() -> Self {
        Self {
            exp_base: 10,
            gold_min: 1,
            gold_max: 5,
        }
    }
}

/// Fully resolved monster prototype (after inheritance resolution)
#[derive(Debug, Clone)]
pub struct MonsterPrototype {
    pub id: String,
    pub display_name: String,
    pub stats: ResolvedStats,
    pub rewards: ResolvedRewards,
    pub loot: Vec<LootEntry>,
}
