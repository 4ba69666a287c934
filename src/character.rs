//! Character aggregate as seen by the combat core.

use serde::{Deserialize, Serialize};

use crate::entity::LootEntry;

/// A monster currently engaged by a character, denormalised into the
/// character row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagedMonster {
    pub instance_id: String,
    pub prototype_id: String,
    pub name: String,
    pub level: i32,
    pub hp: i32,
    pub max_hp: i32,
    pub damage: i32,
    #[serde(default)]
    pub defence: i32,
    pub exp_reward: i32,
    pub gold_min: i32,
    pub gold_max: i32,
    #[serde(default)]
    pub loot: Vec<LootEntry>,
}

impl EngagedMonster {
    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    /// Apply damage, returning true if this killed the monster
    pub fn take_damage(&mut self, amount: i32) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.hp = (self.hp - amount.max(0)).max(0);
        !self.is_alive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootDrop {
    pub item_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Character {
    pub id: i64,
    pub name: String,
    pub hp: i32,
    pub max_hp: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub level: i32,
    pub exp: i64,
    pub gold: i64,
    pub current_map_id: Option<i64>,
    pub is_fighting: bool,
    /// `None` until the character has engaged anything
    pub combat_monsters: Option<Vec<EngagedMonster>>,
    /// Unix millis of the last encounter regeneration
    pub monsters_spawned_at: Option<i64>,
}

impl Character {
    pub fn living_monsters(&self) -> impl Iterator<Item = &EngagedMonster> {
        self.combat_monsters.iter().flatten().filter(|m| m.is_alive())
    }

    pub fn has_living_monsters(&self) -> bool {
        self.living_monsters().next().is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    /// Current hp as a percentage of max hp
    pub fn hp_percent(&self) -> i32 {
        if self.max_hp <= 0 {
            return 0;
        }
        ((self.hp as i64 * 100) / self.max_hp as i64) as i32
    }
}

#[cfg(test)]
pub(crate) fn test_monster(name: &str, hp: i32, damage: i32) -> EngagedMonster {
    EngagedMonster {
        instance_id: format!("{}-1", name),
        prototype_id: name.to_string(),
        name: name.to_string(),
        level: 1,
        hp,
        max_hp: hp.max(1),
        damage,
        defence: 0,
        exp_reward: 10,
        gold_min: 1,
        gold_max: 2,
        loot: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monster_take_damage() {
        let mut monster = test_monster("slime", 10, 1);
        assert!(!monster.take_damage(4));
        assert_eq!(monster.hp, 6);
        assert!(monster.take_damage(50));
        assert_eq!(monster.hp, 0);
        // Already dead
        assert!(!monster.take_damage(1));
    }

    #[test]
    fn test_living_monsters_handles_missing_list() {
        let character = Character {
            id: 1,
            name: "Aria".to_string(),
            hp: 50,
            max_hp: 200,
            mana: 0,
            max_mana: 0,
            level: 1,
            exp: 0,
            gold: 0,
            current_map_id: None,
            is_fighting: false,
            combat_monsters: None,
            monsters_spawned_at: None,
        };
        assert!(!character.has_living_monsters());
        assert_eq!(character.hp_percent(), 25);
    }
}
