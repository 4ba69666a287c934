use rand::Rng;
use uuid::Uuid;

use super::prototype::MonsterPrototype;
use super::registry::MonsterRegistry;
use super::spawn_table::MapDef;
use crate::character::{EngagedMonster, LootDrop};

/// Build an engaged monster from a prototype, scaled by level
pub fn engage_from_prototype(prototype: &MonsterPrototype, level: i32) -> EngagedMonster {
    let level = level.max(1);
    // +25% hp per level above 1
    let max_hp = (prototype.stats.max_hp * (100 + 25 * (level - 1)) / 100).max(1);

    EngagedMonster {
        instance_id: Uuid::new_v4().to_string(),
        prototype_id: prototype.id.clone(),
        name: prototype.display_name.clone(),
        level,
        hp: max_hp,
        max_hp,
        damage: prototype.stats.damage,
        defence: prototype.stats.defence,
        exp_reward: calculate_exp_reward(prototype, level),
        gold_min: prototype.rewards.gold_min,
        gold_max: prototype.rewards.gold_max,
        loot: prototype.loot.clone(),
    }
}

/// Roll a fresh encounter for a map.
///
/// Spawn entries whose monster is not in the registry are skipped; a map with
/// no usable entries yields an empty encounter.
pub fn generate_encounter<R: Rng + ?Sized>(
    rng: &mut R,
    map: &MapDef,
    registry: &MonsterRegistry,
) -> Vec<EngagedMonster> {
    let candidates: Vec<_> = map
        .spawns
        .iter()
        .filter(|s| s.weight > 0 && registry.contains(&s.monster))
        .collect();
    if candidates.is_empty() {
        return Vec::new();
    }

    let total_weight: u32 = candidates.iter().map(|s| s.weight).sum();
    let count = rng.gen_range(map.min_monsters..=map.max_monsters.max(map.min_monsters));
    let mut monsters = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let mut pick = rng.gen_range(0..total_weight);
        let entry = candidates
            .iter()
            .find(|s| {
                if pick < s.weight {
                    true
                } else {
                    pick -= s.weight;
                    false
                }
            })
            .unwrap_or(&candidates[0]);

        if let Some(prototype) = registry.get(&entry.monster) {
            let level = rng.gen_range(entry.level_min..=entry.level_max);
            monsters.push(engage_from_prototype(prototype, level));
        }
    }

    monsters
}

/// Gold dropped by a slain monster, scaled by its level
pub fn roll_gold<R: Rng + ?Sized>(rng: &mut R, monster: &EngagedMonster) -> i64 {
    if monster.gold_max <= 0 {
        return 0;
    }
    let min = monster.gold_min.clamp(0, monster.gold_max);
    rng.gen_range(min..=monster.gold_max) as i64 * monster.level as i64
}

/// Item drops rolled from a slain monster's loot table
pub fn roll_loot<R: Rng + ?Sized>(rng: &mut R, monster: &EngagedMonster) -> Vec<LootDrop> {
    let mut drops = Vec::new();

    for entry in &monster.loot {
        if rng.r#gen::<f32>() < entry.drop_chance {
            let max = entry.quantity_max.max(entry.quantity_min);
            let quantity = rng.gen_range(entry.quantity_min..=max);
            if quantity > 0 {
                drops.push(LootDrop {
                    item_id: entry.item_id.clone(),
                    quantity,
                });
            }
        }
    }

    drops
}

/// Calculate exp reward for killing a monster
pub fn calculate_exp_reward(prototype: &MonsterPrototype, level: i32) -> i32 {
    prototype.rewards.exp_base * level
}
