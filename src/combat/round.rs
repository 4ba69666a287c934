//! One round of auto-combat.

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::character::{Character, EngagedMonster, LootDrop};
use crate::config::CombatSection;
use crate::entity::{roll_gold, roll_loot};
use crate::error::CombatError;
use crate::skills::{self, SkillDef, SkillKind, SkillRegistry};

/// Mana regained at the end of every round, in percent of max mana
const MANA_REGEN_PERCENT: i32 = 5;

/// Below this hp share, heal skills take priority over damage skills
const HEAL_THRESHOLD_PERCENT: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Ongoing,
    Victory,
    Defeat,
    AutoStopped,
}

impl RoundOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundOutcome::Ongoing => "ongoing",
            RoundOutcome::Victory => "victory",
            RoundOutcome::Defeat => "defeat",
            RoundOutcome::AutoStopped => "auto_stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoundOutcome::Ongoing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundResult {
    pub outcome: RoundOutcome,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    pub skill_used: Option<u32>,
    pub mana_spent: i32,
    pub healed: i32,
    pub exp_gained: i64,
    pub gold_gained: i64,
    pub loot: Vec<LootDrop>,
    pub leveled_up: bool,
    pub character_hp: i32,
    pub character_mana: i32,
    pub monsters: Vec<EngagedMonster>,
}

impl RoundResult {
    /// A round in which nothing happened
    pub fn idle(outcome: RoundOutcome, character: &Character) -> Self {
        Self {
            outcome,
            damage_dealt: 0,
            damage_taken: 0,
            skill_used: None,
            mana_spent: 0,
            healed: 0,
            exp_gained: 0,
            gold_gained: 0,
            loot: Vec::new(),
            leveled_up: false,
            character_hp: character.hp,
            character_mana: character.mana,
            monsters: character.combat_monsters.clone().unwrap_or_default(),
        }
    }
}

/// Resolves a single round for a character, mutating it in place.
#[async_trait]
pub trait RoundExecutor: Send + Sync {
    async fn execute_round(
        &self,
        character: &mut Character,
        skill_ids: &[u32],
    ) -> Result<RoundResult, CombatError>;
}

pub struct CombatService {
    skills: Arc<SkillRegistry>,
    rng: Mutex<StdRng>,
    base_damage: i32,
    auto_stop_hp_percent: i32,
}

impl CombatService {
    pub fn new(skills: Arc<SkillRegistry>, config: &CombatSection) -> Self {
        Self::with_rng(skills, config, StdRng::from_entropy())
    }

    pub fn with_rng(skills: Arc<SkillRegistry>, config: &CombatSection, rng: StdRng) -> Self {
        Self {
            skills,
            rng: Mutex::new(rng),
            base_damage: config.base_damage,
            auto_stop_hp_percent: config.auto_stop_hp_percent,
        }
    }

    /// Heal first when hurt, otherwise the first affordable damage skill in
    /// loadout order. `None` means a basic attack.
    fn choose_skill(&self, character: &Character, skill_ids: &[u32]) -> Option<&SkillDef> {
        let affordable = || {
            skill_ids
                .iter()
                .filter_map(|id| self.skills.get(*id))
                .filter(|skill| skill.mana_cost <= character.mana)
        };

        if character.hp_percent() < HEAL_THRESHOLD_PERCENT && character.hp < character.max_hp {
            if let Some(heal) = affordable().find(|s| s.kind == SkillKind::Heal) {
                return Some(heal);
            }
        }
        affordable().find(|s| s.kind == SkillKind::Damage)
    }

    fn resolve(&self, character: &mut Character, skill_ids: &[u32]) -> RoundResult {
        if !character.is_fighting || character.current_map_id.is_none() {
            return RoundResult::idle(RoundOutcome::AutoStopped, character);
        }
        if !character.is_alive() {
            return RoundResult::idle(RoundOutcome::Defeat, character);
        }
        if !character.has_living_monsters() {
            return RoundResult::idle(RoundOutcome::AutoStopped, character);
        }

        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut result = RoundResult::idle(RoundOutcome::Ongoing, character);

        let skill = self.choose_skill(character, skill_ids).cloned();
        if let Some(skill) = &skill {
            character.mana -= skill.mana_cost;
            result.mana_spent = skill.mana_cost;
            result.skill_used = Some(skill.id);
        }

        let monsters = character.combat_monsters.get_or_insert_with(Vec::new);

        match skill.as_ref().map(|s| s.kind) {
            Some(SkillKind::Heal) => {
                let power = skill.as_ref().map_or(100, |s| s.power);
                let amount = character.max_hp * power / 100;
                let healed = amount.min(character.max_hp - character.hp).max(0);
                character.hp += healed;
                result.healed = healed;
            }
            kind => {
                let power = if kind.is_some() { skill.as_ref().map_or(100, |s| s.power) } else { 100 };
                if let Some(target) = monsters.iter_mut().find(|m| m.is_alive()) {
                    let damage = if skills::calculate_hit(&mut *rng, character.level, 0, target.level, target.defence) {
                        let max_hit = skills::calculate_max_hit(character.level, 0) + self.base_damage;
                        skills::roll_damage(&mut *rng, max_hit) * power / 100
                    } else {
                        0
                    };

                    let dealt = damage.min(target.hp);
                    result.damage_dealt = dealt;
                    if target.take_damage(damage) {
                        debug!("{} slew {}", character.name, target.name);
                        result.exp_gained += target.exp_reward as i64;
                        result.gold_gained += roll_gold(&mut *rng, target);
                        result.loot.extend(roll_loot(&mut *rng, target));
                    }
                }
            }
        }

        // Survivors strike back
        if monsters.iter().any(|m| m.is_alive()) {
            for monster in monsters.iter().filter(|m| m.is_alive()) {
                if skills::calculate_hit(&mut *rng, monster.level, 0, character.level, 0) {
                    result.damage_taken += skills::roll_damage(&mut *rng, monster.damage);
                }
            }
            character.hp = (character.hp - result.damage_taken).max(0);
        }

        character.mana = (character.mana + character.max_mana * MANA_REGEN_PERCENT / 100).min(character.max_mana);

        if result.exp_gained > 0 {
            character.exp += result.exp_gained;
            let new_level = skills::level_for_xp(character.exp);
            if new_level > character.level {
                info!("{} reached level {}", character.name, new_level);
                character.level = new_level;
                result.leveled_up = true;
            }
        }
        character.gold += result.gold_gained;

        result.outcome = if !character.has_living_monsters() {
            RoundOutcome::Victory
        } else if !character.is_alive() {
            RoundOutcome::Defeat
        } else if character.hp_percent() < self.auto_stop_hp_percent {
            RoundOutcome::AutoStopped
        } else {
            RoundOutcome::Ongoing
        };

        result.character_hp = character.hp;
        result.character_mana = character.mana;
        result.monsters = character.combat_monsters.clone().unwrap_or_default();
        result
    }
}

#[async_trait]
impl RoundExecutor for CombatService {
    async fn execute_round(
        &self,
        character: &mut Character,
        skill_ids: &[u32],
    ) -> Result<RoundResult, CombatError> {
        Ok(self.resolve(character, skill_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::test_monster;

    fn fighter(level: i32, hp: i32) -> Character {
        Character {
            id: 1,
            name: "Aria".to_string(),
            hp,
            max_hp: 100,
            mana: 50,
            max_mana: 50,
            level,
            exp: skills::total_xp_for_level(level),
            gold: 0,
            current_map_id: Some(1),
            is_fighting: true,
            combat_monsters: Some(vec![test_monster("slime", 15, 0)]),
            monsters_spawned_at: Some(0),
        }
    }

    fn service(skills: SkillRegistry) -> CombatService {
        CombatService::with_rng(Arc::new(skills), &CombatSection::default(), StdRng::seed_from_u64(11))
    }

    fn skill(id: u32, kind: SkillKind, mana_cost: i32, power: i32) -> SkillDef {
        SkillDef {
            id,
            name: format!("skill-{}", id),
            kind,
            mana_cost,
            power,
        }
    }

    #[tokio::test]
    async fn test_strong_character_wins() {
        let service = service(SkillRegistry::new());
        let mut character = fighter(60, 100);

        let mut outcome = RoundOutcome::Ongoing;
        for _ in 0..200 {
            let result = service.execute_round(&mut character, &[]).await.unwrap();
            outcome = result.outcome;
            if outcome.is_terminal() {
                assert_eq!(result.exp_gained, 10);
                assert!(result.gold_gained >= 1);
                break;
            }
        }

        assert_eq!(outcome, RoundOutcome::Victory);
        assert!(!character.has_living_monsters());
        assert_eq!(character.hp, 100);
    }

    #[tokio::test]
    async fn test_weak_character_does_not_keep_fighting() {
        let service = service(SkillRegistry::new());
        let mut character = fighter(1, 100);
        character.combat_monsters = Some(vec![test_monster("ogre", 10_000, 40)]);
        character.combat_monsters.as_mut().unwrap()[0].level = 60;

        let mut outcome = RoundOutcome::Ongoing;
        for _ in 0..200 {
            outcome = service.execute_round(&mut character, &[]).await.unwrap().outcome;
            if outcome.is_terminal() {
                break;
            }
        }

        assert!(matches!(outcome, RoundOutcome::Defeat | RoundOutcome::AutoStopped));
        assert!(character.hp_percent() < 20);
    }

    #[tokio::test]
    async fn test_not_fighting_auto_stops_without_mutation() {
        let service = service(SkillRegistry::new());
        let mut character = fighter(10, 100);
        character.is_fighting = false;
        let before = character.clone();

        let result = service.execute_round(&mut character, &[1]).await.unwrap();
        assert_eq!(result.outcome, RoundOutcome::AutoStopped);
        assert_eq!(character, before);
    }

    #[tokio::test]
    async fn test_no_map_auto_stops() {
        let service = service(SkillRegistry::new());
        let mut character = fighter(10, 100);
        character.current_map_id = None;

        let result = service.execute_round(&mut character, &[]).await.unwrap();
        assert_eq!(result.outcome, RoundOutcome::AutoStopped);
    }

    #[tokio::test]
    async fn test_heal_preferred_when_hurt() {
        let mut registry = SkillRegistry::new();
        registry.insert(skill(101, SkillKind::Damage, 5, 150)).unwrap();
        registry.insert(skill(201, SkillKind::Heal, 10, 30)).unwrap();
        let service = service(registry);

        let mut character = fighter(10, 40);
        let result = service.execute_round(&mut character, &[101, 201]).await.unwrap();

        assert_eq!(result.skill_used, Some(201));
        assert_eq!(result.healed, 30);
        assert_eq!(result.mana_spent, 10);
        // Monster deals no damage
        assert_eq!(character.hp, 70);
        // 50 - 10 + 2 regen
        assert_eq!(character.mana, 42);
        assert_eq!(result.outcome, RoundOutcome::Ongoing);
    }

    #[tokio::test]
    async fn test_unaffordable_and_unknown_skills_fall_back_to_basic_attack() {
        let mut registry = SkillRegistry::new();
        registry.insert(skill(101, SkillKind::Damage, 500, 150)).unwrap();
        let service = service(registry);

        let mut character = fighter(10, 100);
        let result = service.execute_round(&mut character, &[999, 101]).await.unwrap();
        assert_eq!(result.skill_used, None);
        assert_eq!(result.mana_spent, 0);
    }

    #[tokio::test]
    async fn test_victory_levels_up() {
        let service = service(SkillRegistry::new());
        let mut character = fighter(1, 100);
        let mut monster = test_monster("slime", 1, 0);
        monster.exp_reward = 500;
        monster.defence = -64;
        character.combat_monsters = Some(vec![monster]);

        for _ in 0..200 {
            let result = service.execute_round(&mut character, &[]).await.unwrap();
            if result.outcome == RoundOutcome::Victory {
                assert!(result.leveled_up);
                assert!(character.level > 1);
                return;
            }
        }
        panic!("monster with 1 hp survived 200 rounds");
    }
}
