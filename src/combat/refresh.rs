//! Encounter staleness policy and monster regeneration.

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::broadcast::CombatChannels;
use crate::character::Character;
use crate::db::Database;
use crate::entity::{generate_encounter, MapRegistry, MonsterRegistry};
use crate::error::CombatError;
use crate::protocol::CombatEvent;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An encounter is stale when there is nothing left to fight or it has
/// outlived `encounter_ttl`. A missing spawn timestamp counts as stale.
pub fn is_stale(character: &Character, now_ms: i64, encounter_ttl: Duration) -> bool {
    let Some(monsters) = &character.combat_monsters else {
        return true;
    };
    if monsters.iter().all(|m| !m.is_alive()) {
        return true;
    }
    match character.monsters_spawned_at {
        Some(spawned_at) => now_ms.saturating_sub(spawned_at) >= encounter_ttl.as_millis() as i64,
        None => true,
    }
}

pub struct EncounterRefresher {
    monsters: Arc<MonsterRegistry>,
    maps: Arc<MapRegistry>,
    encounter_ttl: Duration,
    rng: Mutex<StdRng>,
}

impl EncounterRefresher {
    pub fn new(monsters: Arc<MonsterRegistry>, maps: Arc<MapRegistry>, encounter_ttl: Duration) -> Self {
        Self {
            monsters,
            maps,
            encounter_ttl,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn is_stale(&self, character: &Character, now_ms: i64) -> bool {
        is_stale(character, now_ms, self.encounter_ttl)
    }

    /// Replace the character's monsters with a fresh roll for its current map
    pub fn regenerate(&self, character: &mut Character, now_ms: i64) -> Result<(), CombatError> {
        let map_id = character.current_map_id.ok_or(CombatError::NoMap(character.id))?;
        let map = self.maps.get(map_id).ok_or(CombatError::UnknownMap(map_id))?;

        let monsters = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            generate_encounter(&mut *rng, map, &self.monsters)
        };
        if monsters.is_empty() {
            warn!("Map {} produced an empty encounter for character {}", map_id, character.id);
        }

        character.combat_monsters = Some(monsters);
        character.monsters_spawned_at = Some(now_ms);
        Ok(())
    }

    /// Regenerate, persist, and announce the new encounter
    pub async fn refresh(
        &self,
        db: &Database,
        channels: &CombatChannels,
        character: &mut Character,
    ) -> Result<(), CombatError> {
        self.regenerate(character, now_millis())?;
        db.save_combat_state(character).await?;

        let monsters = character.combat_monsters.clone().unwrap_or_default();
        info!(
            "{} monster(s) appear for character {} on map {:?}",
            monsters.len(),
            character.id,
            character.current_map_id
        );
        if let Some(map_id) = character.current_map_id {
            channels.publish(CombatEvent::MonstersAppeared {
                character_id: character.id,
                map_id,
                monsters,
            });
        }
        Ok(())
    }
}
