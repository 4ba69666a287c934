//! Low-frequency backstop that refreshes stale encounters for every fighting
//! character, including ones whose tick loop is not currently scheduled.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broadcast::CombatChannels;
use crate::combat::refresh::{now_millis, EncounterRefresher};
use crate::db::Database;
use crate::error::CombatError;
use crate::lease::CombatLeaseStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct MonsterRefreshSweep {
    db: Arc<Database>,
    store: Arc<dyn CombatLeaseStore>,
    channels: Arc<CombatChannels>,
    refresher: Arc<EncounterRefresher>,
    lock_ttl: Duration,
}

impl MonsterRefreshSweep {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn CombatLeaseStore>,
        channels: Arc<CombatChannels>,
        refresher: Arc<EncounterRefresher>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            db,
            store,
            channels,
            refresher,
            lock_ttl,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, CombatError> {
        let mut report = SweepReport::default();

        for character in self.db.list_fighting_characters().await? {
            if character.current_map_id.is_none() || character.combat_monsters.is_none() {
                report.skipped += 1;
                continue;
            }
            report.checked += 1;

            if !self.refresher.is_stale(&character, now_millis()) {
                continue;
            }

            match self.refresh_one(character.id).await {
                Ok(true) => report.refreshed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Monster refresh failed for character {}: {}", character.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.refreshed > 0 || report.failed > 0 {
            info!(
                "Monster sweep: {} checked, {} refreshed, {} skipped, {} failed",
                report.checked, report.refreshed, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// Refresh under the character's lock so a running tick is never overwritten.
    /// Returns false if a tick held the lock or the character changed meanwhile.
    async fn refresh_one(&self, character_id: i64) -> Result<bool, CombatError> {
        let Some(token) = self.store.try_lock(character_id, self.lock_ttl).await? else {
            debug!("Sweep skipped character {}: tick in progress", character_id);
            return Ok(false);
        };

        let result = self.refresh_locked(character_id).await;

        if let Err(e) = self.store.release_lock(&token).await {
            warn!("Failed to release lock for character {}: {}", character_id, e);
        }
        result
    }

    async fn refresh_locked(&self, character_id: i64) -> Result<bool, CombatError> {
        let Some(mut character) = self.db.get_character(character_id).await? else {
            return Ok(false);
        };
        let eligible = character.is_fighting
            && character.current_map_id.is_some()
            && character.combat_monsters.is_some();
        if !eligible || !self.refresher.is_stale(&character, now_millis()) {
            return Ok(false);
        }

        self.refresher
            .refresh(&self.db, &self.channels, &mut character)
            .await?;
        Ok(true)
    }
}
