//! One tick of a character's combat loop.
//!
//! A tick runs under the character's lock and only while a lease owned by its
//! loop exists. Anything unexpected ends in `force_stop`, which leaves the
//! character with no lease and the fighting flag cleared.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::CombatChannels;
use crate::combat::refresh::{now_millis, EncounterRefresher};
use crate::combat::round::{RoundExecutor, RoundOutcome};
use crate::config::CombatSection;
use crate::db::Database;
use crate::error::{CombatError, StoreError};
use crate::lease::{acquire_lock, CombatLease, CombatLeaseStore};
use crate::protocol::CombatEvent;

/// A queued tick for one generation of a character's loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickJob {
    pub character_id: i64,
    pub loop_id: Uuid,
    /// Lease-store failures in a row before this attempt
    pub store_failures: u32,
}

impl TickJob {
    pub fn new(character_id: i64, loop_id: Uuid) -> Self {
        Self {
            character_id,
            loop_id,
            store_failures: 0,
        }
    }

    /// The regular follow-up after a resolved round
    pub fn next(self) -> Self {
        Self {
            store_failures: 0,
            ..self
        }
    }

    /// Another attempt after the store could not be reached
    pub fn retry(self) -> Self {
        Self {
            store_failures: self.store_failures + 1,
            ..self
        }
    }
}

/// Which branch a tick took
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No lease on entry; nothing was touched
    NoLease,
    /// The lease belongs to a newer loop; this one is finished
    Superseded,
    /// Another tick holds the lock
    LockBusy,
    /// The lease was deleted before the round started
    LeaseVanished,
    /// The lease pointed at a character that no longer exists
    CharacterMissing,
    /// A round resolved and the loop continues
    Continue,
    /// A round ended the fight
    Finished(RoundOutcome),
    /// Combat was stopped or restarted while the round was running
    StoppedDuringRound,
    /// The lease store could not be reached before the lock; try again later
    StoreUnavailable(String),
    /// The tick failed and combat was force-stopped
    Failed(String),
}

impl TickOutcome {
    pub fn should_reschedule(&self) -> bool {
        matches!(self, TickOutcome::Continue | TickOutcome::StoreUnavailable(_))
    }
}

/// The stored lease as seen by one loop
enum LeaseState {
    Owned(CombatLease),
    Vanished,
    Superseded,
}

#[derive(Debug, Clone, Copy)]
pub struct TickSettings {
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_poll: Duration,
    pub lease_ttl: Duration,
    /// Upper bound on one locked tick; kept below `lock_ttl`
    pub tick_timeout: Duration,
    pub store_retries: u32,
}

impl From<&CombatSection> for TickSettings {
    fn from(config: &CombatSection) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
            lock_poll: config.lock_poll(),
            lease_ttl: config.lease_ttl(),
            tick_timeout: config.tick_timeout(),
            store_retries: config.store_retry_limit,
        }
    }
}

pub struct TickHandler {
    db: Arc<Database>,
    store: Arc<dyn CombatLeaseStore>,
    channels: Arc<CombatChannels>,
    refresher: Arc<EncounterRefresher>,
    rounds: Arc<dyn RoundExecutor>,
    settings: TickSettings,
}

impl TickHandler {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn CombatLeaseStore>,
        channels: Arc<CombatChannels>,
        refresher: Arc<EncounterRefresher>,
        rounds: Arc<dyn RoundExecutor>,
        settings: TickSettings,
    ) -> Self {
        Self {
            db,
            store,
            channels,
            refresher,
            rounds,
            settings,
        }
    }

    pub async fn run(&self, job: TickJob) -> TickOutcome {
        let character_id = job.character_id;
        match self.lease_state(job).await {
            Ok(LeaseState::Owned(_)) => {}
            Ok(LeaseState::Vanished) => return TickOutcome::NoLease,
            Ok(LeaseState::Superseded) => {
                debug!("Tick for character {} belongs to a stopped loop", character_id);
                return TickOutcome::Superseded;
            }
            Err(e) => return self.store_failure(job, e).await,
        }

        let token = match acquire_lock(
            self.store.as_ref(),
            character_id,
            self.settings.lock_ttl,
            self.settings.lock_wait,
            self.settings.lock_poll,
        )
        .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("Tick for character {} skipped: lock busy", character_id);
                return TickOutcome::LockBusy;
            }
            Err(e) => return self.store_failure(job, e).await,
        };

        let tick = tokio::time::timeout(self.settings.tick_timeout, self.locked_tick(job));
        let outcome = match tick.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let reason = e.to_string();
                self.force_stop(character_id, &reason).await;
                TickOutcome::Failed(reason)
            }
            Err(_) => {
                let reason = format!("tick exceeded {:?}", self.settings.tick_timeout);
                self.force_stop(character_id, &reason).await;
                TickOutcome::Failed(reason)
            }
        };

        match self.store.release_lock(&token).await {
            Ok(true) => {}
            Ok(false) => warn!("Lock for character {} expired before release", character_id),
            Err(e) => warn!("Failed to release lock for character {}: {}", character_id, e),
        }

        outcome
    }

    async fn locked_tick(&self, job: TickJob) -> Result<TickOutcome, CombatError> {
        let character_id = job.character_id;
        match self.lease_state(job).await? {
            LeaseState::Owned(_) => {}
            LeaseState::Vanished => {
                debug!("Lease for character {} vanished before the round", character_id);
                return Ok(TickOutcome::LeaseVanished);
            }
            LeaseState::Superseded => return Ok(TickOutcome::Superseded),
        }

        let Some(mut character) = self.db.get_character(character_id).await? else {
            warn!("Character {} has a lease but no row; dropping lease", character_id);
            self.store.delete_lease(character_id).await?;
            return Ok(TickOutcome::CharacterMissing);
        };

        // Without a map the round itself auto-stops
        if character.current_map_id.is_some() && self.refresher.is_stale(&character, now_millis()) {
            self.refresher
                .refresh(&self.db, &self.channels, &mut character)
                .await?;
        }

        let lease = match self.lease_state(job).await? {
            LeaseState::Owned(lease) => lease,
            LeaseState::Vanished => {
                debug!("Lease for character {} vanished before the round", character_id);
                return Ok(TickOutcome::LeaseVanished);
            }
            LeaseState::Superseded => return Ok(TickOutcome::Superseded),
        };
        let skill_ids = lease.effective_skills();

        let round = self.rounds.execute_round(&mut character, &skill_ids).await?;

        self.db.save_combat_state(&character).await?;
        self.db.append_combat_log(&character, &round, &skill_ids).await?;

        let outcome = round.outcome;
        self.channels.publish(CombatEvent::RoundResolved {
            character_id,
            round,
        });

        // Pick up loadout changes made while the round ran
        let current = match self.lease_state(job).await? {
            LeaseState::Owned(current) => Some(current),
            LeaseState::Vanished => None,
            LeaseState::Superseded => {
                debug!("Combat for character {} restarted during the round", character_id);
                return Ok(TickOutcome::StoppedDuringRound);
            }
        };

        if outcome.is_terminal() {
            info!("Combat for {} ({}) ended: {}", character.name, character_id, outcome.as_str());
            self.store.delete_lease(character_id).await?;
            self.db.set_fighting(character_id, false).await?;
            return Ok(TickOutcome::Finished(outcome));
        }

        let Some(current) = current else {
            debug!("Combat for character {} stopped during the round", character_id);
            return Ok(TickOutcome::StoppedDuringRound);
        };
        let settled = current.settle(&lease.cancelled_skill_ids);
        if !self
            .store
            .replace_lease(character_id, settled.to_value(), self.settings.lease_ttl)
            .await?
        {
            debug!("Combat for character {} stopped during the round", character_id);
            return Ok(TickOutcome::StoppedDuringRound);
        }

        Ok(TickOutcome::Continue)
    }

    async fn lease_state(&self, job: TickJob) -> Result<LeaseState, StoreError> {
        Ok(match self.store.get_lease(job.character_id).await? {
            None => LeaseState::Vanished,
            Some(value) => {
                let lease = CombatLease::from_value(&value);
                if lease.belongs_to(job.loop_id) {
                    LeaseState::Owned(lease)
                } else {
                    LeaseState::Superseded
                }
            }
        })
    }

    /// The store failed before the lock was taken. Retry a few times, then give up
    /// so the character is not left fighting without a loop.
    async fn store_failure(&self, job: TickJob, e: StoreError) -> TickOutcome {
        if job.store_failures >= self.settings.store_retries {
            let reason = format!("lease store failed {} time(s) in a row: {}", job.store_failures + 1, e);
            self.force_stop(job.character_id, &reason).await;
            return TickOutcome::Failed(reason);
        }

        warn!(
            "Lease store unavailable for character {} (attempt {}): {}",
            job.character_id,
            job.store_failures + 1,
            e
        );
        TickOutcome::StoreUnavailable(e.to_string())
    }

    /// Best-effort stop after a failure: drop the lease, clear the flag, tell the client.
    pub async fn force_stop(&self, character_id: i64, reason: &str) {
        error!("Force-stopping combat for character {}: {}", character_id, reason);

        if let Err(e) = self.store.delete_lease(character_id).await {
            error!("Failed to delete lease for character {}: {}", character_id, e);
        }
        if let Err(e) = self.db.set_fighting(character_id, false).await {
            error!("Failed to clear fighting flag for character {}: {}", character_id, e);
        }

        self.channels.publish(CombatEvent::AutoStopped {
            character_id,
            reason: reason.to_string(),
        });
    }
}
