//! Inbound combat operations: start, stop, loadout changes and status.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broadcast::CombatChannels;
use crate::character::Character;
use crate::combat::refresh::{now_millis, EncounterRefresher};
use crate::combat::scheduler::ScheduleTick;
use crate::combat::tick::TickJob;
use crate::db::Database;
use crate::error::CombatError;
use crate::lease::{CombatLease, CombatLeaseStore};
use crate::protocol::CombatEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// A loop was already running; only the loadout changed
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub character: Character,
    pub lease_active: bool,
    pub lease: Option<CombatLease>,
}

pub struct CombatControl {
    db: Arc<Database>,
    store: Arc<dyn CombatLeaseStore>,
    channels: Arc<CombatChannels>,
    refresher: Arc<EncounterRefresher>,
    scheduler: Arc<dyn ScheduleTick>,
    lease_ttl: Duration,
}

impl CombatControl {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn CombatLeaseStore>,
        channels: Arc<CombatChannels>,
        refresher: Arc<EncounterRefresher>,
        scheduler: Arc<dyn ScheduleTick>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            db,
            store,
            channels,
            refresher,
            scheduler,
            lease_ttl,
        }
    }

    async fn load(&self, character_id: i64) -> Result<Character, CombatError> {
        self.db
            .get_character(character_id)
            .await?
            .ok_or(CombatError::CharacterNotFound(character_id))
    }

    pub async fn start(&self, character_id: i64, skill_ids: Vec<u32>) -> Result<StartOutcome, CombatError> {
        let mut character = self.load(character_id).await?;
        if character.current_map_id.is_none() {
            return Err(CombatError::NoMap(character_id));
        }

        // A lease without a loop id has no loop behind it; start a fresh one
        let existing = self
            .store
            .get_lease(character_id)
            .await?
            .map(|value| CombatLease::from_value(&value))
            .and_then(|lease| lease.loop_id.map(|loop_id| (lease.started_at, loop_id)));
        if let Some((started_at, loop_id)) = existing {
            let lease = CombatLease::new(skill_ids.clone(), started_at).with_loop(loop_id);
            if self
                .store
                .replace_lease(character_id, lease.to_value(), self.lease_ttl)
                .await?
            {
                self.db.set_fighting(character_id, true).await?;
                info!("Combat already running for character {}; loadout updated", character_id);
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        let loop_id = Uuid::new_v4();
        let lease = CombatLease::new(skill_ids, now_millis()).with_loop(loop_id);
        self.store
            .put_lease(character_id, lease.to_value(), self.lease_ttl)
            .await?;
        self.db.set_fighting(character_id, true).await?;
        character.is_fighting = true;

        if self.refresher.is_stale(&character, now_millis()) {
            self.refresher
                .refresh(&self.db, &self.channels, &mut character)
                .await?;
        }

        self.channels.publish(CombatEvent::CombatStarted {
            character_id,
            skill_ids: lease.skill_ids.clone(),
        });
        self.scheduler.schedule(TickJob::new(character_id, loop_id), Duration::ZERO);

        info!("{} ({}) started combat with skills {:?}", character.name, character_id, lease.skill_ids);
        Ok(StartOutcome::Started)
    }

    /// Returns true if a running loop was stopped
    pub async fn stop(&self, character_id: i64) -> Result<bool, CombatError> {
        self.load(character_id).await?;

        let was_running = self.store.delete_lease(character_id).await?;
        self.db.set_fighting(character_id, false).await?;
        self.channels.publish(CombatEvent::CombatStopped { character_id });

        info!("Combat stopped for character {} (was running: {})", character_id, was_running);
        Ok(was_running)
    }

    pub async fn update_skills(&self, character_id: i64, skill_ids: Vec<u32>) -> Result<CombatLease, CombatError> {
        let current = self.current_lease(character_id).await?;
        let lease = CombatLease {
            loop_id: current.loop_id,
            ..CombatLease::new(skill_ids, current.started_at)
        };
        self.write_back(character_id, &lease).await?;
        Ok(lease)
    }

    /// Drop a skill from the loadout starting with the next round
    pub async fn cancel_skill(&self, character_id: i64, skill_id: u32) -> Result<CombatLease, CombatError> {
        let mut lease = self.current_lease(character_id).await?;
        lease.cancel(skill_id);
        self.write_back(character_id, &lease).await?;
        Ok(lease)
    }

    pub async fn status(&self, character_id: i64) -> Result<StatusView, CombatError> {
        let character = self.load(character_id).await?;
        let lease = self
            .store
            .get_lease(character_id)
            .await?
            .map(|value| CombatLease::from_value(&value));

        Ok(StatusView {
            character,
            lease_active: lease.is_some(),
            lease,
        })
    }

    /// Start a new loop for every character that still holds a lease.
    /// Each lease is handed to a fresh loop id so nothing queued before stays live.
    pub async fn resume_leased(&self) -> Result<usize, CombatError> {
        let mut resumed = 0;
        for character_id in self.store.leased_characters().await? {
            let Some(value) = self.store.get_lease(character_id).await? else {
                continue;
            };
            let loop_id = Uuid::new_v4();
            let lease = CombatLease::from_value(&value).with_loop(loop_id);
            if !self
                .store
                .replace_lease(character_id, lease.to_value(), self.lease_ttl)
                .await?
            {
                debug!("Lease for character {} expired before resume", character_id);
                continue;
            }
            self.scheduler.schedule(TickJob::new(character_id, loop_id), Duration::ZERO);
            resumed += 1;
        }
        if resumed > 0 {
            info!("Resumed combat loops for {} character(s)", resumed);
        }
        Ok(resumed)
    }

    async fn current_lease(&self, character_id: i64) -> Result<CombatLease, CombatError> {
        self.store
            .get_lease(character_id)
            .await?
            .map(|value| CombatLease::from_value(&value))
            .ok_or(CombatError::NotFighting(character_id))
    }

    async fn write_back(&self, character_id: i64, lease: &CombatLease) -> Result<(), CombatError> {
        if self
            .store
            .replace_lease(character_id, lease.to_value(), self.lease_ttl)
            .await?
        {
            Ok(())
        } else {
            Err(CombatError::NotFighting(character_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::tick::tests::Harness;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(TickJob, Duration)>>,
    }

    impl RecordingScheduler {
        fn jobs(&self) -> Vec<TickJob> {
            self.scheduled.lock().unwrap().iter().map(|(job, _)| *job).collect()
        }
    }

    impl ScheduleTick for RecordingScheduler {
        fn schedule(&self, job: TickJob, delay: Duration) {
            self.scheduled.lock().unwrap().push((job, delay));
        }
    }

    fn control(h: &Harness, scheduler: Arc<RecordingScheduler>) -> CombatControl {
        CombatControl::new(
            h.db.clone(),
            h.store.clone(),
            h.channels.clone(),
            h.refresher.clone(),
            scheduler,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_start_writes_lease_and_queues_first_tick() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        h.db.set_fighting(character.id, false).await.unwrap();
        let scheduler = Arc::new(RecordingScheduler::default());
        let control = control(&h, scheduler.clone());
        let mut rx = h.channels.subscribe(character.id);

        let outcome = control.start(character.id, vec![5, 6, 5]).await.unwrap();

        assert_eq!(outcome, StartOutcome::Started);
        let scheduled = scheduler.scheduled.lock().unwrap().clone();
        assert_eq!(scheduled.len(), 1);
        let (job, delay) = scheduled[0];
        assert_eq!((job.character_id, delay), (character.id, Duration::ZERO));

        let status = control.status(character.id).await.unwrap();
        assert!(status.lease_active);
        assert!(status.character.is_fighting);
        let lease = status.lease.unwrap();
        assert_eq!(lease.skill_ids, vec![5, 6]);
        assert!(lease.belongs_to(job.loop_id));
        assert_eq!(status.character.living_monsters().count(), 2);

        assert!(matches!(rx.try_recv(), Ok(CombatEvent::MonstersAppeared { .. })));
        assert!(matches!(rx.try_recv(), Ok(CombatEvent::CombatStarted { skill_ids, .. }) if skill_ids == vec![5, 6]));
    }

    #[tokio::test]
    async fn test_second_start_only_updates_loadout() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let control = control(&h, scheduler.clone());

        control.start(character.id, vec![1]).await.unwrap();
        let started_at = control.status(character.id).await.unwrap().lease.unwrap().started_at;

        let outcome = control.start(character.id, vec![2]).await.unwrap();

        assert_eq!(outcome, StartOutcome::AlreadyRunning);
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        let lease = control.status(character.id).await.unwrap().lease.unwrap();
        assert_eq!(lease.skill_ids, vec![2]);
        assert_eq!(lease.started_at, started_at);
        assert!(lease.belongs_to(jobs[0].loop_id));
    }

    #[tokio::test]
    async fn test_restart_after_stop_mints_new_loop() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let control = control(&h, scheduler.clone());

        control.start(character.id, vec![1]).await.unwrap();
        control.stop(character.id).await.unwrap();
        assert_eq!(control.start(character.id, vec![1]).await.unwrap(), StartOutcome::Started);

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        assert_ne!(jobs[0].loop_id, jobs[1].loop_id);
        let lease = control.status(character.id).await.unwrap().lease.unwrap();
        assert!(lease.belongs_to(jobs[1].loop_id));
    }

    #[tokio::test]
    async fn test_lease_without_loop_is_restarted() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        h.store
            .put_lease(character.id, CombatLease::new(vec![1], 3).to_value(), Duration::from_secs(60))
            .await
            .unwrap();
        let scheduler = Arc::new(RecordingScheduler::default());

        let outcome = control(&h, scheduler.clone()).start(character.id, vec![2]).await.unwrap();

        assert_eq!(outcome, StartOutcome::Started);
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        let lease = CombatLease::from_value(&h.store.get_lease(character.id).await.unwrap().unwrap());
        assert!(lease.belongs_to(jobs[0].loop_id));
        assert_eq!(lease.skill_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_start_requires_character_and_map() {
        let h = Harness::new().await;
        let control = control(&h, Arc::new(RecordingScheduler::default()));

        assert!(matches!(control.start(404, vec![]).await, Err(CombatError::CharacterNotFound(404))));

        let character = h.fighter(1).await;
        h.db.set_map(character.id, None).await.unwrap();
        assert!(matches!(control.start(character.id, vec![]).await, Err(CombatError::NoMap(_))));
        assert!(h.store.get_lease(character.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_clears_lease_and_flag() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let control = control(&h, Arc::new(RecordingScheduler::default()));
        control.start(character.id, vec![1]).await.unwrap();
        let mut rx = h.channels.subscribe(character.id);

        assert!(control.stop(character.id).await.unwrap());
        assert!(!control.stop(character.id).await.unwrap());

        let status = control.status(character.id).await.unwrap();
        assert!(!status.lease_active);
        assert!(!status.character.is_fighting);
        assert_eq!(rx.try_recv().unwrap(), CombatEvent::CombatStopped { character_id: character.id });
    }

    #[tokio::test]
    async fn test_loadout_changes_need_a_lease() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let control = control(&h, Arc::new(RecordingScheduler::default()));

        assert!(matches!(
            control.update_skills(character.id, vec![1]).await,
            Err(CombatError::NotFighting(_))
        ));
        assert!(matches!(control.cancel_skill(character.id, 1).await, Err(CombatError::NotFighting(_))));

        let job = h.lease(character.id, json!({ "skill_ids": ["1", 2], "started_at": 9 })).await;

        let lease = control.update_skills(character.id, vec![3, 4]).await.unwrap();
        assert_eq!(lease, CombatLease::new(vec![3, 4], 9).with_loop(job.loop_id));

        let lease = control.cancel_skill(character.id, 4).await.unwrap();
        assert_eq!(lease.cancelled_skill_ids, vec![4]);
        assert_eq!(lease.effective_skills(), vec![3]);
        assert_eq!(control.status(character.id).await.unwrap().lease, Some(lease));
    }

    #[tokio::test]
    async fn test_resume_leased_queues_every_loop() {
        let h = Harness::new().await;
        let before = h.lease(3, json!({})).await;
        h.lease(1, json!({})).await;
        let scheduler = Arc::new(RecordingScheduler::default());

        assert_eq!(control(&h, scheduler.clone()).resume_leased().await.unwrap(), 2);
        let jobs = scheduler.jobs();
        let ids: Vec<i64> = jobs.iter().map(|job| job.character_id).collect();
        assert_eq!(ids, vec![1, 3]);

        // Resumed under a new generation
        let lease = CombatLease::from_value(&h.store.get_lease(3).await.unwrap().unwrap());
        assert!(lease.belongs_to(jobs[1].loop_id));
        assert!(!lease.belongs_to(before.loop_id));
    }
}
