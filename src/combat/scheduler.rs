//! Worker pool that drives every character's tick loop.
//!
//! Ticks are independent jobs on one shared queue. A job that should continue
//! is put back on the queue after `tick_interval`; the loop for a character
//! ends as soon as its lease disappears or is taken over by a newer loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::combat::tick::{TickHandler, TickJob, TickOutcome};
use crate::config::CombatSection;

/// Longest backoff after repeated store failures, in tick intervals
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Something that can queue a tick for a character
pub trait ScheduleTick: Send + Sync {
    fn schedule(&self, job: TickJob, delay: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub worker_count: usize,
}

impl From<&CombatSection> for SchedulerSettings {
    fn from(config: &CombatSection) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            worker_count: config.worker_count,
        }
    }
}

#[derive(Clone)]
pub struct TickScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: mpsc::UnboundedSender<TickJob>,
    shutdown: watch::Sender<bool>,
}

impl TickScheduler {
    /// Spawn the worker pool
    pub fn start(handler: Arc<TickHandler>, settings: SchedulerSettings) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let scheduler = Self {
            inner: Arc::new(SchedulerInner { queue, shutdown }),
        };

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..settings.worker_count.max(1) {
            let worker = Worker {
                id: worker_id,
                handler: handler.clone(),
                rx: rx.clone(),
                shutdown: scheduler.inner.shutdown.subscribe(),
                scheduler: scheduler.clone(),
                tick_interval: settings.tick_interval,
            };
            tokio::spawn(worker.run());
        }

        info!("Tick scheduler started with {} worker(s)", settings.worker_count.max(1));
        scheduler
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop all workers. Queued and delayed ticks are dropped; leases are left
    /// in place so the loops resume on the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        info!("Tick scheduler shutting down");
    }

    fn enqueue(&self, job: TickJob) {
        if self.inner.queue.send(job).is_err() {
            debug!("Tick queue closed; dropping tick for character {}", job.character_id);
        }
    }
}

impl ScheduleTick for TickScheduler {
    fn schedule(&self, job: TickJob, delay: Duration) {
        if self.is_shutdown() {
            return;
        }
        if delay.is_zero() {
            self.enqueue(job);
            return;
        }

        let scheduler = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => scheduler.enqueue(job),
                _ = shutdown.wait_for(|stopped| *stopped) => {}
            }
        });
    }
}

struct Worker {
    id: usize,
    handler: Arc<TickHandler>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<TickJob>>>,
    shutdown: watch::Receiver<bool>,
    scheduler: TickScheduler,
    tick_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let rx = self.rx.clone();
            let next = tokio::select! {
                _ = self.shutdown.wait_for(|stopped| *stopped) => None,
                id = async move { rx.lock().await.recv().await } => id,
            };
            let Some(job) = next else {
                break;
            };

            let outcome = self.handler.run(job).await;
            debug!("Worker {} ticked character {}: {:?}", self.id, job.character_id, outcome);

            if outcome.should_reschedule() {
                let (next, delay) = match outcome {
                    TickOutcome::StoreUnavailable(_) => {
                        (job.retry(), backoff(self.tick_interval, job.store_failures))
                    }
                    _ => (job.next(), self.tick_interval),
                };
                self.scheduler.schedule(next, delay);
            }
        }
        debug!("Worker {} stopped", self.id);
    }
}

/// Doubles per consecutive failure, capped
fn backoff(tick_interval: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX).min(MAX_BACKOFF_FACTOR);
    tick_interval.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::Character;
    use crate::combat::control::CombatControl;
    use crate::combat::round::{RoundExecutor, RoundOutcome, RoundResult};
    use crate::combat::tick::tests::Harness;
    use crate::error::CombatError;
    use crate::lease::CombatLeaseStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Ongoing for `rounds` calls, then victory
    struct CountdownRounds {
        rounds: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RoundExecutor for CountdownRounds {
        async fn execute_round(
            &self,
            character: &mut Character,
            _: &[u32],
        ) -> Result<RoundResult, CombatError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = if call > self.rounds {
                RoundOutcome::Victory
            } else {
                RoundOutcome::Ongoing
            };
            Ok(RoundResult::idle(outcome, character))
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(10),
            worker_count: 2,
        }
    }

    async fn wait_until_lease_gone(h: &Harness, character_id: i64) {
        for _ in 0..500 {
            if h.store.get_lease(character_id).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lease for character {} never went away", character_id);
    }

    #[tokio::test]
    async fn test_loop_runs_until_terminal_outcome() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let job = h.lease(character.id, json!({ "skill_ids": [1] })).await;

        let rounds = Arc::new(CountdownRounds {
            rounds: 3,
            calls: AtomicUsize::new(0),
        });
        let scheduler = TickScheduler::start(Arc::new(h.handler(rounds.clone())), settings());
        scheduler.schedule(job, Duration::ZERO);

        wait_until_lease_gone(&h, character.id).await;
        // Give a stray reschedule a chance to show up
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rounds.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.db.count_combat_logs(character.id).await.unwrap(), 4);
        assert!(!h.db.get_character(character.id).await.unwrap().unwrap().is_fighting);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_deleting_lease_stops_loop() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let job = h.lease(character.id, json!({ "skill_ids": [] })).await;

        let rounds = Arc::new(CountdownRounds {
            rounds: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let scheduler = TickScheduler::start(Arc::new(h.handler(rounds.clone())), settings());
        scheduler.schedule(job, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.store.delete_lease(character.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let settled = rounds.calls.load(Ordering::SeqCst);
        assert!(settled >= 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rounds.calls.load(Ordering::SeqCst), settled);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_drops_new_ticks() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;
        let job = h.lease(character.id, json!({ "skill_ids": [] })).await;

        let rounds = Arc::new(CountdownRounds {
            rounds: 0,
            calls: AtomicUsize::new(0),
        });
        let scheduler = TickScheduler::start(Arc::new(h.handler(rounds.clone())), settings());
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());

        scheduler.schedule(job, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rounds.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.get_lease(character.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_then_start_keeps_a_single_loop() {
        let h = Harness::new().await;
        let character = h.fighter(1).await;

        let rounds = Arc::new(CountdownRounds {
            rounds: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let interval = Duration::from_millis(50);
        let scheduler = TickScheduler::start(
            Arc::new(h.handler(rounds.clone())),
            SchedulerSettings {
                tick_interval: interval,
                worker_count: 2,
            },
        );
        let control = CombatControl::new(
            h.db.clone(),
            h.store.clone(),
            h.channels.clone(),
            h.refresher.clone(),
            Arc::new(scheduler.clone()),
            Duration::from_secs(60),
        );

        control.start(character.id, vec![1]).await.unwrap();
        // First round done, the next one is waiting out its delay
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(control.stop(character.id).await.unwrap());
        control.start(character.id, vec![1]).await.unwrap();

        let before = rounds.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let window = rounds.calls.load(Ordering::SeqCst) - before;

        // One loop fits at most ten rounds in the window; two would run about twenty
        assert!(window >= 3, "loop stalled: {} round(s)", window);
        assert!(window <= 12, "more than one loop running: {} round(s)", window);
        scheduler.shutdown();
    }

    #[test]
    fn test_store_backoff_doubles_and_caps() {
        let interval = Duration::from_millis(100);
        assert_eq!(backoff(interval, 0), interval);
        assert_eq!(backoff(interval, 1), Duration::from_millis(200));
        assert_eq!(backoff(interval, 2), Duration::from_millis(400));
        assert_eq!(backoff(interval, 10), interval * MAX_BACKOFF_FACTOR);
        assert_eq!(backoff(interval, 40), interval * MAX_BACKOFF_FACTOR);
    }
}
