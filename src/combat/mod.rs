pub mod control;
pub mod refresh;
pub mod round;
pub mod scheduler;
pub mod sweep;
pub mod tick;

pub use control::{CombatControl, StartOutcome, StatusView};
pub use refresh::EncounterRefresher;
pub use round::{CombatService, RoundExecutor, RoundOutcome, RoundResult};
pub use scheduler::{ScheduleTick, SchedulerSettings, TickScheduler};
pub use sweep::{MonsterRefreshSweep, SweepReport};
pub use tick::{TickHandler, TickJob, TickOutcome, TickSettings};
