pub mod payload;
pub mod store;

pub use payload::{normalize_skill_ids, CombatLease};
pub use store::{acquire_lock, CombatLeaseStore, InMemoryLeaseStore, LockToken};
