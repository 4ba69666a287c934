pub mod prototype;
pub mod registry;
pub mod spawn_table;
pub mod spawner;

pub use prototype::{LootEntry, MonsterPrototype};
pub use registry::MonsterRegistry;
pub use spawn_table::{MapDef, MapRegistry};
pub use spawner::{generate_encounter, roll_gold, roll_loot};
