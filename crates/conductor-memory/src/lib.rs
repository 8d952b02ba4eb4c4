pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::SqliteStore;
