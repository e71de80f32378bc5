pub mod error;
pub mod memory;
pub mod store;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use store::{ServiceStore, Store, SubmitOutcome, TaskStore};
