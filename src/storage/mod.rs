pub mod log_storage;
pub mod state_storage;

pub use log_storage::{FileLogStorage, LogStorage, MemLogStorage};
pub use state_storage::{FileStateStorage, MemStateStorage, PersistentState, StateStorage};
