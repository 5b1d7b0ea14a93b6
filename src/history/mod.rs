pub mod storage;
pub mod store;

pub use storage::{FileStorage, HistoryStorage};
pub use store::HistoryStore;
