//! Execution orchestration and session storage.
//!
//! Provides:
//! - `SyncManager` - One synchronizer task per watched execution
//! - Storage implementations (memory)

pub mod manager;
pub mod storage;

pub use manager::{ManagerError, SyncCommand, SyncManager};
