//! Crash-safe persisted state: atomic records, the per-task record, the node
//! cache record and the advisory lock guarding shared ones.

pub mod cache_state;
pub mod lock;
pub mod record;
pub mod task_state;

pub use self::cache_state::{CacheStateRecord, OpenReservation, Reservation};
pub use self::lock::FileLock;
pub use self::task_state::{TaskDir, TaskStateRecord};
