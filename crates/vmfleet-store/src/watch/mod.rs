//! Filesystem watching and the watch-backed storage.

pub mod storage;
pub mod watcher;

pub use storage::GenericWatchStorage;
pub use watcher::{FileWatcher, SuspendSlot, WatchOptions, EVENT_BUFFER};
