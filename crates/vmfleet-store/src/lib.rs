//! File-backed typed object storage with caching, watching and
//! multi-backend synchronization.
//!
//! The layering, bottom up: [`raw::RawStorage`] persists bytes under a
//! directory tree; [`storage::Storage`] adds typed object identity and
//! strategic-merge patching; [`cache::Cache`] serves repeat reads from
//! memory behind checksum checks; [`watch::GenericWatchStorage`] turns
//! external file edits into typed update events; [`sync::SyncStorage`]
//! keeps several backends consistent and merges their event streams.

pub mod cache;
pub mod filter;
pub mod key;
pub mod patch;
pub mod raw;
pub mod storage;
pub mod sync;
pub mod update;
pub mod watch;

pub use cache::Cache;
pub use filter::{Filterer, ListFilter, MetaFilter, NameFilter, ObjectFilter};
pub use key::{KindKey, ObjectKey};
pub use raw::{GenericRawStorage, ManifestRawStorage, RawStorage, METADATA_FILE};
pub use storage::{new_object, GenericStorage, Storage};
pub use sync::SyncStorage;
pub use update::{AssociatedUpdate, Event, FileUpdate, Update};
pub use watch::{GenericWatchStorage, WatchOptions};
