//! Update events flowing from watchers to the reconcile loop.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use vmfleet_common::PartialObject;

use crate::storage::Storage;

/// A change in a file's or object's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::Create => "CREATE",
            Event::Modify => "MODIFY",
            Event::Delete => "DELETE",
        })
    }
}

/// A state change of one file, as observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub event: Event,
    pub path: PathBuf,
}

/// A state change of one object, after the file has been resolved to its
/// typed identity.
#[derive(Debug, Clone)]
pub struct Update {
    pub event: Event,
    pub partial: PartialObject,
}

/// An [`Update`] bundled with the storage that produced it, so consumers
/// can fetch the full object from the right backend.
#[derive(Clone)]
pub struct AssociatedUpdate {
    pub update: Update,
    pub storage: Arc<dyn Storage>,
}

impl fmt::Debug for AssociatedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociatedUpdate")
            .field("update", &self.update)
            .finish_non_exhaustive()
    }
}
