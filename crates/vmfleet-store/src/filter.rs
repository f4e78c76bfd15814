//! Listing filters. A filter either needs full objects or only their
//! metadata; the filterer picks the listing strategy (and its cost)
//! accordingly.

use std::sync::Arc;

use vmfleet_common::{Error, Kind, Object, PartialObject, Result, Uid};

use crate::storage::Storage;

/// A filter over fully decoded objects.
pub trait ObjectFilter: Send + Sync {
    fn filter(&self, obj: &Object) -> bool;
    /// The reference being looked up, for error messages.
    fn describe(&self) -> String;
}

/// A filter over metadata projections only. Strictly cheaper to run
/// than an [`ObjectFilter`]: no full decode of the listed kind.
pub trait MetaFilter: Send + Sync {
    fn filter_meta(&self, partial: &PartialObject) -> bool;
    fn describe(&self) -> String;
}

/// The closed set of filter capabilities.
pub enum ListFilter {
    Object(Box<dyn ObjectFilter>),
    Meta(Box<dyn MetaFilter>),
}

impl ListFilter {
    fn describe(&self) -> String {
        match self {
            ListFilter::Object(f) => f.describe(),
            ListFilter::Meta(f) => f.describe(),
        }
    }
}

/// A filter match: full when the filter needed full objects, metadata
/// otherwise.
#[derive(Debug, Clone)]
pub enum Match {
    Full(Box<Object>),
    Meta(PartialObject),
}

impl Match {
    pub fn uid(&self) -> &Uid {
        match self {
            Match::Full(obj) => obj.uid(),
            Match::Meta(partial) => partial.uid(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Match::Full(obj) => obj.name(),
            Match::Meta(partial) => partial.name(),
        }
    }
}

/// Matches an exact object name, or a UID prefix. The usual way a human
/// refers to an object on the command line.
pub struct NameFilter {
    pub reference: String,
}

impl NameFilter {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

impl MetaFilter for NameFilter {
    fn filter_meta(&self, partial: &PartialObject) -> bool {
        partial.name() == self.reference || partial.uid().as_str().starts_with(&self.reference)
    }

    fn describe(&self) -> String {
        self.reference.clone()
    }
}

/// Matches VMs by their desired run state. Needs the full object.
pub struct VmRunningFilter {
    pub running: bool,
}

impl ObjectFilter for VmRunningFilter {
    fn filter(&self, obj: &Object) -> bool {
        obj.as_vm()
            .map(|vm| vm.status.running == self.running)
            .unwrap_or(false)
    }

    fn describe(&self) -> String {
        format!("running={}", self.running)
    }
}

/// Runs filters against a storage, choosing `list` or `list_meta` by
/// the filter's capability.
pub struct Filterer {
    storage: Arc<dyn Storage>,
}

impl Filterer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn find_all(&self, kind: Kind, filter: &ListFilter) -> Result<Vec<Match>> {
        match filter {
            ListFilter::Object(f) => Ok(self
                .storage
                .list(kind)
                .await?
                .into_iter()
                .filter(|obj| f.filter(obj))
                .map(|obj| Match::Full(Box::new(obj)))
                .collect()),
            ListFilter::Meta(f) => Ok(self
                .storage
                .list_meta(kind)
                .await?
                .into_iter()
                .filter(|partial| f.filter_meta(partial))
                .map(Match::Meta)
                .collect()),
        }
    }

    /// Expects exactly one match: zero is `NotFound`, more than one is
    /// `Ambiguous`, naming every candidate.
    pub async fn find_one(&self, kind: Kind, filter: &ListFilter) -> Result<Match> {
        let mut matches = self.find_all(kind, filter).await?;
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::NotFound(kind, Uid::from(filter.describe()))),
            _ => Err(Error::Ambiguous {
                reference: filter.describe(),
                matches: matches.iter().map(|m| m.uid().to_string()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::GenericRawStorage;
    use crate::storage::GenericStorage;

    async fn seeded_filterer(dir: &std::path::Path) -> Filterer {
        let storage = Arc::new(GenericStorage::new(Arc::new(GenericRawStorage::new(dir))));
        for (name, uid, running) in [
            ("web", "aa11", true),
            ("db", "aa22", false),
            ("batch", "bb33", true),
        ] {
            let mut obj = Object::new(Kind::Vm);
            obj.set_name(name);
            obj.set_uid(Uid::from(uid));
            if let Object::Vm(vm) = &mut obj {
                vm.status.running = running;
            }
            storage.set(&mut obj).await.unwrap();
        }
        Filterer::new(storage)
    }

    #[tokio::test]
    async fn test_exact_name_match() {
        let dir = tempfile::tempdir().unwrap();
        let filterer = seeded_filterer(dir.path()).await;

        let filter = ListFilter::Meta(Box::new(NameFilter::new("web")));
        let found = filterer.find_one(Kind::Vm, &filter).await.unwrap();
        assert_eq!(found.uid().as_str(), "aa11");
    }

    #[tokio::test]
    async fn test_uid_prefix_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        let filterer = seeded_filterer(dir.path()).await;

        let filter = ListFilter::Meta(Box::new(NameFilter::new("aa")));
        match filterer.find_one(Kind::Vm, &filter).await {
            Err(Error::Ambiguous { reference, matches }) => {
                assert_eq!(reference, "aa");
                assert_eq!(matches.len(), 2);
            }
            other => panic!("expected ambiguous error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let filterer = seeded_filterer(dir.path()).await;

        let filter = ListFilter::Meta(Box::new(NameFilter::new("missing")));
        assert!(filterer
            .find_one(Kind::Vm, &filter)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_object_filter_sees_full_objects() {
        let dir = tempfile::tempdir().unwrap();
        let filterer = seeded_filterer(dir.path()).await;

        let filter = ListFilter::Object(Box::new(VmRunningFilter { running: true }));
        let found = filterer.find_all(Kind::Vm, &filter).await.unwrap();
        let mut names: Vec<_> = found.iter().map(|m| m.name().to_string()).collect();
        names.sort();
        assert_eq!(names, ["batch", "web"]);
    }
}
