//! Virtual storage paths derived from object identity.

use std::fmt;

use vmfleet_common::{Error, Kind, Result, Uid};

/// The virtual path prefix for a whole Kind, used for listing and
/// counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindKey(pub Kind);

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.lowercase())
    }
}

/// The virtual path of one object: `<kind-lowercase>/<uid>`. Stable for
/// the object's lifetime and collision-free across kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: Kind,
    pub uid: Uid,
}

impl ObjectKey {
    pub fn new(kind: Kind, uid: Uid) -> Self {
        Self { kind, uid }
    }

    pub fn kind_key(&self) -> KindKey {
        KindKey(self.kind)
    }

    /// Parses a `<kind>/<uid>` virtual path.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.trim_matches('/').splitn(2, '/');
        let kind = parts.next().unwrap_or_default();
        let uid = parts
            .next()
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .ok_or_else(|| Error::Decode(format!("invalid object key {input:?}")))?;
        Ok(Self {
            kind: kind.parse()?,
            uid: Uid::from(uid),
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.lowercase(), self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_is_lowercased() {
        let key = ObjectKey::new(Kind::Vm, Uid::from("abc123"));
        assert_eq!(key.to_string(), "vm/abc123");
        assert_eq!(key.kind_key().to_string(), "vm");
    }

    #[test]
    fn test_key_parse_round_trip() {
        let key = ObjectKey::parse("vm/abc123").unwrap();
        assert_eq!(key.kind, Kind::Vm);
        assert_eq!(key.uid.as_str(), "abc123");
        assert_eq!(ObjectKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(ObjectKey::parse("vm").is_err());
        assert!(ObjectKey::parse("vm/").is_err());
        assert!(ObjectKey::parse("pod/abc").is_err());
    }

    #[test]
    fn test_keys_are_collision_free_across_kinds() {
        let a = ObjectKey::new(Kind::Vm, Uid::from("x"));
        let b = ObjectKey::new(Kind::Image, Uid::from("x"));
        assert_ne!(a.to_string(), b.to_string());
    }
}
