//! Encoding and decoding of API objects to/from their persisted byte
//! representations.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::object::{Object, PartialObject};

/// The encoding of a stored object, derived from the file extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl Format {
    /// Maps a file extension to its format. Returns `None` for files the
    /// storage layer does not recognize as object manifests.
    pub fn from_path(path: &Path) -> Option<Format> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(Format::Json),
            Some("yaml") | Some("yml") => Some(Format::Yaml),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
        }
    }
}

pub fn encode(obj: &Object, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => encode_json(obj),
        Format::Yaml => encode_yaml(obj),
    }
}

pub fn encode_json(obj: &Object) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(obj)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn encode_yaml(obj: &Object) -> Result<Vec<u8>> {
    Ok(serde_yaml::to_string(obj)?.into_bytes())
}

pub fn decode(bytes: &[u8], format: Format) -> Result<Object> {
    let obj = match format {
        Format::Json => serde_json::from_slice(bytes)?,
        Format::Yaml => serde_yaml::from_slice(bytes)?,
    };
    Ok(obj)
}

/// Decodes only the identity of an object (kind, apiVersion, metadata).
/// The YAML parser accepts JSON input too, so this handles both formats.
/// Unknown kinds fail with a decode error; unknown fields are ignored.
pub fn decode_partial(bytes: &[u8]) -> Result<PartialObject> {
    let partial: PartialObject = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::Decode(format!("not a recognized object manifest: {e}")))?;
    Ok(partial)
}
