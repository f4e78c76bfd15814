//! Shared object model, error taxonomy, serializer and validation for
//! the vmfleet storage engine.

pub mod error;
pub mod object;
pub mod serializer;
pub mod validation;

pub use error::{Error, FieldError, Result};
pub use object::{
    GroupVersionKind, Image, Kernel, Kind, Object, ObjectMeta, PartialObject, Uid, Vm, VmSpec,
    VmStatus, Volume, API_VERSION,
};
pub use serializer::Format;
pub use validation::validate;
