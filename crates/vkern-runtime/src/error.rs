#![forbid(unsafe_code)]

//! Errors raised by stores, lenses, and merges.

use std::fmt;

use vkern_core::error::ContextMisuseError;

/// A lens path step that no longer resolves against the current value.
///
/// Recoverable: the store is unchanged and the caller may retry with a fresh
/// lens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LensError {
    /// Sequence index past the end (e.g. after the list shrank).
    OutOfRange {
        /// Path up to and including the failing step.
        path: String,
        index: usize,
        len: usize,
    },
    /// Mapping key absent on an intermediate step.
    MissingKey { path: String, key: String },
    /// Record has no field with this name.
    MissingField { path: String, field: String },
    /// The step does not apply to the value found there.
    NotAContainer {
        path: String,
        /// Kind of value found (`"int"`, `"map"`, ...).
        found: &'static str,
    },
}

impl LensError {
    /// Path at which resolution failed.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::OutOfRange { path, .. }
            | Self::MissingKey { path, .. }
            | Self::MissingField { path, .. }
            | Self::NotAContainer { path, .. } => path,
        }
    }
}

impl fmt::Display for LensError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { path, index, len } => {
                write!(f, "index {index} out of range for length {len} at {path}")
            }
            Self::MissingKey { path, key } => write!(f, "missing key {key:?} at {path}"),
            Self::MissingField { path, field } => write!(f, "no field {field:?} at {path}"),
            Self::NotAContainer { path, found } => {
                write!(f, "cannot step into {found} value at {path}")
            }
        }
    }
}

impl std::error::Error for LensError {}

/// A partial update could not be merged into the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// The record type has no such field.
    UnknownField { record: String, field: String },
    /// The current value is not record- or mapping-like.
    NotMergeable { found: &'static str },
    /// A custom merge rejected the patch.
    Rejected(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField { record, field } => {
                write!(f, "record {record} has no field {field:?}")
            }
            Self::NotMergeable { found } => write!(f, "cannot merge fields into a {found} value"),
            Self::Rejected(reason) => write!(f, "merge rejected: {reason}"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Umbrella error for store construction and access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The storage key is already used by a store of another value type.
    KeyCollision {
        key: String,
        existing: &'static str,
        requested: &'static str,
    },
    Lens(LensError),
    Merge(MergeError),
    Misuse(ContextMisuseError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyCollision {
                key,
                existing,
                requested,
            } => write!(
                f,
                "store key {key:?} already holds {existing}, cannot reuse it for {requested}"
            ),
            Self::Lens(err) => write!(f, "lens error: {err}"),
            Self::Merge(err) => write!(f, "merge error: {err}"),
            Self::Misuse(err) => write!(f, "context misuse: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lens(err) => Some(err),
            Self::Merge(err) => Some(err),
            Self::Misuse(err) => Some(err),
            Self::KeyCollision { .. } => None,
        }
    }
}

impl From<LensError> for StoreError {
    fn from(err: LensError) -> Self {
        Self::Lens(err)
    }
}

impl From<MergeError> for StoreError {
    fn from(err: MergeError) -> Self {
        Self::Merge(err)
    }
}

impl From<ContextMisuseError> for StoreError {
    fn from(err: ContextMisuseError) -> Self {
        Self::Misuse(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn out_of_range_message() {
        let err = LensError::OutOfRange {
            path: "$.items[1]".into(),
            index: 1,
            len: 1,
        };
        assert_eq!(err.to_string(), "index 1 out of range for length 1 at $.items[1]");
        assert_eq!(err.path(), "$.items[1]");
    }

    #[test]
    fn store_error_wraps_sources() {
        let err = StoreError::from(MergeError::NotMergeable { found: "int" });
        assert!(err.source().is_some());
        let collision = StoreError::KeyCollision {
            key: "counter".into(),
            existing: "i64",
            requested: "String",
        };
        assert!(collision.source().is_none());
        assert!(collision.to_string().contains("counter"));
    }
}
