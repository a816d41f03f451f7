//! Error kinds recognized while importing assets.
//!
//! Loader functions return `anyhow::Result` and wrap one of these kinds when
//! the failure is something a caller may want to match on. Use
//! `err.downcast_ref::<ImportError>()` to inspect it.

use std::{fmt, path::PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum ImportError {
    /// The file does not exist or could not be opened.
    FileNotFound(PathBuf),
    /// The path has no usable file name or extension.
    InvalidPath(PathBuf),
    /// A mesh or file format the importer cannot handle (e.g. quads in a
    /// triangle-only FBX path). Meshes are skipped, files are rejected.
    UnsupportedFormat(String),
    /// A stream or property the pipeline cannot do without.
    MissingRequiredField(String),
    /// A glTF accessor uses a component type that is not valid for the stream.
    UnrecognizedComponentType { stream: &'static str, component: String },
    /// A primitive refers to a material that does not exist.
    MaterialIndexOutOfRange { index: usize, count: usize },
    /// Instance `instance` could not find the entity created by instance 0.
    InstanceLookupMiss { node: usize, instance: usize },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::FileNotFound(path) => write!(f, "file not found: {}", path.display()),
            ImportError::InvalidPath(path) => write!(f, "invalid path: {}", path.display()),
            ImportError::UnsupportedFormat(what) => write!(f, "unsupported format: {what}"),
            ImportError::MissingRequiredField(what) => write!(f, "missing required field: {what}"),
            ImportError::UnrecognizedComponentType { stream, component } => {
                write!(f, "unrecognized component type {component} for {stream}")
            }
            ImportError::MaterialIndexOutOfRange { index, count } => write!(
                f,
                "material index {index} out of range ({count} materials)"
            ),
            ImportError::InstanceLookupMiss { node, instance } => write!(
                f,
                "instance {instance}: no first-instance entity recorded for source node {node}"
            ),
        }
    }
}

impl std::error::Error for ImportError {}

/// Returns the import error kind carried by `err`, if any.
pub fn kind(err: &anyhow::Error) -> Option<&ImportError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ImportError>())
}
