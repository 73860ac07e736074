//! Tagged error taxonomy.
//!
//! Library functions return `anyhow::Result`; these types travel inside it
//! so callers (and tests) can `downcast_ref` to the failure class.

use std::path::PathBuf;

use thiserror::Error;

/// Missing or malformed registry data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no info returned for {name}")]
    NoBody { name: String },

    #[error("registry info for {name} has no versions")]
    NoVersions { name: String },

    #[error("{tag} dist tag not defined for {name}")]
    MissingDistTag { name: String, tag: String },

    #[error("{name}: dist tag {tag} points at {actual}, expected {expected}")]
    DistTagMismatch {
        name: String,
        tag: String,
        expected: String,
        actual: String,
    },

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("failed to parse registry response for {name}: {message}")]
    Malformed { name: String, message: String },

    #[error("registry request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{name}: {value:?} cannot be used as a mirror path")]
    UnsafePath { name: String, value: String },
}

/// A version requested for mirroring cannot be mirrored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MissingVersionError {
    #[error("registry info for {name} has no version {version}")]
    Version { name: String, version: String },

    #[error("registry info for {name}@{version} has no tarball")]
    Tarball { name: String, version: String },
}

/// A required option is absent or invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("module name required (pass --module or provide package.json)")]
    MissingModule,

    #[error("namespace required (pass --namespace or provide .nodeops web.staticNamespace)")]
    MissingNamespace,

    #[error("cdn base url required")]
    MissingCdn,

    #[error("release version required (pass --release-version or provide package.json)")]
    MissingReleaseVersion,

    #[error("release version {0} is not a valid semantic version")]
    InvalidReleaseVersion(String),

    #[error("{name}: dist tag {tag} points at {version}, which is not a published version")]
    DanglingDistTag {
        name: String,
        tag: String,
        version: String,
    },

    #[error("invalid env: {0}")]
    InvalidEnvironment(String),

    #[error("{path}: {message}")]
    InvalidFile { path: PathBuf, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// A lockfile that cannot be used for dependency checks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockfileError {
    #[error("expected {name} to not have any unflattened sub-dependencies - found {}", .nested.join(", "))]
    Unflattened { name: String, nested: Vec<String> },

    #[error("failed to parse lockfile {source_name}: {message}")]
    Malformed { source_name: String, message: String },
}
