//! Error types for the coldctr library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, ExplorerError>`.
//!
//! # Error Categories
//!
//! - **Input errors**: [`InputMissing`], [`Io`]
//! - **Database errors**: [`DbLocked`], [`DbInvalid`], [`NoSnapshotDatabase`]
//! - **Schema errors**: [`SchemaAbsent`]
//! - **Snapshot-chain errors**: [`ChainCycle`], [`ChainDangling`], [`LowerdirEmpty`]
//! - **Entity errors**: [`NotFound`]
//! - **Privileged operation errors**: [`ShimFailure`], [`UnsupportedPlatform`]
//! - **Session errors**: [`Cancelled`]
//!
//! [`InputMissing`]: ExplorerError::InputMissing
//! [`Io`]: ExplorerError::Io
//! [`DbLocked`]: ExplorerError::DbLocked
//! [`DbInvalid`]: ExplorerError::DbInvalid
//! [`NoSnapshotDatabase`]: ExplorerError::NoSnapshotDatabase
//! [`SchemaAbsent`]: ExplorerError::SchemaAbsent
//! [`ChainCycle`]: ExplorerError::ChainCycle
//! [`ChainDangling`]: ExplorerError::ChainDangling
//! [`LowerdirEmpty`]: ExplorerError::LowerdirEmpty
//! [`NotFound`]: ExplorerError::NotFound
//! [`ShimFailure`]: ExplorerError::ShimFailure
//! [`UnsupportedPlatform`]: ExplorerError::UnsupportedPlatform
//! [`Cancelled`]: ExplorerError::Cancelled
//!
//! The propagation policy: single-object operations (info, mount one, export
//! one) surface errors to the caller; bulk operations log per-item failures
//! and keep going, returning an error only when they cannot proceed at all.

use std::path::PathBuf;

/// Result type alias for operations that may return an ExplorerError.
pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Error types for explorer operations.
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    /// A required file or directory was not found.
    #[error("required input not found: {0}")]
    InputMissing(PathBuf),

    /// The metadata database could not be opened read-only.
    #[error("database is locked: {0}")]
    DbLocked(PathBuf),

    /// The metadata database failed its magic/version check.
    #[error("invalid database {path}: {reason}")]
    DbInvalid { path: PathBuf, reason: String },

    /// An expected bucket is missing where the operation cannot treat the
    /// absence as an empty result.
    #[error("expected bucket is absent: {0}")]
    SchemaAbsent(String),

    /// The snapshot parent chain loops back on itself.
    #[error("snapshot chain contains a cycle at key {0}")]
    ChainCycle(String),

    /// A snapshot names a parent that has no node in the database.
    #[error("snapshot chain is dangling: missing node for key {0}")]
    ChainDangling(String),

    /// Overlay resolution produced no lower layer.
    #[error("container {0} resolved to an empty lowerdir")]
    LowerdirEmpty(String),

    /// The snapshotter database (metadata.db) is not available.
    #[error("snapshot database (metadata.db) is not available")]
    NoSnapshotDatabase,

    /// The requested container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// An external command exited non-zero. Carries the argv and the
    /// combined stdout/stderr output.
    #[error("command {argv:?} failed: {output}")]
    ShimFailure { argv: Vec<String>, output: String },

    /// A privileged operation was attempted on a platform that cannot
    /// execute it.
    #[error("operation '{0}' is not supported on this platform")]
    UnsupportedPlatform(&'static str),

    /// The session cancellation token was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error wrapped with the path it occurred on.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// YAML parsing error (support-container policy file).
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl ExplorerError {
    /// Wrap an I/O error with the path it occurred on, mapping "not found"
    /// onto [`ExplorerError::InputMissing`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            ExplorerError::InputMissing(path)
        } else {
            ExplorerError::Io { path, source }
        }
    }
}
