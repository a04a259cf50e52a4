use std::path::PathBuf;

use thiserror::Error;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type covering the failure cases of a sync run.
///
/// Per-record problems (a missing required column, a failed synthesis call)
/// are deliberately *not* represented here — those are recovered locally and
/// aggregated into [`crate::stats::RunStats`]. This enum is the fatal
/// surface: anything that must abort the run and roll back the store
/// transaction, plus the post-commit write-back failure.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local collection does not exist at the configured path. The
    /// engine never creates a store; it must be present before a run.
    #[error("collection not found: {0}")]
    StoreNotFound(PathBuf),

    /// Two distinct guids resolved to one local id within one run. Should
    /// be unreachable; aborts the run if it ever happens.
    #[error("identity conflict: local id {id} claimed by both '{first_guid}' and '{second_guid}'")]
    IdentityConflict {
        id: i64,
        first_guid: String,
        second_guid: String,
    },

    /// The remote write-back batch failed as a unit. The local store commit
    /// and the package are already durable when this is raised.
    #[error("guid write-back batch failed: {0}")]
    BatchWrite(String),

    /// The external record source could not be read.
    #[error("record source error: {0}")]
    Source(String),

    /// Wrapper for database failures from the store layer.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Wrapper for IO failures such as writing the package or media files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper for HTTP transport failures (sheets API, synthesis API).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Raised when the package archive could not be assembled.
    #[error("package error: {0}")]
    Package(#[from] zip::result::ZipError),

    /// Raised when JSON construction or parsing fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised when the configuration file is missing, unparseable, or fails
    /// validation.
    #[error("config error: {0}")]
    Config(String),

    /// Raised by a synthesis collaborator when a text-to-speech call fails.
    /// The audio cache treats this as a counted, non-fatal error.
    #[error("synthesis failed for '{phrase}': {reason}")]
    Synthesis { phrase: String, reason: String },
}
