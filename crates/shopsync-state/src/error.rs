//! Watermark store error types.

use shopsync_types::watermark::Watermark;

/// Errors produced by [`WatermarkStore`](crate::WatermarkStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored watermark could not be decoded.
    #[error("corrupt watermark for {dataset}: {source}")]
    Corrupt {
        dataset: String,
        #[source]
        source: serde_json::Error,
    },

    /// Commit with a cursor kind different from the stored one.
    #[error("watermark kind changed for {dataset}: stored {stored:?}, committing {requested:?}")]
    KindChanged {
        dataset: String,
        stored: Watermark,
        requested: Watermark,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("watermark store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
