//! Error types for chat-notifier-core operations.

use std::path::PathBuf;

/// All errors that can occur in chat-notifier-core operations.
///
/// None of these are fatal to the page monitor or the reconciler; callers log
/// them and degrade to "miss this one signal".
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Browser Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Tab not found: {0}")]
    TabNotFound(i64),

    #[error("Notification failed: {0}")]
    NotificationFailed(String),

    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },
}

/// Convenience type alias for Results using NotifierError.
pub type Result<T> = std::result::Result<T, NotifierError>;

impl From<NotifierError> for String {
    fn from(err: NotifierError) -> String {
        err.to_string()
    }
}
