use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Could not determine the application data directory")]
    NoDataDir,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Credential file is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session key is empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("No login command configured (set `login_command` in settings)")]
    NotConfigured,

    #[error("A login is already in progress")]
    InProgress,

    #[error("Failed to launch login tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Login timed out after {0}s")]
    TimedOut(u64),

    #[error("Login tool exited with status {0}")]
    Failed(std::process::ExitStatus),

    #[error("Login tool did not print a session key")]
    NoToken,

    #[error("Login cancelled")]
    Cancelled,

    #[error(transparent)]
    Credential(#[from] CredentialError),
}
