//! Custom error types for the clone agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Command `{command}` failed (exit code {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, CloneError>;
