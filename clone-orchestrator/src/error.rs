#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    MissingVar(Vec<String>),

    #[error("invalid value '{value}' for {name}")]
    InvalidVar { name: String, value: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` on {host} exited with {code}: {stderr}")]
    RemoteCommand {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
