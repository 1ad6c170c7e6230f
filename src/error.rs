use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailcontrolError {
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    #[error("invalid json")]
    Json(#[from] serde_json::Error),

    #[error("unknown conflict behavior {0:?}, expected rename, skip or overwrite")]
    InvalidConflictBehavior(String),

    #[error("invalid process id {0:?}")]
    InvalidPid(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("process control failed: {0}")]
    Process(String),

    #[error("tailscale rejected the request: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, TailcontrolError>;
