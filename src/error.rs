use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} is not a valid score value")]
    InvalidScore(f64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker {worker} took longer than {timeout_ms}ms (working on {working_on})")]
    WorkerTimeout {
        worker: usize,
        timeout_ms: u64,
        working_on: String,
    },

    #[error("Worker {0} disconnected before it stopped")]
    WorkerDisconnected(usize),

    #[error("Mutation error: {0}")]
    Mutation(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Db path error")]
    MissingDbPath,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FaultError>;
