use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt: {0}")]
    State(#[from] serde_json::Error),

    #[error("a task for {0} already exists")]
    Duplicate(String),

    #[error("event dispatcher has shut down")]
    DispatcherClosed,
}

pub type Result<T> = std::result::Result<T, DownloadError>;
