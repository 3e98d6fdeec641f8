use partalloc_pages::PageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("page access: {0}")]
    Page(#[from] PageError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid workload: {0}")]
    InvalidConfig(String),
    #[error("worker thread {thread} panicked")]
    WorkerPanicked { thread: usize },
    #[error("{count} invalid log line(s), first: {first}")]
    InvalidLog { count: usize, first: String },
}
