/// Errors surfaced by the message store and its compactor.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("journal error: {0}")]
    Journal(String),
    #[error("page {id}: {reason}")]
    Page { id: String, reason: String },
    #[error("budget configuration rejected: {0}")]
    Budget(String),
    #[error("pairing invariant could not be restored: {0}")]
    Invariant(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the retrieval side: embedding calls, the index file, the
/// batch re-summarizer.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a chat driver. The core consumes drivers; it never implements
/// a wire protocol itself.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("stream aborted")]
    Aborted,
}
