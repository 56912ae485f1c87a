use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode config record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("refusing to persist invalid config: {0}")]
    Invalid(&'static str),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker refused connection (rc={0})")]
    Refused(i32),
    #[error("timed out waiting for broker")]
    Timeout,
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("broker client is not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network backend error: {0}")]
    Backend(String),
}
