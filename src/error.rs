use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unparseable resource unit: {0:?}")]
    UnparseableUnit(String),

    #[error("negative resource value: {0:?}")]
    NegativeValue(String),

    #[error("requested resources exceed node capacity")]
    CapacityExceeded,

    #[error("bid rejected by requester node")]
    PeerRejected,

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("process exited with non-zero code {0}")]
    NonZeroExitCode(i32),

    #[error("operation cancelled")]
    CancellationRequested,

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("outbound event channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
