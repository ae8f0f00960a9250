use ocapd_common::error::ErrorCode;
use ocapd_common::refs::EndpointId;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker stream read failed: {0}")]
    StreamRead(String),
    #[error("worker handshake timed out")]
    HandshakeTimeout,
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vat {0} has no worker")]
    VatNotFound(EndpointId),
    #[error("vat {0} already has a worker")]
    VatAlreadyExists(EndpointId),
    #[error("mux channel {0} is already open")]
    ChannelExists(u64),
    #[error("mux channel {0} is not open")]
    ChannelNotFound(u64),
    #[error("no worker command configured for process vats")]
    NoWorkerCommand,
}

impl WorkerError {
    /// Maps transport failures onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::StreamRead(_) | WorkerError::Io(_) => ErrorCode::StreamReadError,
            WorkerError::HandshakeTimeout | WorkerError::Protocol(_) | WorkerError::Json(_) => {
                ErrorCode::SupervisorReadError
            }
            WorkerError::VatNotFound(_) => ErrorCode::VatNotFound,
            WorkerError::VatAlreadyExists(_) => ErrorCode::VatAlreadyExists,
            WorkerError::ChannelExists(_) => ErrorCode::CaptpConnectionExists,
            WorkerError::ChannelNotFound(_) => ErrorCode::CaptpConnectionNotFound,
            _ => ErrorCode::DeliveryFailed,
        }
    }
}
