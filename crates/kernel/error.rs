use ocapd_common::capdata::CapDataError;
use ocapd_common::error::ErrorCode;
use ocapd_common::refs::{EndpointId, RefParseError};
use ocapd_storage::StoreError;
use ocapd_worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("capdata error: {0}")]
    CapData(#[from] CapDataError),
    #[error("reference parse error: {0}")]
    RefParse(#[from] RefParseError),
    #[error("vat {0} not found")]
    VatNotFound(EndpointId),
    #[error("subcluster {0} not found")]
    SubclusterNotFound(String),
    #[error("unknown or foreign reference {0}")]
    InvalidReference(String),
    #[error("{0} was revoked")]
    Revoked(String),
    #[error("bad syscall from {vat}: {reason}")]
    BadSyscall { vat: EndpointId, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("kernel command channel closed")]
    ChannelClosed,
}

impl KernelError {
    /// Stable code for conditions in the wire taxonomy.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            KernelError::VatNotFound(_) => Some(ErrorCode::VatNotFound),
            KernelError::InvalidReference(_) => Some(ErrorCode::InvalidReference),
            KernelError::Revoked(_) => Some(ErrorCode::Revoked),
            KernelError::BadSyscall { .. } => Some(ErrorCode::BadSyscall),
            KernelError::Worker(err) => Some(err.code()),
            _ => None,
        }
    }
}
