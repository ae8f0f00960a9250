//! Core types shared by every ocapd crate: reference identifiers, capdata,
//! the marshaled error model, and the kernel/worker message vocabulary.

pub mod capdata;
pub mod error;
pub mod message;
pub mod refs;
pub mod state;
pub mod subcluster;

pub use capdata::{CapData, CapDataError};
pub use error::{ErrorCode, MarshaledError};
pub use message::{
    DeliveryPayload, DeliveryResult, GcActionKind, Message, Resolution, RunQueueItem, Syscall,
    VatCheckpoint,
};
pub use refs::{ERef, EndpointId, KRef, RefDirection, RefKind, RefParseError, RefSpace};
pub use state::{
    ClistEntry, EndpointRecord, KernelObject, KernelPromise, PromiseState, SubclusterRecord,
    VatRecord, VatState,
};
pub use subcluster::{CreationOptions, SubclusterConfig, VatSpec, WorkerKind};
