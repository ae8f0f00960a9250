//! Transactional persistence for all kernel state.
//!
//! Everything the kernel knows lives in one key/value namespace with a fixed
//! key schema (see [`keys`]). A delivery cycle buffers its mutations in a
//! [`KernelTx`] and commits them in a single atomic batch; recovery reloads
//! every table with prefix scans.

pub mod api;
pub mod error;
pub mod keys;
pub mod store;
pub mod store_db;

pub use api::{StoreEngine, WriteBatch};
pub use error::StoreError;
pub use store::{EngineType, KernelTx, Store, COMMIT_RETRIES};
