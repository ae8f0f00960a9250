//! Operator-facing surfaces: the JSON-RPC control plane and the bundle
//! file server.

mod bundles;
mod methods;
mod rpc;
mod utils;

pub use rpc::{RpcApiContext, RpcHandler, map_http_requests, rpc_response, start_api};
pub use utils::{RpcErr, RpcErrorMetadata, RpcRequest, RpcRequestId};
