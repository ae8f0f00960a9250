//! Utility types and error handling for JSON-RPC.

use ocapd_kernel::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for JSON-RPC method failures.
///
/// Each variant maps to a specific JSON-RPC error code when serialized:
/// - `-32601`: Method not found
/// - `-32602`: Invalid params
/// - `-32603`: Internal error
/// - `-32000`: Generic server error (kernel-reported failures land here,
///   carrying the stable kernel error code in `data`)
#[derive(Debug, thiserror::Error)]
pub enum RpcErr {
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    BadParams(String),
    #[error("Missing parameter: {0}")]
    MissingParam(String),
    #[error("Internal Error: {0}")]
    Internal(String),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl From<RpcErr> for RpcErrorMetadata {
    fn from(value: RpcErr) -> Self {
        match value {
            RpcErr::MethodNotFound(bad_method) => RpcErrorMetadata {
                code: -32601,
                data: None,
                message: format!("Method not found: {bad_method}"),
            },
            RpcErr::BadParams(context) => RpcErrorMetadata {
                code: -32602,
                data: None,
                message: format!("Invalid params: {context}"),
            },
            RpcErr::MissingParam(parameter_name) => RpcErrorMetadata {
                code: -32602,
                data: None,
                message: format!("Expected parameter: {parameter_name} is missing"),
            },
            RpcErr::Internal(context) => RpcErrorMetadata {
                code: -32603,
                data: None,
                message: format!("Internal Error: {context}"),
            },
            RpcErr::Kernel(err) => RpcErrorMetadata {
                code: -32000,
                data: err.code().map(|code| code.as_str().to_string()),
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for RpcErr {
    fn from(error: serde_json::Error) -> Self {
        Self::BadParams(error.to_string())
    }
}

/// JSON-RPC request identifier. Per the JSON-RPC 2.0 spec, request IDs can
/// be either numbers or strings.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcRequestId {
    Number(u64),
    String(String),
}

/// A parsed JSON-RPC 2.0 request.
#[derive(Serialize, Deserialize, Debug)]
pub struct RpcRequest {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Vec<Value>>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Option<Vec<Value>>) -> Self {
        RpcRequest {
            id: RpcRequestId::Number(1),
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// Kernel methods accept both bare names (`getStatus`) and the
    /// namespaced form (`kernel_getStatus`); `admin_*` is its own
    /// namespace.
    pub fn kernel_method(&self) -> Option<&str> {
        match self.method.split_once('_') {
            Some(("kernel", rest)) => Some(rest),
            Some(("admin", _)) => None,
            _ => Some(self.method.as_str()),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.method.starts_with("admin_")
    }
}

impl Default for RpcRequest {
    fn default() -> Self {
        RpcRequest {
            id: RpcRequestId::Number(1),
            jsonrpc: "2.0".to_string(),
            method: "".to_string(),
            params: None,
        }
    }
}

/// Error metadata for JSON-RPC error responses.
#[derive(Serialize, Deserialize, Debug)]
pub struct RpcErrorMetadata {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcSuccessResponse {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcErrorResponse {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub error: RpcErrorMetadata,
}
