use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::State;
use axum::{Json, Router, http::StatusCode, routing::get, routing::post};
use ocapd_kernel::KernelHandle;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::bundles;
use crate::methods::{
    ClearStateRequest, CollectGarbageRequest, GetStatusRequest, LaunchSubclusterRequest,
    LaunchVatRequest, PingVatRequest, QueueMessageRequest, ReloadRequest, RestartVatRequest,
    TerminateSubclusterRequest, TerminateVatRequest,
};
use crate::utils::{
    RpcErr, RpcErrorMetadata, RpcErrorResponse, RpcRequest, RpcRequestId, RpcSuccessResponse,
};

/// Wrapper for JSON-RPC requests that can be either single or batched.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RpcRequestWrapper {
    Single(RpcRequest),
    Multiple(Vec<RpcRequest>),
}

/// Everything the control-plane handlers need: the kernel handle, the
/// bundle root, and the tracing reload handle for `admin_setLogLevel`.
#[derive(Clone)]
pub struct RpcApiContext {
    pub kernel: KernelHandle,
    pub bundle_root: Option<PathBuf>,
    pub log_filter_handler: Option<reload::Handle<EnvFilter, Registry>>,
}

/// Trait for implementing JSON-RPC method handlers: one struct per method,
/// parsed from the request params, executed against the context.
#[allow(async_fn_in_trait)]
pub trait RpcHandler: Sized {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr>;

    async fn call(req: &RpcRequest, context: RpcApiContext) -> Result<Value, RpcErr> {
        let request = Self::parse(&req.params)?;
        request.handle(context).await
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr>;
}

/// Starts the control-plane HTTP server: JSON-RPC on `POST /`, bundles on
/// `GET /<name>.bundle`. Shuts down when the token fires.
pub async fn start_api(
    http_addr: SocketAddr,
    context: RpcApiContext,
    cancel: CancellationToken,
) -> Result<(), RpcErr> {
    let cors = CorsLayer::permissive();
    let router = Router::new()
        .route("/", post(handle_http_request))
        .route("/{*path}", get(bundles::serve_bundle))
        .layer(cors)
        .with_state(context);

    let listener = TcpListener::bind(http_addr)
        .await
        .map_err(|error| RpcErr::Internal(error.to_string()))?;
    info!("Starting control-plane server at {http_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|error| RpcErr::Internal(error.to_string()))
}

async fn handle_http_request(
    State(context): State<RpcApiContext>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    let res = match serde_json::from_str::<RpcRequestWrapper>(&body) {
        Ok(RpcRequestWrapper::Single(request)) => {
            let res = map_http_requests(&request, context).await;
            rpc_response(request.id, res).map_err(|_| StatusCode::BAD_REQUEST)?
        }
        Ok(RpcRequestWrapper::Multiple(requests)) => {
            let mut responses = Vec::new();
            for req in requests {
                let res = map_http_requests(&req, context.clone()).await;
                responses.push(rpc_response(req.id, res).map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            serde_json::to_value(responses).map_err(|_| StatusCode::BAD_REQUEST)?
        }
        Err(_) => rpc_response(
            RpcRequestId::String("".to_string()),
            Err(RpcErr::BadParams("Invalid request body".to_string())),
        )
        .map_err(|_| StatusCode::BAD_REQUEST)?,
    };
    Ok(Json(res))
}

/// Routes a request to its namespace. Kernel methods answer to both bare
/// names and the `kernel_` prefix.
pub async fn map_http_requests(req: &RpcRequest, context: RpcApiContext) -> Result<Value, RpcErr> {
    if req.is_admin() {
        return map_admin_requests(req, context);
    }
    match req.kernel_method() {
        Some(method) => map_kernel_requests(method, req, context).await,
        None => Err(RpcErr::MethodNotFound(req.method.clone())),
    }
}

async fn map_kernel_requests(
    method: &str,
    req: &RpcRequest,
    context: RpcApiContext,
) -> Result<Value, RpcErr> {
    match method {
        "getStatus" => GetStatusRequest::call(req, context).await,
        "launchSubcluster" => LaunchSubclusterRequest::call(req, context).await,
        "terminateSubcluster" => TerminateSubclusterRequest::call(req, context).await,
        "terminateVat" => TerminateVatRequest::call(req, context).await,
        "restartVat" => RestartVatRequest::call(req, context).await,
        "pingVat" => PingVatRequest::call(req, context).await,
        "queueMessage" => QueueMessageRequest::call(req, context).await,
        "collectGarbage" => CollectGarbageRequest::call(req, context).await,
        "clearState" => ClearStateRequest::call(req, context).await,
        "reload" => ReloadRequest::call(req, context).await,
        "launchVat" => LaunchVatRequest::call(req, context).await,
        unknown_method => Err(RpcErr::MethodNotFound(unknown_method.to_owned())),
    }
}

fn map_admin_requests(req: &RpcRequest, context: RpcApiContext) -> Result<Value, RpcErr> {
    match req.method.as_str() {
        "admin_setLogLevel" => set_log_level(req, &context.log_filter_handler),
        unknown_admin_method => Err(RpcErr::MethodNotFound(unknown_admin_method.to_owned())),
    }
}

fn set_log_level(
    req: &RpcRequest,
    handler: &Option<reload::Handle<EnvFilter, Registry>>,
) -> Result<Value, RpcErr> {
    let level = req
        .params
        .as_ref()
        .and_then(|params| params.first())
        .and_then(Value::as_str)
        .ok_or_else(|| RpcErr::MissingParam("level".to_string()))?;
    let handler = handler
        .as_ref()
        .ok_or_else(|| RpcErr::Internal("log filter reloading is not enabled".to_string()))?;
    let filter = EnvFilter::try_new(level).map_err(|e| RpcErr::BadParams(e.to_string()))?;
    handler
        .reload(filter)
        .map_err(|e| RpcErr::Internal(e.to_string()))?;
    info!("Log level changed to {level}");
    Ok(Value::Null)
}

/// Formats a handler result into a JSON-RPC 2.0 response.
pub fn rpc_response<E>(id: RpcRequestId, res: Result<Value, E>) -> Result<Value, RpcErr>
where
    E: Into<RpcErrorMetadata>,
{
    Ok(match res {
        Ok(result) => serde_json::to_value(RpcSuccessResponse {
            id,
            jsonrpc: "2.0".to_string(),
            result,
        }),
        Err(error) => serde_json::to_value(RpcErrorResponse {
            id,
            jsonrpc: "2.0".to_string(),
            error: error.into(),
        }),
    }
    .map_err(|e| RpcErr::Internal(e.to_string()))?)
}
