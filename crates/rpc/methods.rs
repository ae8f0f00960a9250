//! One handler struct per control-plane method.

use ocapd_common::refs::{EndpointId, KRef};
use ocapd_common::subcluster::{SubclusterConfig, VatSpec};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::rpc::{RpcApiContext, RpcHandler};
use crate::utils::RpcErr;

fn first_param(params: &Option<Vec<Value>>) -> Result<&Value, RpcErr> {
    params
        .as_ref()
        .and_then(|params| params.first())
        .ok_or_else(|| RpcErr::MissingParam("params[0]".to_string()))
}

pub struct GetStatusRequest;

impl RpcHandler for GetStatusRequest {
    fn parse(_params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(GetStatusRequest)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        let status = context.kernel.get_status().await?;
        Ok(serde_json::to_value(status)?)
    }
}

#[derive(Deserialize)]
pub struct LaunchSubclusterRequest {
    config: SubclusterConfig,
}

impl RpcHandler for LaunchSubclusterRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        let launched = context.kernel.launch_subcluster(self.config.clone()).await?;
        Ok(serde_json::to_value(launched)?)
    }
}

#[derive(Deserialize)]
pub struct TerminateSubclusterRequest {
    id: String,
}

impl RpcHandler for TerminateSubclusterRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context
            .kernel
            .terminate_subcluster(self.id.clone())
            .await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
pub struct TerminateVatRequest {
    id: EndpointId,
}

impl RpcHandler for TerminateVatRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context.kernel.terminate_vat(self.id).await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
pub struct RestartVatRequest {
    id: EndpointId,
}

impl RpcHandler for RestartVatRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context.kernel.restart_vat(self.id).await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
pub struct PingVatRequest {
    id: EndpointId,
}

impl RpcHandler for PingVatRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        let ping = context.kernel.ping_vat(self.id).await?;
        Ok(serde_json::to_value(ping)?)
    }
}

/// `queueMessage(target, method, args)` with positional params.
pub struct QueueMessageRequest {
    target: KRef,
    method: String,
    args: Vec<Value>,
}

impl RpcHandler for QueueMessageRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        let params = params
            .as_ref()
            .ok_or_else(|| RpcErr::MissingParam("target".to_string()))?;
        let target: KRef = serde_json::from_value(
            params
                .first()
                .ok_or_else(|| RpcErr::MissingParam("target".to_string()))?
                .clone(),
        )?;
        let method: String = serde_json::from_value(
            params
                .get(1)
                .ok_or_else(|| RpcErr::MissingParam("method".to_string()))?
                .clone(),
        )?;
        let args: Vec<Value> = match params.get(2) {
            None | Some(Value::Null) => Vec::new(),
            Some(args) => serde_json::from_value(args.clone())?,
        };
        Ok(QueueMessageRequest {
            target,
            method,
            args,
        })
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        let result = context
            .kernel
            .queue_message(self.target, self.method.clone(), self.args.clone())
            .await?;
        Ok(json!(result))
    }
}

pub struct CollectGarbageRequest;

impl RpcHandler for CollectGarbageRequest {
    fn parse(_params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(CollectGarbageRequest)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context.kernel.collect_garbage().await?;
        Ok(Value::Null)
    }
}

pub struct ClearStateRequest;

impl RpcHandler for ClearStateRequest {
    fn parse(_params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(ClearStateRequest)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context.kernel.clear_state().await?;
        Ok(Value::Null)
    }
}

pub struct ReloadRequest;

impl RpcHandler for ReloadRequest {
    fn parse(_params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(ReloadRequest)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        context.kernel.reload().await?;
        Ok(Value::Null)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchVatRequest {
    config: VatSpec,
    #[serde(default)]
    subcluster_id: Option<String>,
}

impl RpcHandler for LaunchVatRequest {
    fn parse(params: &Option<Vec<Value>>) -> Result<Self, RpcErr> {
        Ok(serde_json::from_value(first_param(params)?.clone())?)
    }

    async fn handle(&self, context: RpcApiContext) -> Result<Value, RpcErr> {
        let launched = context
            .kernel
            .launch_vat(self.config.clone(), self.subcluster_id.clone())
            .await?;
        Ok(serde_json::to_value(launched)?)
    }
}
