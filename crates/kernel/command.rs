//! The kernel command surface: a cloneable handle that the RPC layer (or
//! anything else) uses to talk to the single-threaded router between
//! cycles.

use ocapd_common::refs::{EndpointId, KRef};
use ocapd_common::state::{SubclusterRecord, VatState};
use ocapd_common::subcluster::{SubclusterConfig, VatSpec};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::KernelError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatStatus {
    pub id: EndpointId,
    pub subcluster_id: Option<String>,
    pub config: VatSpec,
    pub state: VatState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStatus {
    pub subclusters: Vec<SubclusterRecord>,
    pub vats: Vec<VatStatus>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedSubcluster {
    pub subcluster_id: String,
    pub root_kref: KRef,
    pub result_kpid: KRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedVat {
    pub vat_id: EndpointId,
    pub root_kref: KRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatPing {
    pub id: EndpointId,
    pub state: VatState,
    pub worker_alive: bool,
}

#[derive(Debug)]
pub enum KernelCommand {
    GetStatus {
        reply: oneshot::Sender<KernelStatus>,
    },
    LaunchSubcluster {
        config: SubclusterConfig,
        reply: oneshot::Sender<Result<LaunchedSubcluster, KernelError>>,
    },
    TerminateSubcluster {
        id: String,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    LaunchVat {
        spec: VatSpec,
        subcluster_id: Option<String>,
        reply: oneshot::Sender<Result<LaunchedVat, KernelError>>,
    },
    TerminateVat {
        id: EndpointId,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    RestartVat {
        id: EndpointId,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    PingVat {
        id: EndpointId,
        reply: oneshot::Sender<Result<VatPing, KernelError>>,
    },
    QueueMessage {
        target: KRef,
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<KRef, KernelError>>,
    },
    CollectGarbage {
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    ClearState {
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
}

/// Cloneable front door to a running kernel.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    tx: mpsc::Sender<KernelCommand>,
}

impl KernelHandle {
    pub(crate) fn new(tx: mpsc::Sender<KernelCommand>) -> Self {
        KernelHandle { tx }
    }

    async fn request<T>(
        &self,
        command: KernelCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, KernelError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| KernelError::ChannelClosed)?;
        rx.await.map_err(|_| KernelError::ChannelClosed)
    }

    pub async fn get_status(&self) -> Result<KernelStatus, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::GetStatus { reply }, rx).await
    }

    pub async fn launch_subcluster(
        &self,
        config: SubclusterConfig,
    ) -> Result<LaunchedSubcluster, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::LaunchSubcluster { config, reply }, rx)
            .await?
    }

    pub async fn terminate_subcluster(&self, id: String) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::TerminateSubcluster { id, reply }, rx)
            .await?
    }

    pub async fn launch_vat(
        &self,
        spec: VatSpec,
        subcluster_id: Option<String>,
    ) -> Result<LaunchedVat, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            KernelCommand::LaunchVat {
                spec,
                subcluster_id,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn terminate_vat(&self, id: EndpointId) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::TerminateVat { id, reply }, rx)
            .await?
    }

    pub async fn restart_vat(&self, id: EndpointId) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::RestartVat { id, reply }, rx)
            .await?
    }

    pub async fn ping_vat(&self, id: EndpointId) -> Result<VatPing, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::PingVat { id, reply }, rx).await?
    }

    pub async fn queue_message(
        &self,
        target: KRef,
        method: String,
        args: Vec<Value>,
    ) -> Result<KRef, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            KernelCommand::QueueMessage {
                target,
                method,
                args,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn collect_garbage(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::CollectGarbage { reply }, rx)
            .await?
    }

    pub async fn clear_state(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::ClearState { reply }, rx).await?
    }

    pub async fn reload(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.request(KernelCommand::Reload { reply }, rx).await?
    }
}
