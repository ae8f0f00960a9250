//! Child-process vat workers. The worker program speaks the wire protocol
//! over its stdin/stdout; stderr is inherited so worker logs land next to
//! kernel logs. Bundle resolution is delegated to the worker: the bundle
//! spec is passed as the final argument.

use std::process::Stdio;
use std::time::Duration;

use ocapd_common::message::{DeliveryPayload, DeliveryResult};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::VatWorker;
use crate::error::WorkerError;
use crate::stream::StreamWorker;

#[derive(Debug)]
pub struct ProcessWorker {
    child: Child,
    stream: StreamWorker<ChildStdout, ChildStdin>,
}

impl ProcessWorker {
    pub async fn spawn(
        command: &str,
        args: &[String],
        bundle_spec: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let mut child = Command::new(command)
            .args(args)
            .arg(bundle_spec)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdout was not piped".to_string()))?;

        let stream = StreamWorker::connect(stdout, stdin, handshake_timeout).await?;
        debug!("Spawned process worker for bundle {bundle_spec}");
        Ok(ProcessWorker { child, stream })
    }
}

#[async_trait::async_trait]
impl VatWorker for ProcessWorker {
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        self.stream.deliver(id, payload).await
    }

    async fn terminate(&mut self) {
        self.stream.terminate().await;
        if let Err(err) = self.child.start_kill() {
            warn!("Failed to kill worker process: {err}");
        }
        let _ = self.child.wait().await;
    }
}
