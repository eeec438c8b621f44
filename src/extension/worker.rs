//! Worker thread owning a script isolate
//!
//! Deno isolates are single-threaded, while sources are shared across tasks.
//! Each evaluated script gets a dedicated thread running a current-thread
//! tokio runtime; calls reach it over a channel and answer on a oneshot.
//! Dropping the last [`ScriptWorker`] handle ends the thread.

use crate::core::error::{Result, TsukiyoError};
use crate::core::http::HttpTransport;
use crate::core::rate_limit::RateLimitGuard;
use crate::extension::contract::CapabilityReport;
use crate::extension::js_runtime::{HostBindings, ScriptRuntime};
use crate::extension::sandbox::ScriptSandbox;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Command sent to the worker thread
enum WorkerCommand {
    Invoke {
        member: String,
        args: Vec<Value>,
        resp: oneshot::Sender<Result<Value>>,
    },
}

/// Handle to a script running on its own thread
#[derive(Debug, Clone)]
pub struct ScriptWorker {
    label: String,
    tx: mpsc::Sender<WorkerCommand>,
}

impl ScriptWorker {
    /// Start a worker, evaluate `code` on it and return the capability report
    pub async fn spawn(
        label: impl Into<String>,
        code: String,
        bindings: HostBindings,
        sandbox: &ScriptSandbox,
    ) -> Result<(Self, CapabilityReport)> {
        let label = label.into();
        let limits = sandbox.limits;
        let (tx, mut rx) = mpsc::channel::<WorkerCommand>(16);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<CapabilityReport>>();

        let thread_label = label.clone();
        thread::Builder::new()
            .name(format!("ext-{}", label))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TsukiyoError::TaskError(format!(
                            "Failed to create runtime for {}: {}",
                            thread_label, e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut runtime = match ScriptRuntime::new(thread_label.clone(), bindings, limits) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let report = runtime.load(&code);
                    drop(code);
                    let loaded = report.is_ok();
                    let _ = ready_tx.send(report);
                    if !loaded {
                        return;
                    }

                    debug!(label = %thread_label, "Script worker ready");

                    while let Some(command) = rx.recv().await {
                        match command {
                            WorkerCommand::Invoke { member, args, resp } => {
                                let result = runtime.invoke(&member, args).await;
                                let _ = resp.send(result);
                            }
                        }
                    }

                    runtime.garbage_collect();
                    debug!(label = %thread_label, "Script worker exiting");
                });
            })
            .map_err(|e| TsukiyoError::TaskError(format!("Failed to spawn script thread: {}", e)))?;

        let report = ready_rx.await.map_err(|_| {
            error!(label = %label, "Script worker stopped before evaluation finished");
            TsukiyoError::ExtensionEvaluationFailed(format!("worker for {} stopped unexpectedly", label))
        })??;

        Ok((Self { label, tx }, report))
    }

    /// Call a contract member on the worker
    pub async fn invoke(&self, member: &str, args: Vec<Value>) -> Result<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();

        self.tx
            .send(WorkerCommand::Invoke {
                member: member.to_string(),
                args,
                resp: resp_tx,
            })
            .await
            .map_err(|_| TsukiyoError::ExtensionCallFailed(format!("worker for {} is gone", self.label)))?;

        resp_rx
            .await
            .map_err(|_| TsukiyoError::ExtensionCallFailed(format!("worker for {} dropped the call", self.label)))?
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Evaluates scripts in fresh sandboxed isolates
#[derive(Clone)]
pub struct ScriptHost {
    transport: Arc<dyn HttpTransport>,
    sandbox: ScriptSandbox,
    fetch_timeout: Duration,
}

impl ScriptHost {
    pub fn new(transport: Arc<dyn HttpTransport>, sandbox: ScriptSandbox, fetch_timeout: Duration) -> Self {
        Self {
            transport,
            sandbox,
            fetch_timeout,
        }
    }

    /// Evaluate `code` for `source_id`; the script's requests use `guard`
    pub async fn evaluate(
        &self,
        source_id: &str,
        code: String,
        guard: Arc<RateLimitGuard>,
    ) -> Result<(ScriptWorker, CapabilityReport)> {
        let bindings = HostBindings {
            source_id: source_id.to_string(),
            transport: self.transport.clone(),
            guard,
            sandbox: self.sandbox.clone(),
            fetch_timeout: self.fetch_timeout,
        };
        ScriptWorker::spawn(source_id, code, bindings, &self.sandbox).await
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    pub fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }
}
