//! Periodic synchronization of provisioning stack status.
//!
//! After the stack is submitted, a timer-driven loop polls the
//! orchestration service until the stack reaches a terminal state, then
//! writes the outcome to the restore record exactly once. Each tick
//! returns an explicit tri-state checked by the loop; the loop is
//! cancellable and never holds a flow worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::services::{OrchestrationService, ServiceError, StackStatus};

use super::flow::{FlowContext, FlowError, FlowTask};
use super::{RestoreRecord, RestoreStatus};

/// Outcome of one status poll.
#[derive(Debug)]
pub enum SyncPoll {
    /// Stack still in progress; poll again next tick.
    Continue,
    /// Stack reached a terminal state; record `status` and stop.
    Done(RestoreStatus),
    /// The poll itself failed; stop without a stack outcome.
    Failed(ServiceError),
}

/// Control handle for a running synchronization loop.
pub struct SyncHandle {
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Create a handle and the cancellation receiver its loop watches.
    pub fn new() -> (Arc<Self>, watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            Arc::new(Self {
                cancel_tx,
                handle: Mutex::new(None),
            }),
            cancel_rx,
        )
    }

    /// Stop the loop at the next suspension point. The timer is dropped
    /// with the loop; nothing leaks.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    fn attach(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    /// Wait for the loop to finish, if it was started.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "status sync task aborted");
            }
        }
    }
}

/// Flow task that starts the stack status synchronization loop.
///
/// `execute` spawns the loop and returns immediately, so polling never
/// blocks other flow branches.
pub struct SyncStackStatusTask {
    client: Arc<dyn OrchestrationService>,
    record: Arc<RestoreRecord>,
    interval: Duration,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    handle: Arc<SyncHandle>,
}

impl SyncStackStatusTask {
    /// Build the sync task; `cancel` and `handle` come from
    /// [`SyncHandle::new`].
    pub fn new(
        client: Arc<dyn OrchestrationService>,
        record: Arc<RestoreRecord>,
        interval: Duration,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
        handle: Arc<SyncHandle>,
    ) -> Self {
        Self {
            client,
            record,
            interval,
            timeout,
            cancel,
            handle,
        }
    }
}

#[async_trait]
impl FlowTask for SyncStackStatusTask {
    fn name(&self) -> String {
        "sync_stack_status".to_string()
    }

    fn requires(&self) -> Vec<String> {
        vec!["stack_id".to_string()]
    }

    async fn execute(&self, flow: &FlowContext) -> crate::Result<()> {
        let stack_id = flow
            .get("stack_id")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| FlowError::MissingOutput {
                task: self.name(),
                key: "stack_id".to_string(),
            })?;

        self.record.transition(RestoreStatus::Syncing);
        info!(stack_id = %stack_id, "starting stack status sync");
        self.handle.attach(tokio::spawn(sync_loop(
            self.client.clone(),
            stack_id,
            self.record.clone(),
            self.interval,
            self.timeout,
            self.cancel.clone(),
        )));
        Ok(())
    }
}

async fn sync_loop(
    client: Arc<dyn OrchestrationService>,
    stack_id: String,
    record: Arc<RestoreRecord>,
    interval: Duration,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                // A dropped sender means the run was abandoned.
                if changed.is_err() || *cancel.borrow() {
                    info!(stack_id = %stack_id, "stack status sync cancelled");
                    return;
                }
            }
            _ = ticker.tick() => {
                debug!(stack_id = %stack_id, "syncing stack status");
                match poll_once(client.as_ref(), &stack_id, timeout).await {
                    SyncPoll::Continue => {}
                    SyncPoll::Done(status) => {
                        record.transition(status);
                        info!(stack_id = %stack_id, status = %status, "stack reached terminal state");
                        return;
                    }
                    SyncPoll::Failed(e) => {
                        warn!(stack_id = %stack_id, error = %e, "stack status sync stopped");
                        record.fail_sync(e.to_string());
                        return;
                    }
                }
            }
        }
    }
}

async fn poll_once(
    client: &dyn OrchestrationService,
    stack_id: &str,
    timeout: Duration,
) -> SyncPoll {
    let status = match tokio::time::timeout(timeout, client.get_stack(stack_id)).await {
        Err(_) => {
            return SyncPoll::Failed(ServiceError::Timeout {
                service: "orchestration",
                timeout,
            })
        }
        Ok(Err(e)) => return SyncPoll::Failed(e),
        Ok(Ok(status)) => status,
    };
    match status {
        StackStatus::CreateInProgress => SyncPoll::Continue,
        StackStatus::CreateComplete => SyncPoll::Done(RestoreStatus::Succeeded),
        StackStatus::CreateFailed => SyncPoll::Done(RestoreStatus::Failed),
        StackStatus::Other(s) => {
            // Not a state this engine acts on; keep watching.
            debug!(stack_id, status = %s, "ignoring unhandled stack status");
            SyncPoll::Continue
        }
    }
}
