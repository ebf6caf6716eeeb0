//! Restore flow engine.
//!
//! A restore run moves through `building → provisioning → syncing` and
//! terminates in `succeeded`, `failed`, or `sync_failed`. The engine
//! composes per-resource restore tasks, a stack provisioning task, and a
//! status synchronization task into one ordered flow, parameterizing the
//! provisioning client with the restore target's credentials when one is
//! supplied and with a delegated trust otherwise.

pub mod flow;
pub mod sync;

pub use flow::{CreateStackTask, FlowContext, FlowEngine, FlowError, FlowTask, ResourceRestoreTask};
pub use sync::{SyncHandle, SyncPoll, SyncStackStatusTask};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::identity::{RequestContext, TrustBroker, TrustId};
use crate::protection::{Options, PluginRegistry, ProtectionError, RestoredResources};
use crate::resource::{ResourceTree, ResourceType};
use crate::services::{OrchestrationClientFactory, StackTemplate};

use flow::restored_key;

/// State of a restore run. Terminal states are write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Composing the task graph.
    Building,
    /// Submitting the provisioning stack.
    Provisioning,
    /// Polling the stack until it reaches a terminal state.
    Syncing,
    /// The stack was created successfully.
    Succeeded,
    /// Provisioning failed or the stack creation failed.
    Failed,
    /// Status polling itself failed; the stack outcome is unknown.
    SyncFailed,
}

impl RestoreStatus {
    /// Whether the status is final for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RestoreStatus::Succeeded | RestoreStatus::Failed | RestoreStatus::SyncFailed
        )
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreStatus::Building => "building",
            RestoreStatus::Provisioning => "provisioning",
            RestoreStatus::Syncing => "syncing",
            RestoreStatus::Succeeded => "succeeded",
            RestoreStatus::Failed => "failed",
            RestoreStatus::SyncFailed => "sync_failed",
        };
        f.write_str(s)
    }
}

/// Credentials used against a restore target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestoreAuth {
    /// Username/password authentication.
    Password {
        /// Login user.
        username: String,
        /// Login password.
        password: String,
    },
}

/// An alternative deployment to restore into. When absent, the engine
/// restores with the caller's own (delegated) credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTarget {
    /// Auth endpoint of the target deployment.
    pub endpoint: String,
    /// Credentials for the target.
    pub auth: Option<RestoreAuth>,
}

#[derive(Debug)]
struct RecordState {
    status: RestoreStatus,
    stack_id: Option<String>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// Mutable record of one restore run. Owned by the restore flow engine for
/// the run's duration; terminal status writes are applied exactly once.
#[derive(Debug)]
pub struct RestoreRecord {
    id: String,
    restore_target: Option<RestoreTarget>,
    started_at: DateTime<Utc>,
    state: RwLock<RecordState>,
}

impl RestoreRecord {
    /// Fresh record in the `building` state.
    pub fn new(restore_target: Option<RestoreTarget>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            restore_target,
            started_at: Utc::now(),
            state: RwLock::new(RecordState {
                status: RestoreStatus::Building,
                stack_id: None,
                error: None,
                finished_at: None,
            }),
        }
    }

    /// The restore run id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The target deployment, if restoring somewhere other than the source.
    pub fn restore_target(&self) -> Option<&RestoreTarget> {
        self.restore_target.as_ref()
    }

    /// When the run started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current run status.
    pub fn status(&self) -> RestoreStatus {
        self.state.read().status
    }

    /// Stack id once provisioning has been submitted.
    pub fn stack_id(&self) -> Option<String> {
        self.state.read().stack_id.clone()
    }

    /// Failure detail once the run has failed.
    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    /// When the run reached a terminal status.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().finished_at
    }

    pub(crate) fn set_stack_id(&self, stack_id: String) {
        self.state.write().stack_id = Some(stack_id);
    }

    /// Move the record to `next`. Transitions out of a terminal status are
    /// ignored, which makes terminal writes exactly-once.
    pub(crate) fn transition(&self, next: RestoreStatus) -> bool {
        let mut state = self.state.write();
        if state.status.is_terminal() {
            warn!(
                restore_id = %self.id,
                current = %state.status,
                attempted = %next,
                "ignoring status transition on terminal restore record"
            );
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        true
    }

    pub(crate) fn fail(&self, error: impl Into<String>) {
        self.state.write().error.get_or_insert(error.into());
        self.transition(RestoreStatus::Failed);
    }

    pub(crate) fn fail_sync(&self, error: impl Into<String>) {
        self.state.write().error.get_or_insert(error.into());
        self.transition(RestoreStatus::SyncFailed);
    }
}

/// A restore run handed back to the caller: the record, the restored
/// identities, and control over the status sync loop.
pub struct RestoreRun {
    record: Arc<RestoreRecord>,
    restored: Arc<RestoredResources>,
    sync: Arc<SyncHandle>,
    broker: Arc<dyn TrustBroker>,
    trust: Option<TrustId>,
}

impl RestoreRun {
    /// The run's restore record.
    pub fn record(&self) -> Arc<RestoreRecord> {
        self.record.clone()
    }

    /// Restored identities keyed by original resource id.
    pub fn restored(&self) -> &RestoredResources {
        &self.restored
    }

    /// Cancel the status synchronization loop.
    pub fn cancel(&self) {
        self.sync.cancel();
    }

    /// Wait for the run to finish, release the delegated trust, and return
    /// the final status.
    pub async fn wait(mut self) -> RestoreStatus {
        self.sync.join().await;
        if let Some(trust) = self.trust.take() {
            if let Err(e) = self.broker.delete_trust(&trust).await {
                warn!(trust = %trust, error = %e, "trust cleanup failed");
            }
        }
        self.record.status()
    }
}

/// Builds and executes restore flows.
pub struct RestoreFlowEngine {
    config: EngineConfig,
    registry: PluginRegistry,
    broker: Arc<dyn TrustBroker>,
    orchestration: Arc<dyn OrchestrationClientFactory>,
}

impl RestoreFlowEngine {
    /// Build the engine over its collaborators.
    pub fn new(
        config: EngineConfig,
        registry: PluginRegistry,
        broker: Arc<dyn TrustBroker>,
        orchestration: Arc<dyn OrchestrationClientFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            broker,
            orchestration,
        }
    }

    /// Execute a restore of `tree` from `checkpoint`.
    ///
    /// Returns once provisioning has been submitted and the status sync
    /// loop is running; use [`RestoreRun::wait`] to block until the run is
    /// terminal. A provisioning submission failure fails the run and is
    /// returned as an error here.
    #[instrument(skip_all, fields(checkpoint_id = %checkpoint.id()))]
    pub async fn run(
        &self,
        ctx: Arc<RequestContext>,
        checkpoint: Arc<Checkpoint>,
        tree: Arc<ResourceTree>,
        target: Option<RestoreTarget>,
        template: StackTemplate,
        options: HashMap<ResourceType, Options>,
    ) -> crate::Result<RestoreRun> {
        let record = Arc::new(RestoreRecord::new(target.clone()));

        // Building: validate before any external effect.
        self.registry.validate_tree(&tree)?;
        for (resource_type, node_options) in &options {
            let plugin = self.registry.plugin_for(*resource_type)?;
            plugin
                .restore_schema(*resource_type)
                .validate(node_options)
                .map_err(ProtectionError::Validation)?;
        }

        // The target's credentials take the place of the caller's ambient
        // ones; with ambient credentials the engine acts under a trust so
        // the run can outlive the caller's token.
        let (endpoint, trust) = match &target {
            Some(t) => (t.endpoint.clone(), None),
            None => {
                let endpoint = self
                    .broker
                    .get_endpoint("heat", "orchestration", &self.config.region, "public")
                    .await?;
                let trust = self.broker.create_trust(&ctx).await?;
                (endpoint, Some(trust))
            }
        };
        let client = match self
            .orchestration
            .client(&ctx, &endpoint, target.as_ref(), trust.as_ref())
            .await
        {
            Ok(client) => client,
            Err(e) => {
                record.fail(e.to_string());
                self.release_trust(&trust).await;
                return Err(e.into());
            }
        };

        let restored = Arc::new(RestoredResources::new());
        let mut tasks: Vec<Arc<dyn FlowTask>> = Vec::with_capacity(tree.len() + 2);
        for node in tree.pre_order() {
            let resource = tree.resource(node);
            let plugin = self.registry.plugin_for(resource.resource_type)?;
            let node_options = options
                .get(&resource.resource_type)
                .cloned()
                .unwrap_or_default();
            tasks.push(Arc::new(ResourceRestoreTask::new(
                plugin,
                ctx.clone(),
                checkpoint.clone(),
                tree.clone(),
                node,
                target.clone(),
                node_options,
                restored.clone(),
            )));
        }
        let root_restored = restored_key(&tree.resource(tree.root()).id);
        tasks.push(Arc::new(CreateStackTask::new(
            client.clone(),
            template,
            record.clone(),
            self.config.service_timeout,
            vec![root_restored],
        )));
        let (sync_handle, cancel_rx) = SyncHandle::new();
        tasks.push(Arc::new(SyncStackStatusTask::new(
            client,
            record.clone(),
            self.config.sync_status_interval,
            self.config.service_timeout,
            cancel_rx,
            sync_handle.clone(),
        )));

        let flow_name = format!("create_restoration_{}", checkpoint.id());
        info!(flow = %flow_name, tasks = tasks.len(), "executing restore flow");
        let engine = FlowEngine::new(self.config.max_concurrency);
        if let Err(e) = engine.run(&flow_name, tasks).await {
            record.fail(e.to_string());
            self.release_trust(&trust).await;
            return Err(e.into());
        }

        Ok(RestoreRun {
            record,
            restored,
            sync: sync_handle,
            broker: self.broker.clone(),
            trust,
        })
    }

    async fn release_trust(&self, trust: &Option<TrustId>) {
        if let Some(trust) = trust {
            if let Err(e) = self.broker.delete_trust(trust).await {
                warn!(trust = %trust, error = %e, "trust cleanup failed");
            }
        }
    }
}
