//! Ordered task graph construction and execution.
//!
//! Tasks declare the outputs they provide and the outputs they require.
//! The executor orders tasks into dependency levels (Kahn) and runs each
//! level with bounded concurrency: a task consuming another task's output
//! can never start before its producer completes, while independent tasks
//! run in parallel. The first task failure aborts the flow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::identity::RequestContext;
use crate::protection::{Options, ProtectionPlugin, RestoredResources};
use crate::resource::{NodeId, ResourceTree};
use crate::services::{OrchestrationService, ServiceError, StackTemplate};
use crate::Error;

use super::{RestoreRecord, RestoreStatus, RestoreTarget};

/// Errors from flow construction or execution.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    /// A task requires an output no task provides.
    #[error("flow is unresolvable: task {task} requires {key}, which nothing provides")]
    Unresolvable {
        /// The requiring task.
        task: String,
        /// The missing output key.
        key: String,
    },

    /// Two tasks claim to provide the same output.
    #[error("duplicate provider for output {0}")]
    DuplicateProvider(String),

    /// Task requirements form a cycle.
    #[error("flow contains a dependency cycle")]
    Cycle,

    /// A producer completed without publishing a declared output.
    #[error("task {task} expected output {key} to be present")]
    MissingOutput {
        /// The consuming task.
        task: String,
        /// The absent output key.
        key: String,
    },

    /// The executor was shut down while tasks were pending.
    #[error("flow executor shut down")]
    Shutdown,

    /// A task failed; the flow was aborted.
    #[error("task {task} failed: {source}")]
    TaskFailed {
        /// Name of the failing task.
        task: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

/// Shared output store threaded through a flow's tasks.
#[derive(Debug, Default)]
pub struct FlowContext {
    outputs: RwLock<HashMap<String, Value>>,
}

impl FlowContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an output.
    pub async fn put(&self, key: impl Into<String>, value: Value) {
        self.outputs.write().await.insert(key.into(), value);
    }

    /// Read a previously published output.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.outputs.read().await.get(key).cloned()
    }
}

/// One unit of work in a restore flow.
#[async_trait]
pub trait FlowTask: Send + Sync {
    /// Task name, for logs and errors.
    fn name(&self) -> String;

    /// Output keys this task consumes.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    /// Output keys this task publishes.
    fn provides(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the task.
    async fn execute(&self, flow: &FlowContext) -> crate::Result<()>;
}

/// Executes task graphs with bounded concurrency.
pub struct FlowEngine {
    max_concurrency: usize,
}

impl FlowEngine {
    /// Engine running at most `max_concurrency` tasks at once.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    fn schedule(tasks: &[Arc<dyn FlowTask>]) -> Result<Vec<Vec<usize>>, FlowError> {
        let mut provider: HashMap<String, usize> = HashMap::new();
        for (index, task) in tasks.iter().enumerate() {
            for output in task.provides() {
                if provider.insert(output.clone(), index).is_some() {
                    return Err(FlowError::DuplicateProvider(output));
                }
            }
        }

        let mut deps: Vec<HashSet<usize>> = vec![HashSet::new(); tasks.len()];
        for (index, task) in tasks.iter().enumerate() {
            for key in task.requires() {
                match provider.get(&key) {
                    Some(&producer) if producer != index => {
                        deps[index].insert(producer);
                    }
                    Some(_) => {}
                    None => {
                        return Err(FlowError::Unresolvable {
                            task: task.name(),
                            key,
                        })
                    }
                }
            }
        }

        let mut levels = Vec::new();
        let mut done: HashSet<usize> = HashSet::new();
        let mut remaining: Vec<usize> = (0..tasks.len()).collect();
        while !remaining.is_empty() {
            let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining
                .into_iter()
                .partition(|&i| deps[i].is_subset(&done));
            if ready.is_empty() {
                return Err(FlowError::Cycle);
            }
            done.extend(ready.iter().copied());
            levels.push(ready);
            remaining = blocked;
        }
        Ok(levels)
    }

    /// Execute `tasks`, returning the flow's outputs on success.
    #[instrument(skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn run(
        &self,
        flow_name: &str,
        tasks: Vec<Arc<dyn FlowTask>>,
    ) -> Result<FlowContext, FlowError> {
        let levels = Self::schedule(&tasks)?;
        let flow = FlowContext::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        for level in levels {
            let mut running = FuturesUnordered::new();
            for index in level {
                let task = tasks[index].clone();
                let semaphore = semaphore.clone();
                let flow = &flow;
                running.push(async move {
                    let name = task.name();
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| (name.clone(), Error::Flow(FlowError::Shutdown)))?;
                    debug!(task = %name, flow = flow_name, "executing flow task");
                    task.execute(flow).await.map_err(|e| (name, e))
                });
            }
            while let Some(result) = running.next().await {
                if let Err((task, e)) = result {
                    error!(task = %task, flow = flow_name, error = %e, "flow task failed, aborting flow");
                    return Err(FlowError::TaskFailed {
                        task,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(flow)
    }
}

/// Output key under which a resource's restored identity is published.
pub fn restored_key(resource_id: &str) -> String {
    format!("restored:{resource_id}")
}

/// Restores one resource via its protection plugin.
///
/// Requires the restored identities of the resource's children, so the
/// executor runs dependents first regardless of emission order.
pub struct ResourceRestoreTask {
    plugin: Arc<dyn ProtectionPlugin>,
    ctx: Arc<RequestContext>,
    checkpoint: Arc<Checkpoint>,
    tree: Arc<ResourceTree>,
    node: NodeId,
    target: Option<RestoreTarget>,
    options: Options,
    restored: Arc<RestoredResources>,
}

impl ResourceRestoreTask {
    /// Build a restore task for the resource at `node`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin: Arc<dyn ProtectionPlugin>,
        ctx: Arc<RequestContext>,
        checkpoint: Arc<Checkpoint>,
        tree: Arc<ResourceTree>,
        node: NodeId,
        target: Option<RestoreTarget>,
        options: Options,
        restored: Arc<RestoredResources>,
    ) -> Self {
        Self {
            plugin,
            ctx,
            checkpoint,
            tree,
            node,
            target,
            options,
            restored,
        }
    }
}

#[async_trait]
impl FlowTask for ResourceRestoreTask {
    fn name(&self) -> String {
        format!("restore_{}", self.tree.resource(self.node).id)
    }

    fn requires(&self) -> Vec<String> {
        self.tree
            .children(self.node)
            .iter()
            .map(|&child| restored_key(&self.tree.resource(child).id))
            .collect()
    }

    fn provides(&self) -> Vec<String> {
        vec![restored_key(&self.tree.resource(self.node).id)]
    }

    async fn execute(&self, flow: &FlowContext) -> crate::Result<()> {
        let resource_id = self.tree.resource(self.node).id.clone();
        let result = self
            .plugin
            .restore(
                &self.ctx,
                &self.checkpoint,
                self.target.as_ref(),
                &self.tree,
                self.node,
                &self.options,
                &self.restored,
            )
            .await?;
        flow.put(restored_key(&resource_id), json!(result.new_id))
            .await;
        Ok(())
    }
}

/// Submits the provisioning stack and publishes `stack_id`.
pub struct CreateStackTask {
    client: Arc<dyn OrchestrationService>,
    template: StackTemplate,
    record: Arc<RestoreRecord>,
    timeout: Duration,
    requires: Vec<String>,
}

impl CreateStackTask {
    /// Build the provisioning task. `requires` sequences it after the
    /// resource restore tasks it depends on.
    pub fn new(
        client: Arc<dyn OrchestrationService>,
        template: StackTemplate,
        record: Arc<RestoreRecord>,
        timeout: Duration,
        requires: Vec<String>,
    ) -> Self {
        Self {
            client,
            template,
            record,
            timeout,
            requires,
        }
    }
}

#[async_trait]
impl FlowTask for CreateStackTask {
    fn name(&self) -> String {
        "create_stack".to_string()
    }

    fn requires(&self) -> Vec<String> {
        self.requires.clone()
    }

    fn provides(&self) -> Vec<String> {
        vec!["stack_id".to_string()]
    }

    async fn execute(&self, flow: &FlowContext) -> crate::Result<()> {
        self.record.transition(RestoreStatus::Provisioning);
        let stack_name = format!("restore_{}", Uuid::new_v4());
        info!(stack_name = %stack_name, "creating stack");

        let submitted =
            tokio::time::timeout(self.timeout, self.client.create_stack(&stack_name, &self.template))
                .await
                .unwrap_or(Err(ServiceError::Timeout {
                    service: "orchestration",
                    timeout: self.timeout,
                }));
        let stack_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                // Submission failure fails the whole run.
                error!(stack_name = %stack_name, error = %e, "stack creation failed");
                self.record.fail(e.to_string());
                return Err(e.into());
            }
        };

        self.record.set_stack_id(stack_id.clone());
        flow.put("stack_id", json!(stack_id)).await;
        Ok(())
    }
}
