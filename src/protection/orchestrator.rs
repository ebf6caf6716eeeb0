//! Post-order traversal of the resource tree, driving plugin operations.
//!
//! Children are fully processed before their parent's record is finalized,
//! so a restore can replay in dependency order. Failures are aggregated per
//! resource: one resource erroring never aborts its siblings, but the
//! checkpoint as a whole is failed if any resource is.

use serde_json::json;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::identity::RequestContext;
use crate::resource::{Resource, ResourceTree, ResourceType};

use super::{
    Options, PluginRegistry, ProtectionError, ProtectionStatus, STATUS_KEY,
};

/// Outcome of one resource within a protect or delete run.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    /// The resource the outcome belongs to.
    pub resource: Resource,
    /// Final status of the resource's record.
    pub status: ProtectionStatus,
    /// Failure detail, when the status is an error.
    pub error: Option<String>,
}

/// Aggregated result of a protect or delete run.
#[derive(Debug, Clone)]
pub struct ProtectResult {
    /// Checkpoint the run was scoped to.
    pub checkpoint_id: String,
    /// Aggregate status: failed iff any resource failed.
    pub status: ProtectionStatus,
    /// Per-resource outcomes in processing (post-) order.
    pub outcomes: Vec<ResourceOutcome>,
}

impl ProtectResult {
    fn from_outcomes(
        checkpoint_id: String,
        outcomes: Vec<ResourceOutcome>,
        success: ProtectionStatus,
    ) -> Self {
        let failed = outcomes
            .iter()
            .any(|o| o.status == ProtectionStatus::Error);
        Self {
            checkpoint_id,
            status: if failed { ProtectionStatus::Error } else { success },
            outcomes,
        }
    }
}

/// Walks a resource tree and drives the registered plugins.
pub struct ProtectionOrchestrator {
    registry: PluginRegistry,
    #[allow(dead_code)]
    config: EngineConfig,
}

impl ProtectionOrchestrator {
    /// Build an orchestrator over `registry`.
    pub fn new(registry: PluginRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    /// The registry this orchestrator dispatches through.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Back up every resource in `tree` under `checkpoint`.
    ///
    /// Fails fast if any resource type in the tree has no registered
    /// plugin; otherwise per-resource failures are recorded and siblings
    /// continue.
    #[instrument(skip_all, fields(checkpoint_id = %checkpoint.id(), backup_name))]
    pub async fn protect(
        &self,
        ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        backup_name: &str,
        options: &HashMap<ResourceType, Options>,
    ) -> Result<ProtectResult, ProtectionError> {
        self.registry.validate_tree(tree)?;

        let empty = Options::new();
        let mut outcomes = Vec::with_capacity(tree.len());
        for node in tree.post_order() {
            let resource = tree.resource(node).clone();
            let plugin = self.registry.plugin_for(resource.resource_type)?;
            let node_options = options.get(&resource.resource_type).unwrap_or(&empty);
            plugin
                .options_schema(resource.resource_type)
                .validate(node_options)?;

            info!(resource_id = %resource.id, resource_type = %resource.resource_type, "protecting resource");
            match plugin
                .create_backup(ctx, checkpoint, tree, node, backup_name, node_options)
                .await
            {
                Ok(()) => outcomes.push(ResourceOutcome {
                    resource,
                    status: ProtectionStatus::Available,
                    error: None,
                }),
                Err(e) => {
                    warn!(resource_id = %resource.id, error = %e, "resource protection failed");
                    self.mark_error(checkpoint, &resource.id).await;
                    outcomes.push(ResourceOutcome {
                        resource,
                        status: ProtectionStatus::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(ProtectResult::from_outcomes(
            checkpoint.id().to_string(),
            outcomes,
            ProtectionStatus::Available,
        ))
    }

    /// Delete every resource's backup under `checkpoint`, post-order, with
    /// the same partial-failure semantics as [`protect`](Self::protect).
    #[instrument(skip_all, fields(checkpoint_id = %checkpoint.id()))]
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
    ) -> Result<ProtectResult, ProtectionError> {
        self.registry.validate_tree(tree)?;

        let mut outcomes = Vec::with_capacity(tree.len());
        for node in tree.post_order() {
            let resource = tree.resource(node).clone();
            let plugin = self.registry.plugin_for(resource.resource_type)?;
            let section = checkpoint.resource_section(&resource.id);
            // Visible progress marker; overwritten or removed by the plugin.
            if let Err(e) = section
                .create(STATUS_KEY, json!(ProtectionStatus::Deleting))
                .await
            {
                warn!(resource_id = %resource.id, error = %e, "could not mark resource deleting");
            }

            info!(resource_id = %resource.id, "deleting resource backup");
            match plugin.delete_backup(ctx, checkpoint, tree, node).await {
                Ok(()) => outcomes.push(ResourceOutcome {
                    resource,
                    status: ProtectionStatus::Deleted,
                    error: None,
                }),
                Err(e) => {
                    warn!(resource_id = %resource.id, error = %e, "backup deletion failed");
                    self.mark_error(checkpoint, &resource.id).await;
                    outcomes.push(ResourceOutcome {
                        resource,
                        status: ProtectionStatus::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(ProtectResult::from_outcomes(
            checkpoint.id().to_string(),
            outcomes,
            ProtectionStatus::Deleted,
        ))
    }

    /// Best-effort error marker; the plugin may already have written one.
    async fn mark_error(&self, checkpoint: &Checkpoint, resource_id: &str) {
        let section = checkpoint.resource_section(resource_id);
        if let Err(e) = section.create(STATUS_KEY, json!(ProtectionStatus::Error)).await {
            warn!(resource_id, error = %e, "could not record error status");
        }
    }
}
