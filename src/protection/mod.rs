//! Protection plugins and the orchestrator that drives them.
//!
//! A [`ProtectionPlugin`] turns a resource-type-specific backup/restore
//! algorithm into a uniform operation. Plugins are confined to the bank
//! section of the resource they are invoked on and must follow the status
//! protocol: `protecting` is written before any external side effect, and
//! the final status is `available` or `error`.

mod orchestrator;
pub mod server;
pub mod volume;

pub use orchestrator::{ProtectResult, ProtectionOrchestrator, ResourceOutcome};
pub use server::ServerProtectionPlugin;
pub use volume::VolumeProtectionPlugin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bank::BankError;
use crate::checkpoint::Checkpoint;
use crate::identity::RequestContext;
use crate::resource::{NodeId, ResourceTree, ResourceType};
use crate::restore::RestoreTarget;
use crate::schema::{Schema, SchemaError};
use crate::services::ServiceError;

/// Bank key holding a resource's protection status.
pub const STATUS_KEY: &str = "status";
/// Bank key holding a resource's saved metadata record.
pub const METADATA_KEY: &str = "metadata";

/// Per-resource protection lifecycle status. The `status` bank key is the
/// single source of truth for a resource's protection outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionStatus {
    /// Backup in progress.
    Protecting,
    /// Backup completed and usable for restore.
    Available,
    /// Backup or deletion failed.
    Error,
    /// Deletion in progress.
    Deleting,
    /// Backup fully deleted.
    Deleted,
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtectionStatus::Protecting => "protecting",
            ProtectionStatus::Available => "available",
            ProtectionStatus::Error => "error",
            ProtectionStatus::Deleting => "deleting",
            ProtectionStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Free-form options passed to plugin operations.
pub type Options = serde_json::Map<String, Value>;

/// Errors from plugin operations and orchestration.
#[derive(Error, Debug)]
pub enum ProtectionError {
    /// No plugin is registered for a resource type present in the tree.
    #[error("no protection plugin registered for resource type {0}")]
    PluginNotFound(ResourceType),

    /// Bank access failed.
    #[error(transparent)]
    Bank(#[from] BankError),

    /// An external resource-service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Supplied options do not match the plugin's schema.
    #[error("invalid options: {0}")]
    Validation(#[from] SchemaError),

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted metadata record cannot be interpreted.
    #[error("metadata record malformed for resource {id}: {reason}")]
    BadMetadata {
        /// The resource whose record is malformed.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A restore step needs the restored identity of a resource that has
    /// not been restored.
    #[error("restore of {id} depends on {dependency}, which has not been restored")]
    MissingDependency {
        /// The resource being restored.
        id: String,
        /// The original id of the missing dependency.
        dependency: String,
    },
}

/// Identifying information a plugin returns after restoring a resource, so
/// dependents can reference the recreated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoredResource {
    /// Id the resource had when it was protected.
    pub original_id: String,
    /// Id of the recreated resource.
    pub new_id: String,
    /// Plugin-specific extras (device paths, endpoint data).
    #[serde(default)]
    pub details: Options,
}

/// Restored identities shared between the restore tasks of one run, keyed
/// by original resource id.
pub type RestoredResources = DashMap<String, RestoredResource>;

/// A resource-type-specific protection handler.
///
/// Contract for `create_backup`: write `status = protecting` to the
/// resource's section before any external call; attempt the external side
/// effect at most once; write `metadata` only after the side effect is
/// accepted; leave `status` as `available` on success or `error` on
/// failure. `delete_backup` must be a safe no-op when the backup never
/// completed. Retries are the caller's responsibility.
#[async_trait]
pub trait ProtectionPlugin: Send + Sync {
    /// Resource types this plugin handles.
    fn supported_resource_types(&self) -> &[ResourceType];

    /// Schema of backup-time options.
    fn options_schema(&self, resource_type: ResourceType) -> Schema;

    /// Schema of restore-time options.
    fn restore_schema(&self, resource_type: ResourceType) -> Schema;

    /// Schema of the metadata record this plugin persists.
    fn saved_info_schema(&self, resource_type: ResourceType) -> Schema;

    /// Back up the resource at `node` into its checkpoint section.
    async fn create_backup(
        &self,
        ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
        backup_name: &str,
        options: &Options,
    ) -> Result<(), ProtectionError>;

    /// Release external artifacts and remove every bank key under the
    /// resource's section.
    async fn delete_backup(
        &self,
        ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
    ) -> Result<(), ProtectionError>;

    /// Recreate the resource from its saved metadata. Restored identities
    /// of already-processed resources are available in `restored`; the
    /// plugin inserts its own result there as well as returning it.
    #[allow(clippy::too_many_arguments)]
    async fn restore(
        &self,
        ctx: &RequestContext,
        checkpoint: &Checkpoint,
        restore_target: Option<&RestoreTarget>,
        tree: &ResourceTree,
        node: NodeId,
        options: &Options,
        restored: &RestoredResources,
    ) -> Result<RestoredResource, ProtectionError>;
}

/// Type-keyed plugin registry, populated at startup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<ResourceType, Arc<dyn ProtectionPlugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` for every resource type it supports.
    pub fn register(&mut self, plugin: Arc<dyn ProtectionPlugin>) {
        for resource_type in plugin.supported_resource_types() {
            self.plugins.insert(*resource_type, plugin.clone());
        }
    }

    /// The plugin handling `resource_type`.
    pub fn plugin_for(
        &self,
        resource_type: ResourceType,
    ) -> Result<Arc<dyn ProtectionPlugin>, ProtectionError> {
        self.plugins
            .get(&resource_type)
            .cloned()
            .ok_or(ProtectionError::PluginNotFound(resource_type))
    }

    /// Verify a plugin exists for every resource type in `tree`.
    pub fn validate_tree(&self, tree: &ResourceTree) -> Result<(), ProtectionError> {
        for node in tree.post_order() {
            self.plugin_for(tree.resource(node).resource_type)?;
        }
        Ok(())
    }
}
