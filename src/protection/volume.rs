//! Protection plugin for block-storage volumes.
//!
//! Backup delegates to the volume service's own backup capability and
//! records the backup id; the payload stays on the service side. Restore
//! creates a new volume from that backup and publishes the new volume id
//! for dependent restores (volume reattachment) to reference.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bank::{BankError, BankSection};
use crate::checkpoint::Checkpoint;
use crate::identity::RequestContext;
use crate::resource::{NodeId, ResourceTree, ResourceType};
use crate::restore::RestoreTarget;
use crate::schema::{FieldType, Schema};
use crate::services::VolumeService;

use super::{
    Options, ProtectionError, ProtectionPlugin, ProtectionStatus, RestoredResource,
    RestoredResources, METADATA_KEY, STATUS_KEY,
};

const SUPPORTED: &[ResourceType] = &[ResourceType::Volume];

/// The metadata record a volume backup persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSavedInfo {
    /// Id of the protected volume.
    pub resource_id: String,
    /// Volume name at backup time.
    pub name: String,
    /// Volume size in gigabytes.
    pub size_gb: u64,
    /// Volume type, if set.
    pub volume_type: Option<String>,
    /// Id of the service-side backup artifact.
    pub backup_id: String,
}

/// Protection plugin for block-storage volumes.
pub struct VolumeProtectionPlugin {
    volume: Arc<dyn VolumeService>,
}

impl VolumeProtectionPlugin {
    /// Build the plugin over its volume-service client.
    pub fn new(volume: Arc<dyn VolumeService>) -> Self {
        Self { volume }
    }

    async fn do_backup(
        &self,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
        backup_name: &str,
        section: &BankSection,
    ) -> Result<(), ProtectionError> {
        let resource = tree.resource(node);
        let volume = self.volume.get_volume(&resource.id).await?;
        let backup_id = self
            .volume
            .create_backup(&resource.id, &format!("{backup_name}@{}", resource.id))
            .await?;

        let saved = VolumeSavedInfo {
            resource_id: resource.id.clone(),
            name: volume.name,
            size_gb: volume.size_gb,
            volume_type: volume.volume_type,
            backup_id: backup_id.clone(),
        };
        section
            .create(METADATA_KEY, serde_json::to_value(&saved)?)
            .await?;
        debug!(volume_id = %resource.id, backup_id = %backup_id, checkpoint_id = %checkpoint.id(), "volume backup accepted");
        Ok(())
    }
}

#[async_trait]
impl ProtectionPlugin for VolumeProtectionPlugin {
    fn supported_resource_types(&self) -> &[ResourceType] {
        SUPPORTED
    }

    fn options_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("volume_backup_options")
            .optional("description", FieldType::String, "description of the backup")
            .optional("force", FieldType::Boolean, "back up even while attached")
    }

    fn restore_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("volume_restore_options")
            .optional("restore_name", FieldType::String, "name for the new volume")
    }

    fn saved_info_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("volume_saved_info")
            .field("resource_id", FieldType::String, "id of the protected volume")
            .field("name", FieldType::String, "volume name at backup time")
            .field("size_gb", FieldType::Integer, "volume size in gigabytes")
            .field("backup_id", FieldType::String, "service-side backup id")
    }

    async fn create_backup(
        &self,
        _ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
        backup_name: &str,
        _options: &Options,
    ) -> Result<(), ProtectionError> {
        let resource = tree.resource(node);
        let section = checkpoint.resource_section(&resource.id);

        section
            .create(STATUS_KEY, json!(ProtectionStatus::Protecting))
            .await?;
        info!(volume_id = %resource.id, backup_name, "creating volume backup");

        match self
            .do_backup(checkpoint, tree, node, backup_name, &section)
            .await
        {
            Ok(()) => {
                section
                    .update(STATUS_KEY, json!(ProtectionStatus::Available))
                    .await?;
                Ok(())
            }
            Err(e) => {
                section
                    .update(STATUS_KEY, json!(ProtectionStatus::Error))
                    .await?;
                Err(e)
            }
        }
    }

    async fn delete_backup(
        &self,
        _ctx: &RequestContext,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
    ) -> Result<(), ProtectionError> {
        let resource = tree.resource(node);
        let section = checkpoint.resource_section(&resource.id);

        match section.get(METADATA_KEY).await {
            Ok(value) => {
                if let Some(backup_id) = value.get("backup_id").and_then(|v| v.as_str()) {
                    if let Err(e) = self.volume.delete_backup(backup_id).await {
                        warn!(backup_id, error = %e, "volume backup release failed");
                    }
                }
            }
            Err(BankError::NotFound(_)) => {
                debug!(volume_id = %resource.id, "no metadata record, nothing to release");
            }
            Err(e) => return Err(e.into()),
        }

        section.delete_all().await?;
        info!(volume_id = %resource.id, "volume backup deleted");
        Ok(())
    }

    async fn restore(
        &self,
        _ctx: &RequestContext,
        checkpoint: &Checkpoint,
        _restore_target: Option<&RestoreTarget>,
        tree: &ResourceTree,
        node: NodeId,
        options: &Options,
        restored: &RestoredResources,
    ) -> Result<RestoredResource, ProtectionError> {
        let resource = tree.resource(node);
        let section = checkpoint.resource_section(&resource.id);
        let value = section.get(METADATA_KEY).await?;
        let saved: VolumeSavedInfo =
            serde_json::from_value(value).map_err(|e| ProtectionError::BadMetadata {
                id: resource.id.clone(),
                reason: e.to_string(),
            })?;

        let restore_name = options
            .get("restore_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("restore_{}", saved.name));
        let new_volume_id = self
            .volume
            .create_volume_from_backup(&saved.backup_id, &restore_name)
            .await?;
        info!(volume_id = %resource.id, new_volume_id = %new_volume_id, "volume recreated");

        let result = RestoredResource {
            original_id: resource.id.clone(),
            new_id: new_volume_id,
            details: Options::new(),
        };
        restored.insert(resource.id.clone(), result.clone());
        Ok(result)
    }
}
