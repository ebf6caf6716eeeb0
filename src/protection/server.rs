//! Protection plugin for compute instances.
//!
//! Backup snapshots the server into an image, streams the image payload
//! into chunked bank records, and saves the attachment/network/flavor
//! attributes needed to rebuild the server. Restore re-uploads the image,
//! boots a new server from it, and reattaches the restored child volumes
//! at their recorded device paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bank::{BankError, BankSection};
use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::identity::RequestContext;
use crate::resource::{NodeId, ResourceTree, ResourceType};
use crate::restore::RestoreTarget;
use crate::schema::{FieldType, Schema};
use crate::services::{
    AddressKind, ComputeService, ImageService, NetworkService, ServerRestoreSpec, VolumeService,
};

use super::{
    Options, ProtectionError, ProtectionPlugin, ProtectionStatus, RestoredResource,
    RestoredResources, METADATA_KEY, STATUS_KEY,
};

const SUPPORTED: &[ResourceType] = &[ResourceType::Server];

/// Server attributes captured at backup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Availability zone the server ran in.
    pub availability_zone: String,
    /// Networks the server's fixed addresses belonged to.
    pub networks: Vec<String>,
    /// Floating addresses mapped onto the server.
    pub floating_ips: Vec<String>,
    /// Flavor id.
    pub flavor: String,
    /// Keypair name, if any.
    pub key_name: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
}

/// Snapshot image attributes captured at backup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Disk format of the snapshot image.
    pub disk_format: String,
    /// Container format of the snapshot image.
    pub container_format: String,
    /// Name the snapshot was created under.
    pub name: String,
}

/// The metadata record a server backup persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSavedInfo {
    /// Id of the protected server.
    pub resource_id: String,
    /// Child volume id to device path, e.g. `{"vol_1": "/dev/vdb"}`.
    pub attach_metadata: BTreeMap<String, String>,
    /// Server attributes.
    pub server_metadata: ServerMetadata,
    /// Snapshot image id held on the image service.
    pub snapshot_id: String,
    /// Snapshot image attributes.
    pub snapshot_metadata: SnapshotMetadata,
}

/// Protection plugin for compute instances.
pub struct ServerProtectionPlugin {
    compute: Arc<dyn ComputeService>,
    volume: Arc<dyn VolumeService>,
    image: Arc<dyn ImageService>,
    network: Arc<dyn NetworkService>,
    chunk_size: usize,
}

impl ServerProtectionPlugin {
    /// Build the plugin over its resource-service clients.
    pub fn new(
        compute: Arc<dyn ComputeService>,
        volume: Arc<dyn VolumeService>,
        image: Arc<dyn ImageService>,
        network: Arc<dyn NetworkService>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            compute,
            volume,
            image,
            network,
            chunk_size: config.artifact_chunk_size,
        }
    }

    async fn gather_and_snapshot(
        &self,
        checkpoint: &Checkpoint,
        tree: &ResourceTree,
        node: NodeId,
        section: &BankSection,
    ) -> Result<ServerSavedInfo, ProtectionError> {
        let resource = tree.resource(node);
        let server = self.compute.get_server(&resource.id).await?;

        let mut networks = Vec::new();
        let mut floating_ips = Vec::new();
        for address in &server.addresses {
            match address.kind {
                AddressKind::Fixed => {
                    for port in self.network.ports_by_mac(&address.mac_address).await? {
                        networks.push(port.network_id);
                    }
                }
                AddressKind::Floating => floating_ips.push(address.ip_address.clone()),
            }
        }

        // A server with no attached volumes yields an empty map.
        let mut attach_metadata = BTreeMap::new();
        for &child in tree.children(node) {
            let child_resource = tree.resource(child);
            if child_resource.resource_type != ResourceType::Volume {
                continue;
            }
            let volume = self.volume.get_volume(&child_resource.id).await?;
            if let Some(attachment) = volume
                .attachments
                .iter()
                .find(|a| a.server_id == resource.id)
            {
                attach_metadata.insert(child_resource.id.clone(), attachment.device.clone());
            }
        }

        let snapshot_name = format!("snapshot_{}@{}", checkpoint.id(), resource.id);
        let snapshot_id = self
            .compute
            .create_server_image(&resource.id, &snapshot_name)
            .await?;
        let snapshot = self.image.get_image(&snapshot_id).await?;

        let saved = ServerSavedInfo {
            resource_id: resource.id.clone(),
            attach_metadata,
            server_metadata: ServerMetadata {
                availability_zone: server.availability_zone,
                networks,
                floating_ips,
                flavor: server.flavor_id,
                key_name: server.key_name,
                security_groups: server.security_groups,
            },
            snapshot_id: snapshot_id.clone(),
            snapshot_metadata: SnapshotMetadata {
                disk_format: snapshot.disk_format,
                container_format: snapshot.container_format,
                name: snapshot_name,
            },
        };
        section
            .create(METADATA_KEY, serde_json::to_value(&saved)?)
            .await?;

        // Snapshot payload, chunked under data_{n}.
        let data = self.image.download(&snapshot_id).await?;
        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            section
                .create(&format!("data_{index}"), json!(BASE64.encode(chunk)))
                .await?;
        }
        Ok(saved)
    }

    async fn read_saved_info(
        &self,
        section: &BankSection,
        resource_id: &str,
    ) -> Result<ServerSavedInfo, ProtectionError> {
        let value = section.get(METADATA_KEY).await?;
        serde_json::from_value(value).map_err(|e| ProtectionError::BadMetadata {
            id: resource_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn reassemble_chunks(&self, section: &BankSection) -> Result<Vec<u8>, ProtectionError> {
        let mut data = Vec::new();
        let mut index = 0;
        loop {
            match section.get(&format!("data_{index}")).await {
                Ok(value) => {
                    let encoded = value.as_str().ok_or_else(|| ProtectionError::BadMetadata {
                        id: section.prefix().to_string(),
                        reason: format!("data_{index} is not a string"),
                    })?;
                    let chunk =
                        BASE64
                            .decode(encoded)
                            .map_err(|e| ProtectionError::BadMetadata {
                                id: section.prefix().to_string(),
                                reason: format!("data_{index}: {e}"),
                            })?;
                    data.extend_from_slice(&chunk);
                    index += 1;
                }
                Err(BankError::NotFound(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl ProtectionPlugin for ServerProtectionPlugin {
    fn supported_resource_types(&self) -> &[ResourceType] {
        SUPPORTED
    }

    fn options_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("server_backup_options")
            .optional("description", FieldType::String, "description of the backup")
    }

    fn restore_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("server_restore_options")
            .optional("restore_name", FieldType::String, "name for the new server")
    }

    fn saved_info_schema(&self, _resource_type: ResourceType) -> Schema {
        Schema::new("server_saved_info")
            .field("resource_id", FieldType::String, "id of the protected server")
            .field("attach_metadata", FieldType::Object, "volume id to device path")
            .field("server_metadata", FieldType::Object, "server attributes")
            .field("snapshot_id", FieldType::String, "snapshot image id")
            .field("snapshot_metadata", FieldType::Object, "snapshot image attributes")
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

        // Visible before any external call.
        section
            .create(STATUS_KEY, json!(ProtectionStatus::Protecting))
            .await?;
        info!(server_id = %resource.id, backup_name, "creating server backup");

        match self
            .gather_and_snapshot(checkpoint, tree, node, &section)
            .await
        {
            Ok(saved) => {
                section
                    .update(STATUS_KEY, json!(ProtectionStatus::Available))
                    .await?;
                debug!(server_id = %resource.id, snapshot_id = %saved.snapshot_id, "server backup complete");
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
                if let Some(snapshot_id) = value.get("snapshot_id").and_then(|v| v.as_str()) {
                    if let Err(e) = self.image.delete_image(snapshot_id).await {
                        // The snapshot may already be gone; key removal
                        // below still has to happen.
                        warn!(snapshot_id, error = %e, "snapshot release failed");
                    }
                }
            }
            Err(BankError::NotFound(_)) => {
                debug!(server_id = %resource.id, "no metadata record, nothing to release");
            }
            Err(e) => return Err(e.into()),
        }

        section.delete_all().await?;
        info!(server_id = %resource.id, "server backup deleted");
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
        let saved = self.read_saved_info(&section, &resource.id).await?;

        // Prefer the banked payload; fall back to the original snapshot if
        // the backup carried no chunks.
        let data = self.reassemble_chunks(&section).await?;
        let image_id = if data.is_empty() {
            saved.snapshot_id.clone()
        } else {
            self.image
                .create_image(
                    &saved.snapshot_metadata.name,
                    &saved.snapshot_metadata.disk_format,
                    &saved.snapshot_metadata.container_format,
                    data,
                )
                .await?
        };

        let restore_name = options
            .get("restore_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("restore_{}", resource.name));
        let new_server_id = self
            .compute
            .create_server(&ServerRestoreSpec {
                name: restore_name,
                image_id,
                flavor_id: saved.server_metadata.flavor.clone(),
                availability_zone: saved.server_metadata.availability_zone.clone(),
                networks: saved.server_metadata.networks.clone(),
                key_name: saved.server_metadata.key_name.clone(),
                security_groups: saved.server_metadata.security_groups.clone(),
            })
            .await?;
        info!(server_id = %resource.id, new_server_id = %new_server_id, "server recreated");

        for (original_volume_id, device) in &saved.attach_metadata {
            let new_volume_id = restored
                .get(original_volume_id)
                .map(|r| r.new_id.clone())
                .ok_or_else(|| ProtectionError::MissingDependency {
                    id: resource.id.clone(),
                    dependency: original_volume_id.clone(),
                })?;
            self.compute
                .attach_volume(&new_server_id, &new_volume_id, device)
                .await?;
        }

        let result = RestoredResource {
            original_id: resource.id.clone(),
            new_id: new_server_id,
            details: Options::new(),
        };
        restored.insert(resource.id.clone(), result.clone());
        Ok(result)
    }
}
