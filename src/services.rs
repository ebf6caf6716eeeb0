//! External service client interfaces.
//!
//! The engine treats the services owning protected resources (compute,
//! volume, image, network) and the provisioning orchestration service as
//! opaque capability interfaces. Concrete API clients live outside this
//! crate; tests plug in fakes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::identity::{RequestContext, TrustId};
use crate::restore::RestoreTarget;

/// Errors from calls to external resource or orchestration services.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The call was submitted and rejected or failed remotely.
    #[error("{service} call failed: {reason}")]
    CallFailed {
        /// Which service failed.
        service: &'static str,
        /// Failure detail from the client.
        reason: String,
    },

    /// The referenced entity does not exist on the service.
    #[error("{service}: {id} not found")]
    NotFound {
        /// Which service was queried.
        service: &'static str,
        /// The missing entity id.
        id: String,
    },

    /// The call did not complete within the configured bound.
    #[error("{service} call timed out after {timeout:?}")]
    Timeout {
        /// Which service timed out.
        service: &'static str,
        /// The configured bound.
        timeout: Duration,
    },
}

/// Whether an address on a server is fixed or floating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Address assigned from a tenant network.
    Fixed,
    /// Externally routable address mapped onto the server.
    Floating,
}

/// One address bound to a server port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAddress {
    /// MAC of the port carrying the address.
    pub mac_address: String,
    /// The IP address.
    pub ip_address: String,
    /// Fixed or floating.
    pub kind: AddressKind,
}

/// Compute-service view of a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server id.
    pub id: String,
    /// Server name.
    pub name: String,
    /// Availability zone the server runs in.
    pub availability_zone: String,
    /// Addresses bound to the server.
    pub addresses: Vec<ServerAddress>,
    /// Flavor id the server was built from.
    pub flavor_id: String,
    /// Keypair name, if any.
    pub key_name: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
}

/// Everything needed to recreate a server from a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRestoreSpec {
    /// Name for the new server.
    pub name: String,
    /// Image to boot from.
    pub image_id: String,
    /// Flavor id.
    pub flavor_id: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Network ids to attach.
    pub networks: Vec<String>,
    /// Keypair name, if any.
    pub key_name: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
}

/// One volume attachment as reported by the volume service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// Server the volume is attached to.
    pub server_id: String,
    /// The attached volume.
    pub volume_id: String,
    /// Device path on the server, e.g. `/dev/vdb`.
    pub device: String,
}

/// Volume-service view of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume id.
    pub id: String,
    /// Volume name.
    pub name: String,
    /// Volume type, if set.
    pub volume_type: Option<String>,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Service-side status string.
    pub status: String,
    /// Current attachments.
    pub attachments: Vec<AttachmentInfo>,
}

/// Image-service view of an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image id.
    pub id: String,
    /// Service-side status string.
    pub status: String,
    /// Disk format, e.g. `qcow2`.
    pub disk_format: String,
    /// Container format, e.g. `bare`.
    pub container_format: String,
}

/// A fixed IP on a network port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedIp {
    /// Subnet the address belongs to.
    pub subnet_id: String,
    /// The address.
    pub ip_address: String,
}

/// Network-service view of a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port id.
    pub id: String,
    /// Port MAC address.
    pub mac_address: String,
    /// Network the port belongs to.
    pub network_id: String,
    /// Device (server) the port is bound to.
    pub device_id: String,
    /// Fixed IPs on the port.
    pub fixed_ips: Vec<FixedIp>,
}

/// Minimal compute-service capability used by protection plugins.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Look up a server.
    async fn get_server(&self, server_id: &str) -> Result<ServerInfo, ServiceError>;

    /// Snapshot a server into an image, returning the image id.
    async fn create_server_image(
        &self,
        server_id: &str,
        image_name: &str,
    ) -> Result<String, ServiceError>;

    /// Create a server, returning the new server id.
    async fn create_server(&self, spec: &ServerRestoreSpec) -> Result<String, ServiceError>;

    /// Attach a volume to a server at the given device path.
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: &str,
    ) -> Result<(), ServiceError>;
}

/// Minimal volume-service capability used by protection plugins.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Look up a volume.
    async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, ServiceError>;

    /// Create a service-side backup of a volume, returning the backup id.
    async fn create_backup(&self, volume_id: &str, name: &str) -> Result<String, ServiceError>;

    /// Delete a service-side volume backup.
    async fn delete_backup(&self, backup_id: &str) -> Result<(), ServiceError>;

    /// Create a new volume from a backup, returning the new volume id.
    async fn create_volume_from_backup(
        &self,
        backup_id: &str,
        name: &str,
    ) -> Result<String, ServiceError>;
}

/// Minimal image-service capability used by protection plugins.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Look up an image.
    async fn get_image(&self, image_id: &str) -> Result<ImageInfo, ServiceError>;

    /// Download the full image payload.
    async fn download(&self, image_id: &str) -> Result<Vec<u8>, ServiceError>;

    /// Upload an image, returning the new image id.
    async fn create_image(
        &self,
        name: &str,
        disk_format: &str,
        container_format: &str,
        data: Vec<u8>,
    ) -> Result<String, ServiceError>;

    /// Delete an image.
    async fn delete_image(&self, image_id: &str) -> Result<(), ServiceError>;
}

/// Minimal network-service capability used by protection plugins.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Ports whose MAC address equals `mac_address`.
    async fn ports_by_mac(&self, mac_address: &str) -> Result<Vec<PortInfo>, ServiceError>;
}

/// Status of a provisioning stack as reported by the orchestration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackStatus {
    /// Stack creation is still running.
    CreateInProgress,
    /// Stack creation finished successfully.
    CreateComplete,
    /// Stack creation failed.
    CreateFailed,
    /// Any status this engine does not act on.
    Other(String),
}

impl StackStatus {
    /// Parse the orchestration service's status string.
    pub fn parse(status: &str) -> Self {
        match status {
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            other => StackStatus::Other(other.to_string()),
        }
    }
}

/// A provisioning template submitted to the orchestration service.
///
/// Template construction is an external concern; the engine only
/// accumulates opaque resource definitions and serializes the whole thing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackTemplate {
    /// Template format version understood by the orchestration service.
    pub version: Option<String>,
    /// Resource definitions keyed by template-local name.
    pub resources: BTreeMap<String, Value>,
}

impl StackTemplate {
    /// An empty template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource definition under `name`.
    pub fn add_resource(&mut self, name: impl Into<String>, definition: Value) {
        self.resources.insert(name.into(), definition);
    }

    /// Serialize the template for submission.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "heat_template_version": self.version.as_deref().unwrap_or("2015-04-30"),
            "resources": self.resources,
        })
    }
}

/// Orchestration-service capability consumed by the restore flow engine.
#[async_trait]
pub trait OrchestrationService: Send + Sync {
    /// Submit a stack creation request, returning the stack id.
    async fn create_stack(
        &self,
        name: &str,
        template: &StackTemplate,
    ) -> Result<String, ServiceError>;

    /// Current status of a stack.
    async fn get_stack(&self, stack_id: &str) -> Result<StackStatus, ServiceError>;
}

/// Builds orchestration clients for a restore run.
///
/// When a restore target is supplied, the client must authenticate against
/// it with the target's credentials instead of the caller's ambient ones.
/// When acting with ambient credentials, the engine passes a delegated
/// trust so the client can outlive the caller's token.
#[async_trait]
pub trait OrchestrationClientFactory: Send + Sync {
    /// Build a client bound to `endpoint` for this caller.
    async fn client(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        target: Option<&RestoreTarget>,
        trust: Option<&TrustId>,
    ) -> Result<Arc<dyn OrchestrationService>, ServiceError>;
}
