//! Shared fakes for integration tests: an in-process cloud, an
//! orchestration service with scripted stack statuses, a trust broker, and
//! a bank driver that records every write.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use parasol::bank::{BankDriver, BankError, ListQuery, MemoryBankDriver};
use parasol::identity::{AuthError, RequestContext, TrustBroker, TrustId};
use parasol::restore::RestoreTarget;
use parasol::services::{
    AddressKind, AttachmentInfo, ComputeService, FixedIp, ImageInfo, ImageService,
    NetworkService, OrchestrationClientFactory, OrchestrationService, PortInfo, ServerAddress,
    ServerInfo, ServerRestoreSpec, ServiceError, StackStatus, StackTemplate, VolumeInfo,
    VolumeService,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn request_context() -> Arc<RequestContext> {
    Arc::new(
        RequestContext::new("admin", "abcd", "efgh").with_roles(vec!["member".to_string()]),
    )
}

/// One fake deployment shared by all resource-service traits.
pub struct FakeCloud {
    pub servers: DashMap<String, ServerInfo>,
    pub volumes: DashMap<String, VolumeInfo>,
    pub images: DashMap<String, ImageInfo>,
    pub image_data: DashMap<String, Vec<u8>>,
    pub ports: Vec<PortInfo>,
    /// backup id -> volume id of service-side volume backups.
    pub volume_backups: DashMap<String, String>,
    pub created_servers: DashMap<String, ServerRestoreSpec>,
    /// (server id, volume id, device) attach calls, in order.
    pub attachments: Mutex<Vec<(String, String, String)>>,
    counter: AtomicUsize,
    pub fail_server_snapshot: AtomicBool,
    pub fail_volume_backup: AtomicBool,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        let cloud = Arc::new(Self {
            servers: DashMap::new(),
            volumes: DashMap::new(),
            images: DashMap::new(),
            image_data: DashMap::new(),
            ports: vec![
                PortInfo {
                    id: "port-1".to_string(),
                    mac_address: "mac_address_1".to_string(),
                    network_id: "network_id_1".to_string(),
                    device_id: "vm_id_1".to_string(),
                    fixed_ips: vec![FixedIp {
                        subnet_id: "subnet-1".to_string(),
                        ip_address: "10.0.0.21".to_string(),
                    }],
                },
                PortInfo {
                    id: "port-2".to_string(),
                    mac_address: "mac_address_2".to_string(),
                    network_id: "network_id_2".to_string(),
                    device_id: "vm_id_2".to_string(),
                    fixed_ips: vec![FixedIp {
                        subnet_id: "subnet-1".to_string(),
                        ip_address: "10.0.0.22".to_string(),
                    }],
                },
            ],
            volume_backups: DashMap::new(),
            created_servers: DashMap::new(),
            attachments: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            fail_server_snapshot: AtomicBool::new(false),
            fail_volume_backup: AtomicBool::new(false),
        });

        cloud.servers.insert(
            "vm_id_1".to_string(),
            ServerInfo {
                id: "vm_id_1".to_string(),
                name: "fake_vm".to_string(),
                availability_zone: "nova".to_string(),
                addresses: vec![ServerAddress {
                    mac_address: "mac_address_1".to_string(),
                    ip_address: "10.0.0.21".to_string(),
                    kind: AddressKind::Fixed,
                }],
                flavor_id: "flavor_id".to_string(),
                key_name: None,
                security_groups: vec!["default".to_string()],
            },
        );
        cloud.servers.insert(
            "vm_id_2".to_string(),
            ServerInfo {
                id: "vm_id_2".to_string(),
                name: "fake_vm".to_string(),
                availability_zone: "nova".to_string(),
                addresses: vec![ServerAddress {
                    mac_address: "mac_address_2".to_string(),
                    ip_address: "10.0.0.22".to_string(),
                    kind: AddressKind::Fixed,
                }],
                flavor_id: "flavor_id".to_string(),
                key_name: None,
                security_groups: vec!["default".to_string()],
            },
        );
        cloud.volumes.insert(
            "vol_id_1".to_string(),
            VolumeInfo {
                id: "vol_id_1".to_string(),
                name: "fake_vol".to_string(),
                volume_type: None,
                size_gb: 1,
                status: "in-use".to_string(),
                attachments: vec![AttachmentInfo {
                    server_id: "vm_id_2".to_string(),
                    volume_id: "vol_id_1".to_string(),
                    device: "/dev/vdb".to_string(),
                }],
            },
        );
        cloud
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ComputeService for FakeCloud {
    async fn get_server(&self, server_id: &str) -> Result<ServerInfo, ServiceError> {
        self.servers
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| ServiceError::NotFound {
                service: "compute",
                id: server_id.to_string(),
            })
    }

    async fn create_server_image(
        &self,
        server_id: &str,
        _image_name: &str,
    ) -> Result<String, ServiceError> {
        if self.fail_server_snapshot.load(Ordering::SeqCst) {
            return Err(ServiceError::CallFailed {
                service: "compute",
                reason: "snapshot quota exceeded".to_string(),
            });
        }
        let image_id = self.next_id("image");
        self.images.insert(
            image_id.clone(),
            ImageInfo {
                id: image_id.clone(),
                status: "active".to_string(),
                disk_format: "qcow2".to_string(),
                container_format: "bare".to_string(),
            },
        );
        self.image_data
            .insert(image_id.clone(), format!("image_data_{server_id}").into_bytes());
        Ok(image_id)
    }

    async fn create_server(&self, spec: &ServerRestoreSpec) -> Result<String, ServiceError> {
        let server_id = self.next_id("server");
        self.created_servers.insert(server_id.clone(), spec.clone());
        Ok(server_id)
    }

    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: &str,
    ) -> Result<(), ServiceError> {
        self.attachments.lock().push((
            server_id.to_string(),
            volume_id.to_string(),
            device.to_string(),
        ));
        Ok(())
    }
}

#[async_trait]
impl VolumeService for FakeCloud {
    async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, ServiceError> {
        self.volumes
            .get(volume_id)
            .map(|v| v.clone())
            .ok_or_else(|| ServiceError::NotFound {
                service: "volume",
                id: volume_id.to_string(),
            })
    }

    async fn create_backup(&self, volume_id: &str, _name: &str) -> Result<String, ServiceError> {
        if self.fail_volume_backup.load(Ordering::SeqCst) {
            return Err(ServiceError::CallFailed {
                service: "volume",
                reason: "backup service unavailable".to_string(),
            });
        }
        let backup_id = self.next_id("backup");
        self.volume_backups
            .insert(backup_id.clone(), volume_id.to_string());
        Ok(backup_id)
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<(), ServiceError> {
        self.volume_backups.remove(backup_id);
        Ok(())
    }

    async fn create_volume_from_backup(
        &self,
        backup_id: &str,
        _name: &str,
    ) -> Result<String, ServiceError> {
        if !self.volume_backups.contains_key(backup_id) {
            return Err(ServiceError::NotFound {
                service: "volume",
                id: backup_id.to_string(),
            });
        }
        Ok(self.next_id("volume"))
    }
}

#[async_trait]
impl ImageService for FakeCloud {
    async fn get_image(&self, image_id: &str) -> Result<ImageInfo, ServiceError> {
        self.images
            .get(image_id)
            .map(|i| i.clone())
            .ok_or_else(|| ServiceError::NotFound {
                service: "image",
                id: image_id.to_string(),
            })
    }

    async fn download(&self, image_id: &str) -> Result<Vec<u8>, ServiceError> {
        self.image_data
            .get(image_id)
            .map(|d| d.clone())
            .ok_or_else(|| ServiceError::NotFound {
                service: "image",
                id: image_id.to_string(),
            })
    }

    async fn create_image(
        &self,
        _name: &str,
        disk_format: &str,
        container_format: &str,
        data: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let image_id = self.next_id("image");
        self.images.insert(
            image_id.clone(),
            ImageInfo {
                id: image_id.clone(),
                status: "active".to_string(),
                disk_format: disk_format.to_string(),
                container_format: container_format.to_string(),
            },
        );
        self.image_data.insert(image_id.clone(), data);
        Ok(image_id)
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), ServiceError> {
        self.images.remove(image_id);
        self.image_data.remove(image_id);
        Ok(())
    }
}

#[async_trait]
impl NetworkService for FakeCloud {
    async fn ports_by_mac(&self, mac_address: &str) -> Result<Vec<PortInfo>, ServiceError> {
        Ok(self
            .ports
            .iter()
            .filter(|p| p.mac_address == mac_address)
            .cloned()
            .collect())
    }
}

/// Orchestration service returning a scripted sequence of stack statuses.
/// The last status in the script repeats on further polls.
pub struct FakeOrchestration {
    statuses: Mutex<VecDeque<StackStatus>>,
    pub polls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_poll: AtomicBool,
    pub created: Mutex<Vec<(String, Value)>>,
}

impl FakeOrchestration {
    pub fn with_statuses(statuses: Vec<StackStatus>) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.into()),
            polls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_poll: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrchestrationService for FakeOrchestration {
    async fn create_stack(
        &self,
        name: &str,
        template: &StackTemplate,
    ) -> Result<String, ServiceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ServiceError::CallFailed {
                service: "orchestration",
                reason: "stack validation failed".to_string(),
            });
        }
        self.created
            .lock()
            .push((name.to_string(), template.to_value()));
        Ok("stack_id_1".to_string())
    }

    async fn get_stack(&self, stack_id: &str) -> Result<StackStatus, ServiceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(ServiceError::CallFailed {
                service: "orchestration",
                reason: format!("stack {stack_id} lookup failed"),
            });
        }
        let mut statuses = self.statuses.lock();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().expect("non-empty"))
        } else {
            Ok(statuses
                .front()
                .cloned()
                .unwrap_or(StackStatus::CreateComplete))
        }
    }
}

/// Factory handing out one shared fake client, recording how it was asked.
pub struct FakeOrchestrationFactory {
    pub client: Arc<FakeOrchestration>,
    pub seen_endpoint: Mutex<Option<String>>,
    pub seen_trust: Mutex<Option<String>>,
    pub saw_target: AtomicBool,
}

impl FakeOrchestrationFactory {
    pub fn new(client: Arc<FakeOrchestration>) -> Arc<Self> {
        Arc::new(Self {
            client,
            seen_endpoint: Mutex::new(None),
            seen_trust: Mutex::new(None),
            saw_target: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl OrchestrationClientFactory for FakeOrchestrationFactory {
    async fn client(
        &self,
        _ctx: &RequestContext,
        endpoint: &str,
        target: Option<&RestoreTarget>,
        trust: Option<&TrustId>,
    ) -> Result<Arc<dyn OrchestrationService>, ServiceError> {
        *self.seen_endpoint.lock() = Some(endpoint.to_string());
        *self.seen_trust.lock() = trust.map(|t| t.to_string());
        self.saw_target.store(target.is_some(), Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

/// Trust broker that hands out sequential trust ids and records deletions.
pub struct FakeBroker {
    pub endpoint: String,
    pub trusts_created: AtomicUsize,
    pub trusts_deleted: Mutex<Vec<String>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoint: "http://heat.example:8004".to_string(),
            trusts_created: AtomicUsize::new(0),
            trusts_deleted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TrustBroker for FakeBroker {
    async fn create_trust(&self, _ctx: &RequestContext) -> Result<TrustId, AuthError> {
        let n = self.trusts_created.fetch_add(1, Ordering::SeqCst);
        Ok(TrustId(format!("trust_{n}")))
    }

    async fn delete_trust(&self, trust_id: &TrustId) -> Result<(), AuthError> {
        self.trusts_deleted.lock().push(trust_id.to_string());
        Ok(())
    }

    async fn get_endpoint(
        &self,
        _service_name: &str,
        _service_type: &str,
        _region_id: &str,
        _interface: &str,
    ) -> Result<String, AuthError> {
        Ok(self.endpoint.clone())
    }
}

/// Bank driver that records every create/update so tests can assert on
/// exact write sequences.
pub struct RecordingBankDriver {
    inner: MemoryBankDriver,
    pub writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingBankDriver {
    pub fn new() -> Self {
        Self {
            inner: MemoryBankDriver::new(),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Values written to `key`, in order.
    pub fn writes_to(&self, key: &str) -> Vec<Value> {
        self.writes
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl BankDriver for RecordingBankDriver {
    async fn create(&self, key: &str, value: Value) -> Result<(), BankError> {
        self.writes.lock().push((key.to_string(), value.clone()));
        self.inner.create(key, value).await
    }

    async fn update(&self, key: &str, value: Value) -> Result<(), BankError> {
        self.writes.lock().push((key.to_string(), value.clone()));
        self.inner.update(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Value, BankError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BankError> {
        self.inner.delete(key).await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<String>, BankError> {
        self.inner.list(query).await
    }

    fn owner_id(&self) -> String {
        self.inner.owner_id()
    }
}

/// Options map helper.
pub fn options(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Options maps keyed by resource type, from `(type, json)` pairs.
pub fn options_by_type(
    pairs: Vec<(parasol::resource::ResourceType, Value)>,
) -> HashMap<parasol::resource::ResourceType, serde_json::Map<String, Value>> {
    pairs
        .into_iter()
        .map(|(rt, v)| (rt, options(v)))
        .collect()
}
