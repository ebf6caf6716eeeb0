//! Protection orchestrator over a server-with-volume tree: processing
//! order, aggregate status, partial failure, and deletion.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use parasol::bank::Bank;
use parasol::checkpoint::Checkpoint;
use parasol::config::EngineConfig;
use parasol::protection::{
    PluginRegistry, ProtectionError, ProtectionOrchestrator, ProtectionStatus,
    ServerProtectionPlugin, VolumeProtectionPlugin, METADATA_KEY,
};
use parasol::resource::{Resource, ResourceTree, ResourceType};

use common::{init_tracing, request_context, FakeCloud, RecordingBankDriver};

fn registry(cloud: &Arc<FakeCloud>) -> PluginRegistry {
    let config = EngineConfig::default().with_artifact_chunk_size(4);
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(ServerProtectionPlugin::new(
        cloud.clone(),
        cloud.clone(),
        cloud.clone(),
        cloud.clone(),
        &config,
    )));
    registry.register(Arc::new(VolumeProtectionPlugin::new(cloud.clone())));
    registry
}

fn orchestrator(cloud: &Arc<FakeCloud>) -> ProtectionOrchestrator {
    ProtectionOrchestrator::new(registry(cloud), EngineConfig::default())
}

fn tree() -> ResourceTree {
    let mut tree = ResourceTree::new(Resource::new("vm_id_2", ResourceType::Server, "fake_vm"));
    let root = tree.root();
    tree.add_child(root, Resource::new("vol_id_1", ResourceType::Volume, "fake_vol"))
        .unwrap();
    tree
}

fn checkpoint() -> Checkpoint {
    Checkpoint::with_id(Bank::new(Arc::new(RecordingBankDriver::new())), "cp1")
}

#[tokio::test]
async fn protect_walks_children_before_parents() {
    init_tracing();
    let cloud = FakeCloud::new();
    let orchestrator = orchestrator(&cloud);
    let checkpoint = checkpoint();
    let tree = tree();

    let result = orchestrator
        .protect(&request_context(), &checkpoint, &tree, "backup_1", &HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.checkpoint_id, "cp1");
    assert_eq!(result.status, ProtectionStatus::Available);
    let order: Vec<&str> = result.outcomes.iter().map(|o| o.resource.id.as_str()).collect();
    assert_eq!(order, vec!["vol_id_1", "vm_id_2"]);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.status == ProtectionStatus::Available));

    // Both resources carry a metadata record and the checkpoint aggregates
    // to available.
    for id in ["vol_id_1", "vm_id_2"] {
        checkpoint
            .resource_section(id)
            .get(METADATA_KEY)
            .await
            .unwrap();
    }
    assert_eq!(
        checkpoint.status(&tree).await.unwrap(),
        ProtectionStatus::Available
    );
}

#[tokio::test]
async fn one_failing_resource_does_not_abort_its_siblings() {
    init_tracing();
    let cloud = FakeCloud::new();
    cloud.fail_volume_backup.store(true, Ordering::SeqCst);
    let orchestrator = orchestrator(&cloud);
    let checkpoint = checkpoint();
    let tree = tree();

    let result = orchestrator
        .protect(&request_context(), &checkpoint, &tree, "backup_1", &HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.status, ProtectionStatus::Error);
    let volume = &result.outcomes[0];
    assert_eq!(volume.resource.id, "vol_id_1");
    assert_eq!(volume.status, ProtectionStatus::Error);
    assert!(volume.error.is_some());

    // The server was still processed after the volume failed.
    let server = &result.outcomes[1];
    assert_eq!(server.resource.id, "vm_id_2");
    assert_eq!(server.status, ProtectionStatus::Available);

    assert_eq!(
        checkpoint.status(&tree).await.unwrap(),
        ProtectionStatus::Error
    );
}

#[tokio::test]
async fn protect_fails_fast_on_an_unhandled_resource_type() {
    init_tracing();
    let cloud = FakeCloud::new();
    let config = EngineConfig::default();
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(ServerProtectionPlugin::new(
        cloud.clone(),
        cloud.clone(),
        cloud.clone(),
        cloud.clone(),
        &config,
    )));
    let orchestrator = ProtectionOrchestrator::new(registry, config);
    let checkpoint = checkpoint();
    let tree = tree();

    let err = orchestrator
        .protect(&request_context(), &checkpoint, &tree, "backup_1", &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtectionError::PluginNotFound(ResourceType::Volume)
    ));

    // Nothing was written for any resource.
    for id in ["vol_id_1", "vm_id_2"] {
        assert!(checkpoint
            .resource_section(id)
            .list_all()
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn delete_releases_artifacts_and_empties_all_sections() {
    init_tracing();
    let cloud = FakeCloud::new();
    let orchestrator = orchestrator(&cloud);
    let checkpoint = checkpoint();
    let tree = tree();
    let ctx = request_context();

    orchestrator
        .protect(&ctx, &checkpoint, &tree, "backup_1", &HashMap::new())
        .await
        .unwrap();
    assert_eq!(cloud.volume_backups.len(), 1);
    assert!(!cloud.images.is_empty());

    let result = orchestrator.delete(&ctx, &checkpoint, &tree).await.unwrap();

    assert_eq!(result.status, ProtectionStatus::Deleted);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.status == ProtectionStatus::Deleted));
    assert!(cloud.volume_backups.is_empty());
    assert!(cloud.images.is_empty());
    for id in ["vol_id_1", "vm_id_2"] {
        assert!(checkpoint
            .resource_section(id)
            .list_all()
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn schema_rejects_malformed_options() {
    init_tracing();
    let cloud = FakeCloud::new();
    let orchestrator = orchestrator(&cloud);
    let checkpoint = checkpoint();
    let tree = tree();

    let mut options = HashMap::new();
    options.insert(
        ResourceType::Volume,
        common::options(serde_json::json!({"force": "yes"})),
    );

    let err = orchestrator
        .protect(&request_context(), &checkpoint, &tree, "backup_1", &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtectionError::Validation(_)));
}
