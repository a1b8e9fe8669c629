//! End-to-end scenarios over a full stack: a warp-served manager, a real
//! provider subscribed over HTTP, and an in-memory CSI plugin on a UNIX
//! socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use csi_mock::{MockCsiPlugin, ServerHandle};
use storage_provider::api::{
    AcknowledgeOperationStatus, ApplyOperation, ContentType, CreateDisk, DestroyDisk,
    OperationInfo, OperationState, OperationType, Resource, ResourceProviderInfo, SourceType,
    StoragePluginInfo, UpdateOperationStatus, UpdateState,
};
use storage_provider::csi::CsiClient;
use storage_provider::manager::{ResourceProviderManager, ResourceProviderMessage};
use storage_provider::profile::{ProfileInfo, StaticProfileAdaptor};
use storage_provider::provider::{ProviderOptions, StorageLocalResourceProvider};
use storage_provider::registrar::Registrar;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(20);

struct Cluster {
    manager: Arc<ResourceProviderManager>,
    inbox: mpsc::UnboundedReceiver<ResourceProviderMessage>,
    endpoint: String,
    plugin: MockCsiPlugin,
    plugin_socket: PathBuf,
    plugin_server: Option<ServerHandle>,
    adaptor: StaticProfileAdaptor,
    client_watch: watch::Receiver<Option<CsiClient>>,
    _client_tx: watch::Sender<Option<CsiClient>>,
    work_dir: PathBuf,
    provider: StorageLocalResourceProvider,
}

fn provider_info() -> ResourceProviderInfo {
    ResourceProviderInfo {
        r#type: "org.storlet.rp.local.storage".to_string(),
        name: "test".to_string(),
        id: None,
        storage: Some(StoragePluginInfo {
            plugin_type: "org.storlet.csi.test".to_string(),
            plugin_name: "test".to_string(),
            containers: Vec::new(),
        }),
        default_reservations: Vec::new(),
    }
}

async fn spawn_provider(
    work_dir: &PathBuf,
    endpoint: &str,
    adaptor: &StaticProfileAdaptor,
    client_watch: &watch::Receiver<Option<CsiClient>>,
    boot_id: &str,
) -> StorageLocalResourceProvider {
    StorageLocalResourceProvider::start(ProviderOptions {
        work_dir: work_dir.clone(),
        endpoint: endpoint.to_string(),
        info: provider_info(),
        adaptor: Arc::new(adaptor.clone()),
        poll_interval: Duration::from_millis(250),
        content_type: ContentType::Protobuf,
        client_watch: client_watch.clone(),
        boot_id: boot_id.to_string(),
    })
    .await
    .unwrap()
}

impl Cluster {
    async fn start(tempdir: &tempfile::TempDir, capacity_mb: i64) -> Self {
        let work_dir = tempdir.path().join("work");

        // Agent side
        let registrar = Arc::new(Registrar::recover(&work_dir).await.unwrap());
        let (manager, inbox) = ResourceProviderManager::new(registrar);
        let (addr, server): (SocketAddr, _) =
            warp::serve(manager.clone().routes()).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        let endpoint = format!("http://{}/api/v1/resource_provider", addr);

        // CSI plugin
        let plugin_socket = tempdir.path().join("plugin.sock");
        let plugin = MockCsiPlugin::builder()
            .capacity_mb("test", capacity_mb)
            .backing_dir(tempdir.path().join("backing"))
            .build();
        let plugin_server = plugin.serve(&plugin_socket).await.unwrap();
        let client = CsiClient::connect(&plugin_socket).await.unwrap();
        let (client_tx, client_watch) = watch::channel(Some(client));

        let adaptor = StaticProfileAdaptor::new(
            [("test".to_string(), ProfileInfo::mount("test"))]
                .into_iter()
                .collect(),
        );

        let provider =
            spawn_provider(&work_dir, &endpoint, &adaptor, &client_watch, "boot-1").await;

        Cluster {
            manager,
            inbox,
            endpoint,
            plugin,
            plugin_socket,
            plugin_server: Some(plugin_server),
            adaptor,
            client_watch,
            _client_tx: client_tx,
            work_dir,
            provider,
        }
    }

    /// Restarts the provider process under a new boot id.
    async fn restart_provider(&mut self, boot_id: &str) {
        self.provider.stop();
        self.provider = spawn_provider(
            &self.work_dir,
            &self.endpoint,
            &self.adaptor,
            &self.client_watch,
            boot_id,
        )
        .await;
    }

    async fn next_update_state(&mut self) -> (String, UpdateState) {
        timeout(WAIT, async {
            loop {
                match self.inbox.recv().await.expect("manager inbox closed") {
                    ResourceProviderMessage::UpdateState {
                        provider_id,
                        update,
                    } => return (provider_id, update),
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for UPDATE_STATE")
    }

    async fn next_operation_status(&mut self) -> UpdateOperationStatus {
        timeout(WAIT, async {
            loop {
                match self.inbox.recv().await.expect("manager inbox closed") {
                    ResourceProviderMessage::UpdateOperationStatus { update } => return update,
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for UPDATE_OPERATION_STATUS")
    }

    async fn acknowledge(&self, provider_id: &str, update: &UpdateOperationStatus) {
        self.manager
            .acknowledge_operation_status(
                provider_id,
                AcknowledgeOperationStatus {
                    status_uuid: update
                        .status
                        .as_ref()
                        .and_then(|s| s.uuid.clone())
                        .expect("terminal statuses carry a uuid"),
                    operation_uuid: update.operation_uuid.clone(),
                },
            )
            .await
            .expect("acknowledgement should be deliverable");
    }

    /// Applies a CREATE_DISK of `disk_mb` out of the pool and returns the
    /// operation uuid.
    async fn apply_create_disk(
        &self,
        provider_id: &str,
        pool: &Resource,
        disk_mb: u64,
        resource_version: &str,
    ) -> String {
        let mut source = pool.clone();
        source.disk_mb = disk_mb;
        let operation_uuid = Uuid::new_v4().to_string();
        self.manager
            .apply_operation(
                provider_id,
                ApplyOperation {
                    info: Some(OperationInfo {
                        r#type: OperationType::CreateDisk as i32,
                        create_disk: Some(CreateDisk {
                            source: Some(source),
                            target_type: SourceType::Mount as i32,
                            target_profile: None,
                        }),
                        ..Default::default()
                    }),
                    framework_id: None,
                    operation_uuid: operation_uuid.clone(),
                    resource_version_uuid: resource_version.to_string(),
                },
            )
            .await
            .expect("apply should reach the provider");
        operation_uuid
    }
}

fn storage_pool(update: &UpdateState) -> Resource {
    update
        .resources
        .iter()
        .find(|r| r.is_storage_pool())
        .cloned()
        .expect("totals should contain a storage pool")
}

#[tokio::test]
async fn create_then_destroy() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);
    assert_eq!(pool.disk_mb, 4096);
    assert_eq!(pool.profile(), Some("test"));

    // CREATE_DISK over the whole pool
    let operation_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 4096, &update.resource_version_uuid)
        .await;

    let status_update = cluster.next_operation_status().await;
    assert_eq!(status_update.operation_uuid, operation_uuid);
    let status = status_update.status.clone().unwrap();
    assert_eq!(status.state, OperationState::Finished as i32);

    let volume = status.converted_resources[0].clone();
    assert!(volume.is_managed_volume());
    assert_eq!(volume.volume_id(), Some(operation_uuid.as_str()));
    assert_eq!(volume.profile(), Some("test"));
    assert!(volume.source().unwrap().mount_root.is_some());
    let metadata_path = volume
        .source()
        .unwrap()
        .metadata
        .get("path")
        .expect("created volumes carry their backing path");
    assert!(
        tokio::fs::metadata(metadata_path).await.is_ok(),
        "backing path should exist after CREATE_DISK"
    );

    cluster.acknowledge(&provider_id, &status_update).await;

    // DESTROY_DISK converts back to a RAW pool of the same size
    let destroy_uuid = Uuid::new_v4().to_string();
    cluster
        .manager
        .apply_operation(
            &provider_id,
            ApplyOperation {
                info: Some(OperationInfo {
                    r#type: OperationType::DestroyDisk as i32,
                    destroy_disk: Some(DestroyDisk {
                        source: Some(volume.clone()),
                    }),
                    ..Default::default()
                }),
                framework_id: None,
                operation_uuid: destroy_uuid.clone(),
                resource_version_uuid: update.resource_version_uuid.clone(),
            },
        )
        .await
        .unwrap();

    let status_update = cluster.next_operation_status().await;
    assert_eq!(status_update.operation_uuid, destroy_uuid);
    let status = status_update.status.clone().unwrap();
    assert_eq!(status.state, OperationState::Finished as i32);
    let raw = &status.converted_resources[0];
    assert!(raw.is_storage_pool());
    assert_eq!(raw.disk_mb, 4096);

    assert!(
        tokio::fs::metadata(metadata_path).await.is_err(),
        "backing path should vanish after DESTROY_DISK"
    );
    cluster.acknowledge(&provider_id, &status_update).await;

    let totals = cluster.provider.totals().await;
    assert_eq!(
        totals.iter().filter(|r| r.is_storage_pool()).map(|r| r.disk_mb).sum::<u64>(),
        4096
    );
}

#[tokio::test]
async fn create_then_reboot_then_destroy() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);
    let operation_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 4096, &update.resource_version_uuid)
        .await;
    let status_update = cluster.next_operation_status().await;
    let volume = status_update.status.clone().unwrap().converted_resources[0].clone();
    cluster.acknowledge(&provider_id, &status_update).await;

    // Run a "task": publish the volume and write a file into it
    cluster
        .manager
        .publish_resources(&[volume.clone()])
        .await
        .expect("publish should succeed");
    let published = cluster
        .provider
        .volume_manager()
        .published_path(&operation_uuid);
    tokio::fs::write(published.join("file"), b"data")
        .await
        .expect("task should be able to write into the volume");

    // "Reboot" the node: restart the provider under a different boot id
    cluster.restart_provider("boot-2").await;
    let (provider_id, update) = cluster.next_update_state().await;

    // The persistent volume survives in the totals and was demoted off its
    // node-level mounts
    assert!(update
        .resources
        .iter()
        .any(|r| r.volume_id() == Some(operation_uuid.as_str())));
    let record = cluster
        .provider
        .volume_manager()
        .record(&operation_uuid)
        .await
        .expect("volume state should survive the reboot");
    assert_eq!(record.state, storage_provider::volume::VolumeState::NodeReady);

    // The second "task" sees the file written before the reboot
    cluster
        .manager
        .publish_resources(&[volume.clone()])
        .await
        .expect("republish should succeed");
    assert!(
        tokio::fs::metadata(published.join("file")).await.is_ok(),
        "data should survive the reboot"
    );

    // Destroy: the underlying path vanishes
    let destroy_uuid = Uuid::new_v4().to_string();
    cluster
        .manager
        .apply_operation(
            &provider_id,
            ApplyOperation {
                info: Some(OperationInfo {
                    r#type: OperationType::DestroyDisk as i32,
                    destroy_disk: Some(DestroyDisk {
                        source: Some(volume),
                    }),
                    ..Default::default()
                }),
                framework_id: None,
                operation_uuid: destroy_uuid,
                resource_version_uuid: update.resource_version_uuid.clone(),
            },
        )
        .await
        .unwrap();
    let status_update = cluster.next_operation_status().await;
    assert_eq!(
        status_update.status.as_ref().unwrap().state,
        OperationState::Finished as i32
    );
    assert!(
        tokio::fs::metadata(&published).await.is_err(),
        "the publish target should vanish after destroy"
    );
}

#[tokio::test]
async fn dropped_status_update_is_retried_until_acknowledged() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);
    let operation_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 4096, &update.resource_version_uuid)
        .await;

    // First delivery arrives; drop it on the floor
    let first = cluster.next_operation_status().await;
    let status_uuid = first.status.as_ref().unwrap().uuid.clone().unwrap();

    // After the minimum retry interval an identical update arrives
    let second = timeout(Duration::from_secs(25), async {
        loop {
            let update = cluster.next_operation_status().await;
            if update.operation_uuid == operation_uuid {
                return update;
            }
        }
    })
    .await
    .expect("the unacknowledged update should be retransmitted");
    assert_eq!(
        second.status.as_ref().unwrap().uuid.as_deref(),
        Some(status_uuid.as_str())
    );

    cluster.acknowledge(&provider_id, &second).await;

    // After the terminal acknowledgement the operation is gone: a
    // reconciliation now reports it as dropped
    tokio::time::sleep(Duration::from_millis(250)).await;
    cluster
        .manager
        .reconcile_operations(&provider_id, vec![operation_uuid.clone()])
        .await
        .unwrap();
    let verdict = cluster.next_operation_status().await;
    assert_eq!(verdict.operation_uuid, operation_uuid);
    assert_eq!(
        verdict.status.as_ref().unwrap().state,
        OperationState::Dropped as i32
    );
}

#[tokio::test]
async fn profile_disappearance_fences_stale_operations() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);
    let stale_version = update.resource_version_uuid.clone();

    // The profile disappears; the provider reconciles and refreshes its
    // resource version
    cluster.adaptor.set(Default::default()).await;
    let (_, refreshed) = cluster.next_update_state().await;
    assert_ne!(refreshed.resource_version_uuid, stale_version);
    assert!(refreshed.resources.iter().all(|r| !r.is_storage_pool()));

    // An operation fenced on the stale version is dropped
    let operation_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 4096, &stale_version)
        .await;
    let status_update = cluster.next_operation_status().await;
    assert_eq!(status_update.operation_uuid, operation_uuid);
    let status = status_update.status.unwrap();
    assert_eq!(status.state, OperationState::Dropped as i32);
    assert!(status
        .message
        .unwrap()
        .contains("Mismatched resource version"));
}

#[tokio::test]
async fn publish_survives_a_plugin_restart() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);
    let operation_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 4096, &update.resource_version_uuid)
        .await;
    let status_update = cluster.next_operation_status().await;
    let volume = status_update.status.clone().unwrap().converted_resources[0].clone();
    cluster.acknowledge(&provider_id, &status_update).await;

    // Kill the plugin, then publish: the volume manager blocks in its
    // retry loop until the plugin is back
    cluster.plugin_server.take();
    let manager = cluster.manager.clone();
    let publish = tokio::spawn(async move { manager.publish_resources(&[volume]).await });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    cluster.plugin_server = Some(cluster.plugin.serve(&cluster.plugin_socket).await.unwrap());

    timeout(Duration::from_secs(30), publish)
        .await
        .expect("publish should finish once the plugin is back")
        .unwrap()
        .expect("publish should succeed");

    let record = cluster
        .provider
        .volume_manager()
        .record(&operation_uuid)
        .await
        .unwrap();
    assert_eq!(record.state, storage_provider::volume::VolumeState::Published);
}

#[tokio::test]
async fn reconciliation_reports_dropped_and_finished_operations() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(&tempdir, 4096).await;

    let (provider_id, update) = cluster.next_update_state().await;
    let pool = storage_pool(&update);

    // One operation reaches the provider; a second one is "lost in transit"
    let known_uuid = cluster
        .apply_create_disk(&provider_id, &pool, 1024, &update.resource_version_uuid)
        .await;
    let lost_uuid = Uuid::new_v4().to_string();

    let status_update = cluster.next_operation_status().await;
    assert_eq!(status_update.operation_uuid, known_uuid);

    // The master reconciles both after a reregistration
    cluster
        .manager
        .reconcile_operations(
            &provider_id,
            vec![known_uuid.clone(), lost_uuid.clone()],
        )
        .await
        .unwrap();

    // The retransmission of the unacknowledged terminal status may
    // interleave with the verdicts, so collect until both are seen
    let mut verdicts = HashMap::new();
    timeout(WAIT, async {
        while !(verdicts.contains_key(&known_uuid) && verdicts.contains_key(&lost_uuid)) {
            let update = cluster.next_operation_status().await;
            verdicts.insert(
                update.operation_uuid.clone(),
                update.status.as_ref().unwrap().state,
            );
        }
    })
    .await
    .expect("both reconciliation verdicts should arrive");
    assert_eq!(
        verdicts.get(&known_uuid),
        Some(&(OperationState::Finished as i32))
    );
    assert_eq!(
        verdicts.get(&lost_uuid),
        Some(&(OperationState::Dropped as i32))
    );

    // The surviving operation's conversion is visible in the totals
    let totals = cluster.provider.totals().await;
    assert!(totals
        .iter()
        .any(|r| r.volume_id() == Some(known_uuid.as_str())));
}
