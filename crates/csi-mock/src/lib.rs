//! An in-memory CSI plugin for exercising the storage provider without real
//! storage hardware. Volumes are backed by plain directories, and "mounting"
//! is a symlink from the requested target path to the backing directory, so
//! data written through a published volume survives unpublish/republish
//! cycles just like a bind mount would.

pub mod uds;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use k8s_csi::v1_3_0 as csi;
use k8s_csi::v1_3_0::controller_server::{Controller, ControllerServer};
use k8s_csi::v1_3_0::identity_server::{Identity, IdentityServer};
use k8s_csi::v1_3_0::node_server::{Node, NodeServer};
use tokio::sync::oneshot;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, info, warn};

const MB: i64 = 1024 * 1024;

/// One provisioned volume and where it is currently attached.
#[derive(Clone, Debug)]
pub struct MockVolume {
    pub capacity_bytes: i64,
    pub profile: String,
    pub backing_path: PathBuf,
    pub staged_at: Option<PathBuf>,
    pub published_at: Vec<PathBuf>,
    pub controller_published: bool,
}

struct Inner {
    name: String,
    node_id: String,
    backing_dir: PathBuf,
    publish_unpublish: bool,
    stage_unstage: bool,
    /// Configured capacity in bytes per profile parameter value.
    capacities: Mutex<HashMap<String, i64>>,
    volumes: Mutex<HashMap<String, MockVolume>>,
}

/// The mock plugin. Clones share state, so a test can keep a handle for
/// assertions while a server task owns another.
#[derive(Clone)]
pub struct MockCsiPlugin {
    inner: Arc<Inner>,
}

pub struct Builder {
    name: String,
    node_id: String,
    backing_dir: Option<PathBuf>,
    capacities: HashMap<String, i64>,
    publish_unpublish: bool,
    stage_unstage: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: "org.storlet.csi-mock".to_string(),
            node_id: "csi-mock-node".to_string(),
            backing_dir: None,
            capacities: HashMap::new(),
            publish_unpublish: true,
            stage_unstage: true,
        }
    }
}

impl Builder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Configures backing capacity for the given profile parameter value.
    pub fn capacity_mb(mut self, profile: &str, mb: i64) -> Self {
        self.capacities.insert(profile.to_string(), mb * MB);
        self
    }

    /// Where volume backing directories are created. Defaults to a fresh
    /// directory under the system temp dir.
    pub fn backing_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.backing_dir = Some(path.into());
        self
    }

    /// Drops the `PUBLISH_UNPUBLISH_VOLUME` controller capability.
    pub fn without_controller_publish(mut self) -> Self {
        self.publish_unpublish = false;
        self
    }

    /// Drops the `STAGE_UNSTAGE_VOLUME` node capability.
    pub fn without_stage_unstage(mut self) -> Self {
        self.stage_unstage = false;
        self
    }

    pub fn build(self) -> MockCsiPlugin {
        let backing_dir = self.backing_dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("csi-mock-{}", uuid::Uuid::new_v4()))
        });
        MockCsiPlugin {
            inner: Arc::new(Inner {
                name: self.name,
                node_id: self.node_id,
                backing_dir,
                publish_unpublish: self.publish_unpublish,
                stage_unstage: self.stage_unstage,
                capacities: Mutex::new(self.capacities),
                volumes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds the plugin and serves it on the given socket path.
    pub async fn serve(self, socket_path: impl AsRef<Path>) -> anyhow::Result<ServerHandle> {
        let plugin = self.build();
        plugin.serve(socket_path).await
    }
}

/// Handle to a running mock server; shuts the server down when dropped.
pub struct ServerHandle {
    pub plugin: MockCsiPlugin,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl MockCsiPlugin {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Serves the plugin on a UNIX socket until the returned handle is
    /// dropped. A plugin can be served again after a shutdown to simulate a
    /// plugin restart that keeps its volumes.
    pub async fn serve(&self, socket_path: impl AsRef<Path>) -> anyhow::Result<ServerHandle> {
        tokio::fs::create_dir_all(&self.inner.backing_dir).await?;
        let incoming = uds::incoming(&socket_path)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let plugin = self.clone();
        let socket = socket_path.as_ref().to_owned();
        tokio::spawn(async move {
            info!(socket = %socket.display(), "csi-mock serving");
            let result = Server::builder()
                .add_service(IdentityServer::new(plugin.clone()))
                .add_service(ControllerServer::new(plugin.clone()))
                .add_service(NodeServer::new(plugin))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "csi-mock server exited with error");
            }
            let _ = std::fs::remove_file(&socket);
        });

        Ok(ServerHandle {
            plugin: self.clone(),
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn volume(&self, volume_id: &str) -> Option<MockVolume> {
        self.inner.volumes.lock().unwrap().get(volume_id).cloned()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.inner.volumes.lock().unwrap().keys().cloned().collect()
    }

    /// Registers a volume that "already existed" on the backend, for
    /// exercising pre-existing volume discovery and import.
    pub fn preprovision_volume(&self, volume_id: &str, capacity_mb: i64) -> PathBuf {
        let backing_path = self.inner.backing_dir.join(volume_id);
        std::fs::create_dir_all(&backing_path).expect("should be able to create backing dir");
        self.inner.volumes.lock().unwrap().insert(
            volume_id.to_string(),
            MockVolume {
                capacity_bytes: capacity_mb * MB,
                profile: String::new(),
                backing_path: backing_path.clone(),
                staged_at: None,
                published_at: Vec::new(),
                controller_published: false,
            },
        );
        backing_path
    }

    fn available_bytes(&self, profile: &str) -> i64 {
        let configured = *self
            .inner
            .capacities
            .lock()
            .unwrap()
            .get(profile)
            .unwrap_or(&0);
        let used: i64 = self
            .inner
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.profile == profile)
            .map(|v| v.capacity_bytes)
            .sum();
        (configured - used).max(0)
    }
}

/// Replaces `link` (an empty directory pre-created by the orchestrator, or
/// nothing at all) with a symlink to `target`.
fn attach(link: &Path, target: &Path) -> Result<(), Status> {
    if let Ok(meta) = std::fs::symlink_metadata(link) {
        if meta.file_type().is_symlink() {
            return Ok(());
        }
        std::fs::remove_dir(link)
            .map_err(|e| Status::internal(format!("target path not attachable: {}", e)))?;
    } else if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Status::internal(format!("unable to create parent: {}", e)))?;
    }
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Status::internal(format!("unable to attach: {}", e)))
}

/// Undoes [`attach`]; missing paths are fine.
fn detach(link: &Path) -> Result<(), Status> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(link)
            .map_err(|e| Status::internal(format!("unable to detach: {}", e))),
        Ok(_) => std::fs::remove_dir_all(link)
            .map_err(|e| Status::internal(format!("unable to detach: {}", e))),
        Err(_) => Ok(()),
    }
}

#[tonic::async_trait]
impl Identity for MockCsiPlugin {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.inner.name.clone(),
            vendor_version: "0.1.0".to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: vec![csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            }],
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

#[tonic::async_trait]
impl Controller for MockCsiPlugin {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }

        let capacity_bytes = request
            .capacity_range
            .as_ref()
            .map(|r| {
                if r.required_bytes > 0 {
                    r.required_bytes
                } else {
                    r.limit_bytes
                }
            })
            .unwrap_or(0);
        let profile = request
            .parameters
            .get("profile")
            .cloned()
            .unwrap_or_default();

        {
            let volumes = self.inner.volumes.lock().unwrap();
            if let Some(existing) = volumes.get(&request.name) {
                // Idempotent re-creation is fine; a different incompatible
                // request for the same name is not
                if existing.capacity_bytes != capacity_bytes || existing.profile != profile {
                    return Err(Status::already_exists(format!(
                        "volume {} exists with different parameters",
                        request.name
                    )));
                }
                return Ok(Response::new(csi::CreateVolumeResponse {
                    volume: Some(volume_message(&request.name, existing)),
                }));
            }
        }

        if capacity_bytes > self.available_bytes(&profile) {
            return Err(Status::out_of_range(format!(
                "insufficient capacity under profile {:?}",
                profile
            )));
        }

        let backing_path = self.inner.backing_dir.join(&request.name);
        std::fs::create_dir_all(&backing_path)
            .map_err(|e| Status::internal(format!("unable to create backing dir: {}", e)))?;

        let volume = MockVolume {
            capacity_bytes,
            profile,
            backing_path,
            staged_at: None,
            published_at: Vec::new(),
            controller_published: false,
        };
        let response = csi::CreateVolumeResponse {
            volume: Some(volume_message(&request.name, &volume)),
        };
        self.inner
            .volumes
            .lock()
            .unwrap()
            .insert(request.name.clone(), volume);
        debug!(volume_id = %request.name, "csi-mock created volume");
        Ok(Response::new(response))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        let removed = self.inner.volumes.lock().unwrap().remove(&request.volume_id);
        if let Some(volume) = removed {
            let _ = std::fs::remove_dir_all(&volume.backing_path);
            debug!(volume_id = %request.volume_id, "csi-mock deleted volume");
        }
        // Deleting an unknown volume is a success per the CSI spec
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        if !self.inner.publish_unpublish {
            return Err(Status::unimplemented("PUBLISH_UNPUBLISH_VOLUME disabled"));
        }
        let request = request.into_inner();
        let mut volumes = self.inner.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| Status::not_found(format!("no volume {}", request.volume_id)))?;
        volume.controller_published = true;

        let mut publish_context = HashMap::new();
        publish_context.insert(
            "device".to_string(),
            format!("/dev/mock/{}", request.volume_id),
        );
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        if !self.inner.publish_unpublish {
            return Err(Status::unimplemented("PUBLISH_UNPUBLISH_VOLUME disabled"));
        }
        let request = request.into_inner();
        if let Some(volume) = self.inner.volumes.lock().unwrap().get_mut(&request.volume_id) {
            volume.controller_published = false;
        }
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        if !self.inner.volumes.lock().unwrap().contains_key(&request.volume_id) {
            return Err(Status::not_found(format!("no volume {}", request.volume_id)));
        }
        // Every mount/block capability is acceptable to the mock
        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: request.volume_context,
                volume_capabilities: request.volume_capabilities,
                parameters: request.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let volumes = self.inner.volumes.lock().unwrap();
        let entries = volumes
            .iter()
            .map(|(id, volume)| csi::list_volumes_response::Entry {
                volume: Some(volume_message(id, volume)),
                status: None,
            })
            .collect();
        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let request = request.into_inner();
        let profile = request
            .parameters
            .get("profile")
            .cloned()
            .unwrap_or_default();
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: self.available_bytes(&profile),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let mut rpcs = vec![
            csi::controller_service_capability::rpc::Type::CreateDeleteVolume,
            csi::controller_service_capability::rpc::Type::ListVolumes,
            csi::controller_service_capability::rpc::Type::GetCapacity,
        ];
        if self.inner.publish_unpublish {
            rpcs.push(csi::controller_service_capability::rpc::Type::PublishUnpublishVolume);
        }
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|rpc| csi::ControllerServiceCapability {
                    r#type: Some(csi::controller_service_capability::Type::Rpc(
                        csi::controller_service_capability::Rpc { r#type: rpc as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }
}

#[tonic::async_trait]
impl Node for MockCsiPlugin {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        if !self.inner.stage_unstage {
            return Err(Status::unimplemented("STAGE_UNSTAGE_VOLUME disabled"));
        }
        let request = request.into_inner();
        let staging = PathBuf::from(&request.staging_target_path);

        let mut volumes = self.inner.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| Status::not_found(format!("no volume {}", request.volume_id)))?;
        attach(&staging, &volume.backing_path)?;
        volume.staged_at = Some(staging);
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        if !self.inner.stage_unstage {
            return Err(Status::unimplemented("STAGE_UNSTAGE_VOLUME disabled"));
        }
        let request = request.into_inner();
        detach(Path::new(&request.staging_target_path))?;
        if let Some(volume) = self.inner.volumes.lock().unwrap().get_mut(&request.volume_id) {
            volume.staged_at = None;
        }
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        let target = PathBuf::from(&request.target_path);

        let mut volumes = self.inner.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| Status::not_found(format!("no volume {}", request.volume_id)))?;
        attach(&target, &volume.backing_path)?;
        if !volume.published_at.contains(&target) {
            volume.published_at.push(target);
        }
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        let target = PathBuf::from(&request.target_path);
        detach(&target)?;
        if let Some(volume) = self.inner.volumes.lock().unwrap().get_mut(&request.volume_id) {
            volume.published_at.retain(|p| *p != target);
        }
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("volume stats are not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let mut capabilities = Vec::new();
        if self.inner.stage_unstage {
            capabilities.push(csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            });
        }
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.inner.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

fn volume_message(volume_id: &str, volume: &MockVolume) -> csi::Volume {
    let mut volume_context = HashMap::new();
    volume_context.insert(
        "path".to_string(),
        volume.backing_path.to_string_lossy().into_owned(),
    );
    csi::Volume {
        capacity_bytes: volume.capacity_bytes,
        volume_id: volume_id.to_string(),
        volume_context,
        content_source: None,
        accessible_topology: Vec::new(),
    }
}
