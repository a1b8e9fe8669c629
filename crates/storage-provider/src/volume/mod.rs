//! The volume manager owns the per-volume state machine and is the only
//! component that issues volume-mutating CSI calls. Every mutation of a
//! given volume runs inside that volume's FIFO sequence; distinct volumes
//! proceed in parallel.
//!
//! Transitions are checkpointed *before* the corresponding CSI call is
//! issued, so a crash mid-call leaves an intermediate state on disk from
//! which recovery re-issues a safe idempotent continuation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_csi::v1_3_0 as csi;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use tracing::{info, instrument, warn};

use crate::csi::{call_with_retry, CsiClient, CsiError};
use crate::paths;
use crate::plugin::{self, ClientWatch};
use crate::profile::{ProfileInfo, VolumeCapability};
use crate::checkpoint;

const MB: i64 = 1024 * 1024;

/// Where a volume is in its lifecycle. Stable states are the post-condition
/// of a successfully returned CSI call; the others mark a call in flight or
/// interrupted by a crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Created,
    ControllerPublish,
    NodeReady,
    ControllerUnpublish,
    NodeStage,
    VolReady,
    NodeUnstage,
    NodePublish,
    Published,
    NodeUnpublish,
}

impl VolumeState {
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            VolumeState::Created
                | VolumeState::NodeReady
                | VolumeState::VolReady
                | VolumeState::Published
        )
    }

    /// States that imply a live node-level mount, which a reboot destroys.
    fn is_node_level(&self) -> bool {
        matches!(
            self,
            VolumeState::VolReady
                | VolumeState::Published
                | VolumeState::NodeStage
                | VolumeState::NodeUnstage
                | VolumeState::NodePublish
                | VolumeState::NodeUnpublish
        )
    }
}

/// The per-volume record persisted at `csi/<plugin>/volumes/<id>/state`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub state: VolumeState,
    pub capability: VolumeCapability,
    pub parameters: HashMap<String, String>,
    /// Attributes the plugin returned at creation time.
    pub volume_context: HashMap<String, String>,
    /// Returned by ControllerPublish; required by NodeStage/NodePublish.
    pub publish_context: HashMap<String, String>,
    /// System boot identifier at the last stage/publish.
    pub boot_id: String,
    /// Sticky flag: a task has mounted this volume at some point, so
    /// recovery should drive it back to published rather than unwind it.
    pub node_publish_required: bool,
}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("unknown volume {0}")]
    UnknownVolume(String),
    #[error(transparent)]
    Csi(#[from] CsiError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct VolumeEntry {
    /// Holding this lock *is* the volume's sequence.
    record: Mutex<VolumeRecord>,
}

pub struct VolumeManager {
    work_dir: PathBuf,
    plugin_type: String,
    plugin_name: String,
    boot_id: String,
    client_watch: ClientWatch,
    volumes: RwLock<HashMap<String, Arc<VolumeEntry>>>,
}

impl VolumeManager {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        plugin_type: &str,
        plugin_name: &str,
        boot_id: &str,
        client_watch: ClientWatch,
    ) -> Self {
        VolumeManager {
            work_dir: work_dir.into(),
            plugin_type: plugin_type.to_string(),
            plugin_name: plugin_name.to_string(),
            boot_id: boot_id.to_string(),
            client_watch,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    async fn client(&self) -> anyhow::Result<CsiClient> {
        let mut watch = self.client_watch.clone();
        plugin::wait_for_client(&mut watch).await
    }

    fn state_path(&self, volume_id: &str) -> PathBuf {
        paths::volume_state_path(&self.work_dir, &self.plugin_type, &self.plugin_name, volume_id)
    }

    fn staging_path(&self, volume_id: &str) -> PathBuf {
        paths::staging_dir(&self.work_dir, &self.plugin_type, &self.plugin_name, volume_id)
    }

    fn target_path(&self, volume_id: &str) -> PathBuf {
        paths::target_dir(&self.work_dir, &self.plugin_type, &self.plugin_name, volume_id)
    }

    async fn checkpoint(&self, volume_id: &str, record: &VolumeRecord) -> anyhow::Result<()> {
        checkpoint::checkpoint(self.state_path(volume_id), record).await
    }

    async fn entry(&self, volume_id: &str) -> Result<Arc<VolumeEntry>, VolumeError> {
        self.volumes
            .read()
            .await
            .get(volume_id)
            .cloned()
            .ok_or_else(|| VolumeError::UnknownVolume(volume_id.to_string()))
    }

    /// Loads every persisted volume, applies the reboot rule, and drives
    /// interrupted transitions back to a stable state.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let volumes_dir = paths::volumes_dir(&self.work_dir, &self.plugin_type, &self.plugin_name);
        tokio::fs::create_dir_all(&volumes_dir).await?;

        let dirs: Vec<PathBuf> = ReadDirStream::new(tokio::fs::read_dir(&volumes_dir).await?)
            .map(|res| res.map(|entry| entry.path()))
            .collect::<Result<Vec<PathBuf>, _>>()
            .await?;

        for dir in dirs {
            let volume_id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut record: VolumeRecord =
                match checkpoint::recover(self.state_path(&volume_id)).await? {
                    Some(record) => record,
                    None => {
                        warn!(volume_id = %volume_id, "Volume directory without a state record, skipping");
                        continue;
                    }
                };

            // Reboot rule: node-level mounts did not survive, so anything at
            // or between the node transitions falls back to NODE_READY
            if record.boot_id != self.boot_id && record.state.is_node_level() {
                info!(
                    volume_id = %volume_id,
                    from = ?record.state,
                    "Demoting volume after reboot"
                );
                record.state = VolumeState::NodeReady;
                record.boot_id = self.boot_id.clone();
                self.checkpoint(&volume_id, &record).await?;
            }

            self.volumes.write().await.insert(
                volume_id.clone(),
                Arc::new(VolumeEntry {
                    record: Mutex::new(record),
                }),
            );
        }

        // Re-issue interrupted transitions. Each continuation runs in the
        // volume's own sequence, so recovery of distinct volumes overlaps.
        let ids: Vec<String> = self.volumes.read().await.keys().cloned().collect();
        for volume_id in ids {
            if let Err(e) = self.settle(&volume_id).await {
                warn!(volume_id = %volume_id, error = %e, "Unable to settle volume during recovery");
            }
        }
        Ok(())
    }

    /// Completes whatever transition a volume was left in, bringing it to a
    /// stable state.
    async fn settle(&self, volume_id: &str) -> Result<(), VolumeError> {
        let entry = self.entry(volume_id).await?;
        let mut record = entry.record.lock().await;
        self.continue_transition(volume_id, &mut record).await
    }

    async fn continue_transition(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        loop {
            match record.state {
                VolumeState::ControllerPublish => {
                    self.do_controller_publish(volume_id, record).await?
                }
                VolumeState::ControllerUnpublish => {
                    self.do_controller_unpublish(volume_id, record).await?
                }
                VolumeState::NodeStage => self.do_node_stage(volume_id, record).await?,
                VolumeState::NodeUnstage => self.do_node_unstage(volume_id, record).await?,
                VolumeState::NodePublish => {
                    // An aborted publish is only worth finishing when some
                    // task still expects the mount
                    if record.node_publish_required {
                        self.do_node_publish(volume_id, record).await?
                    } else {
                        record.state = VolumeState::NodeUnpublish;
                        self.checkpoint(volume_id, record).await?;
                    }
                }
                VolumeState::NodeUnpublish => self.do_node_unpublish(volume_id, record).await?,
                _ => return Ok(()),
            }
        }
    }

    /// The set of volume ids with persisted state.
    pub async fn volume_ids(&self) -> Vec<String> {
        self.volumes.read().await.keys().cloned().collect()
    }

    pub async fn record(&self, volume_id: &str) -> Option<VolumeRecord> {
        let entry = self.volumes.read().await.get(volume_id).cloned()?;
        let record = entry.record.lock().await;
        Some(record.clone())
    }

    /// Where a published volume is exposed to tasks.
    pub fn published_path(&self, volume_id: &str) -> PathBuf {
        self.target_path(volume_id)
    }

    /// The mount root all MOUNT volumes of this plugin live under.
    pub fn mount_root(&self) -> PathBuf {
        paths::mounts_dir(&self.work_dir, &self.plugin_type, &self.plugin_name).join("target")
    }

    /// Provisions a new volume via CSI `CreateVolume` and records it in
    /// state `CREATED`. Returns the volume id and context reported by the
    /// plugin.
    #[instrument(level = "info", skip(self, profile_info))]
    pub async fn create_volume(
        &self,
        name: &str,
        capacity_mb: u64,
        profile_info: &ProfileInfo,
    ) -> Result<(String, HashMap<String, String>), VolumeError> {
        let client = self.client().await?;

        let request = csi::CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: capacity_mb as i64 * MB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![profile_info.capability.to_csi()],
            parameters: profile_info.parameters.clone().into_iter().collect(),
            secrets: Default::default(),
            volume_content_source: None,
            accessibility_requirements: None,
        };

        let response = call_with_retry("CreateVolume", || {
            let mut controller = client.controller();
            let request = request.clone();
            async move {
                controller
                    .create_volume(request)
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;

        let volume = response
            .volume
            .ok_or_else(|| anyhow::anyhow!("CreateVolume response carried no volume"))?;

        self.adopt(
            &volume.volume_id,
            profile_info,
            volume.volume_context.clone().into_iter().collect(),
        )
        .await?;
        Ok((volume.volume_id, volume.volume_context.into_iter().collect()))
    }

    /// Validates a pre-existing volume against a profile and records it in
    /// state `CREATED` (the import path of CreateDisk).
    #[instrument(level = "info", skip(self, profile_info))]
    pub async fn validate_volume(
        &self,
        volume_id: &str,
        profile_info: &ProfileInfo,
    ) -> Result<(), VolumeError> {
        let client = self.client().await?;

        let request = csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume_id.to_string(),
            volume_context: Default::default(),
            volume_capabilities: vec![profile_info.capability.to_csi()],
            parameters: profile_info.parameters.clone().into_iter().collect(),
            secrets: Default::default(),
        };

        let response = call_with_retry("ValidateVolumeCapabilities", || {
            let mut controller = client.controller();
            let request = request.clone();
            async move {
                controller
                    .validate_volume_capabilities(request)
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;

        if response.confirmed.is_none() {
            return Err(VolumeError::Other(anyhow::anyhow!(
                "volume {} does not support the requested capability: {}",
                volume_id,
                response.message
            )));
        }

        self.adopt(volume_id, profile_info, Default::default()).await
    }

    async fn adopt(
        &self,
        volume_id: &str,
        profile_info: &ProfileInfo,
        volume_context: HashMap<String, String>,
    ) -> Result<(), VolumeError> {
        let mut volumes = self.volumes.write().await;
        if volumes.contains_key(volume_id) {
            // Idempotent retry of a create we already know about
            return Ok(());
        }

        let record = VolumeRecord {
            state: VolumeState::Created,
            capability: profile_info.capability.clone(),
            parameters: profile_info.parameters.clone(),
            volume_context,
            publish_context: HashMap::new(),
            boot_id: self.boot_id.clone(),
            node_publish_required: false,
        };
        self.checkpoint(volume_id, &record).await?;
        volumes.insert(
            volume_id.to_string(),
            Arc::new(VolumeEntry {
                record: Mutex::new(record),
            }),
        );
        Ok(())
    }

    /// Drives a volume forward to `PUBLISHED`, returning the path tasks can
    /// use. A volume already published is a no-op.
    #[instrument(level = "info", skip(self))]
    pub async fn publish_volume(&self, volume_id: &str) -> Result<PathBuf, VolumeError> {
        let entry = self.entry(volume_id).await?;
        let mut record = entry.record.lock().await;

        self.continue_transition(volume_id, &mut record).await?;
        loop {
            match record.state {
                VolumeState::Created => self.do_controller_publish(volume_id, &mut record).await?,
                VolumeState::NodeReady => self.do_node_stage(volume_id, &mut record).await?,
                VolumeState::VolReady => self.do_node_publish(volume_id, &mut record).await?,
                VolumeState::Published => return Ok(self.target_path(volume_id)),
                state => {
                    return Err(VolumeError::Other(anyhow::anyhow!(
                        "volume {} in unexpected state {:?} while publishing",
                        volume_id,
                        state
                    )))
                }
            }
        }
    }

    /// Unwinds a volume back to `NODE_READY`, releasing its node mounts.
    #[instrument(level = "info", skip(self))]
    pub async fn unpublish_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        let entry = self.entry(volume_id).await?;
        let mut record = entry.record.lock().await;

        self.continue_transition(volume_id, &mut record).await?;
        loop {
            match record.state {
                VolumeState::Published => self.do_node_unpublish(volume_id, &mut record).await?,
                VolumeState::VolReady => self.do_node_unstage(volume_id, &mut record).await?,
                VolumeState::NodeReady | VolumeState::Created => return Ok(()),
                state => {
                    return Err(VolumeError::Other(anyhow::anyhow!(
                        "volume {} in unexpected state {:?} while unpublishing",
                        volume_id,
                        state
                    )))
                }
            }
        }
    }

    /// Fully unwinds and deletes a volume: node unpublish/unstage,
    /// controller unpublish, then `DeleteVolume` where the plugin supports
    /// it. The on-disk record is removed last.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        let entry = match self.entry(volume_id).await {
            Ok(entry) => entry,
            // Repeating a destroy on a vanished volume is a no-op
            Err(VolumeError::UnknownVolume(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut record = entry.record.lock().await;

        self.continue_transition(volume_id, &mut record).await?;
        loop {
            match record.state {
                VolumeState::Published => self.do_node_unpublish(volume_id, &mut record).await?,
                VolumeState::VolReady => self.do_node_unstage(volume_id, &mut record).await?,
                VolumeState::NodeReady => {
                    self.do_controller_unpublish(volume_id, &mut record).await?
                }
                VolumeState::Created => break,
                state => {
                    return Err(VolumeError::Other(anyhow::anyhow!(
                        "volume {} in unexpected state {:?} while deleting",
                        volume_id,
                        state
                    )))
                }
            }
        }

        let client = self.client().await?;
        if client.capabilities.create_delete_volume {
            let request = csi::DeleteVolumeRequest {
                volume_id: volume_id.to_string(),
                secrets: Default::default(),
            };
            call_with_retry("DeleteVolume", || {
                let mut controller = client.controller();
                let request = request.clone();
                async move {
                    controller
                        .delete_volume(request)
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
        }

        let state_dir = self
            .state_path(volume_id)
            .parent()
            .map(|p| p.to_owned())
            .expect("volume state path always has a parent");
        tokio::fs::remove_dir_all(&state_dir).await.map_err(|e| {
            VolumeError::Other(anyhow::anyhow!(
                "unable to remove state of volume {}: {}",
                volume_id,
                e
            ))
        })?;
        self.volumes.write().await.remove(volume_id);
        info!(volume_id = %volume_id, "Volume deleted");
        Ok(())
    }

    // Individual transitions. Each writes the intermediate state, performs
    // the (capability-gated) CSI call, then writes the stable state.

    async fn do_controller_publish(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::ControllerPublish;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        if client.capabilities.publish_unpublish_volume {
            let request = csi::ControllerPublishVolumeRequest {
                volume_id: volume_id.to_string(),
                node_id: client.plugin_name.clone(),
                volume_capability: Some(record.capability.to_csi()),
                readonly: false,
                secrets: Default::default(),
                volume_context: record.volume_context.clone().into_iter().collect(),
            };
            let response = call_with_retry("ControllerPublishVolume", || {
                let mut controller = client.controller();
                let request = request.clone();
                async move {
                    controller
                        .controller_publish_volume(request)
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
            record.publish_context = response.publish_context.into_iter().collect();
        }

        record.state = VolumeState::NodeReady;
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }

    async fn do_controller_unpublish(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::ControllerUnpublish;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        if client.capabilities.publish_unpublish_volume {
            let request = csi::ControllerUnpublishVolumeRequest {
                volume_id: volume_id.to_string(),
                node_id: client.plugin_name.clone(),
                secrets: Default::default(),
            };
            call_with_retry("ControllerUnpublishVolume", || {
                let mut controller = client.controller();
                let request = request.clone();
                async move {
                    controller
                        .controller_unpublish_volume(request)
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
            record.publish_context.clear();
        }

        record.state = VolumeState::Created;
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }

    async fn do_node_stage(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::NodeStage;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        if client.capabilities.stage_unstage_volume {
            let staging = self.staging_path(volume_id);
            tokio::fs::create_dir_all(&staging)
                .await
                .map_err(anyhow::Error::from)?;

            let request = csi::NodeStageVolumeRequest {
                volume_id: volume_id.to_string(),
                publish_context: record.publish_context.clone().into_iter().collect(),
                staging_target_path: staging.to_string_lossy().into_owned(),
                volume_capability: Some(record.capability.to_csi()),
                secrets: Default::default(),
                volume_context: record.volume_context.clone().into_iter().collect(),
            };
            call_with_retry("NodeStageVolume", || {
                let mut node = client.node();
                let request = request.clone();
                async move { node.node_stage_volume(request).await.map(|r| r.into_inner()) }
            })
            .await?;
        }

        record.state = VolumeState::VolReady;
        record.boot_id = self.boot_id.clone();
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }

    async fn do_node_unstage(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::NodeUnstage;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        if client.capabilities.stage_unstage_volume {
            let staging = self.staging_path(volume_id);
            let request = csi::NodeUnstageVolumeRequest {
                volume_id: volume_id.to_string(),
                staging_target_path: staging.to_string_lossy().into_owned(),
            };
            call_with_retry("NodeUnstageVolume", || {
                let mut node = client.node();
                let request = request.clone();
                async move {
                    node.node_unstage_volume(request)
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }

        record.state = VolumeState::NodeReady;
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }

    async fn do_node_publish(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::NodePublish;
        record.node_publish_required = true;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        let target = self.target_path(volume_id);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(anyhow::Error::from)?;

        let staging_target_path = if client.capabilities.stage_unstage_volume {
            self.staging_path(volume_id).to_string_lossy().into_owned()
        } else {
            String::new()
        };

        let request = csi::NodePublishVolumeRequest {
            volume_id: volume_id.to_string(),
            publish_context: record.publish_context.clone().into_iter().collect(),
            staging_target_path,
            target_path: target.to_string_lossy().into_owned(),
            volume_capability: Some(record.capability.to_csi()),
            readonly: false,
            secrets: Default::default(),
            volume_context: record.volume_context.clone().into_iter().collect(),
        };
        call_with_retry("NodePublishVolume", || {
            let mut node = client.node();
            let request = request.clone();
            async move {
                node.node_publish_volume(request)
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;

        record.state = VolumeState::Published;
        record.boot_id = self.boot_id.clone();
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }

    async fn do_node_unpublish(
        &self,
        volume_id: &str,
        record: &mut VolumeRecord,
    ) -> Result<(), VolumeError> {
        record.state = VolumeState::NodeUnpublish;
        self.checkpoint(volume_id, record).await?;

        let client = self.client().await?;
        let target = self.target_path(volume_id);
        let request = csi::NodeUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            target_path: target.to_string_lossy().into_owned(),
        };
        call_with_retry("NodeUnpublishVolume", || {
            let mut node = client.node();
            let request = request.clone();
            async move {
                node.node_unpublish_volume(request)
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;
        let _ = tokio::fs::remove_dir_all(&target).await;

        record.state = VolumeState::VolReady;
        record.node_publish_required = false;
        self.checkpoint(volume_id, record).await?;
        Ok(())
    }
}
