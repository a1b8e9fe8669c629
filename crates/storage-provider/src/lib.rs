//! A per-node storage resource provider. The crate wires a cluster agent's
//! resource provider manager to a CSI plugin: capacity is discovered and
//! offered as storage pools, disks are created, published onto the node,
//! and destroyed through a checkpointed volume state machine, and every
//! operation outcome travels back over a reliable status-update stream.
//!
//! The major pieces, leaves first:
//!
//! - [`plugin::PluginSupervisor`] keeps the CSI plugin process alive and
//!   hands out ready clients.
//! - [`profile`] maps disk profile names to CSI volume capabilities.
//! - [`volume::VolumeManager`] owns the per-volume state machine.
//! - [`provider::StorageLocalResourceProvider`] applies operations and
//!   reports statuses.
//! - [`status::StatusUpdateManager`] delivers statuses at-least-once.
//! - [`manager::ResourceProviderManager`] is the agent-side endpoint the
//!   provider subscribes to.
//! - [`registrar::Registrar`] persistently admits provider identities.

pub mod api;
pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod csi;
pub mod fs_watch;
pub mod manager;
pub mod paths;
pub mod plugin;
pub mod profile;
pub mod provider;
pub mod recordio;
pub mod registrar;
pub mod status;
pub mod volume;

use std::path::Path;

/// The host's boot identifier, used to detect reboots during volume state
/// recovery. Falls back to a constant when the platform does not expose one.
pub async fn host_boot_id() -> String {
    match tokio::fs::read_to_string("/proc/sys/kernel/random/boot_id").await {
        Ok(boot_id) => boot_id.trim().to_string(),
        Err(_) => "unknown-boot".to_string(),
    }
}

/// Ensures the work directory exists and is usable before anything
/// checkpoints into it.
pub async fn prepare_work_dir(work_dir: impl AsRef<Path>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(work_dir.as_ref()).await?;
    Ok(())
}
