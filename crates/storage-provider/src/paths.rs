//! The provider's on-disk layout under the agent-provided work directory.
//! Everything the provider persists lives under one of these paths:
//!
//! ```text
//! csi/<plugin-type>/<plugin-name>/containers/<container-id>/   container config
//! csi/<plugin-type>/<plugin-name>/containers/<container-id>/endpoint/
//! csi/<plugin-type>/<plugin-name>/mounts/staging/<volume-id>/  CSI staging dir
//! csi/<plugin-type>/<plugin-name>/mounts/target/<volume-id>/   CSI publish dir
//! csi/<plugin-type>/<plugin-name>/volumes/<volume-id>/state    serialized VolumeState
//! resource_providers/<type>/<name>/latest -> <id>              symlink
//! resource_providers/<type>/<name>/<id>/resource_provider_state
//! resource_providers/<type>/<name>/<id>/operations/<uuid>/updates
//! resource_providers/registry                                  registrar state
//! ```

use std::path::{Path, PathBuf};

pub const ENDPOINT_SOCKET_NAME: &str = "endpoint.sock";

pub fn csi_dir(work_dir: &Path, plugin_type: &str, plugin_name: &str) -> PathBuf {
    work_dir.join("csi").join(plugin_type).join(plugin_name)
}

pub fn container_dir(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> PathBuf {
    csi_dir(work_dir, plugin_type, plugin_name)
        .join("containers")
        .join(container_id)
}

pub fn endpoint_dir(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> PathBuf {
    container_dir(work_dir, plugin_type, plugin_name, container_id).join("endpoint")
}

pub fn endpoint_socket_path(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> PathBuf {
    endpoint_dir(work_dir, plugin_type, plugin_name, container_id).join(ENDPOINT_SOCKET_NAME)
}

pub fn mounts_dir(work_dir: &Path, plugin_type: &str, plugin_name: &str) -> PathBuf {
    csi_dir(work_dir, plugin_type, plugin_name).join("mounts")
}

pub fn staging_dir(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    volume_id: &str,
) -> PathBuf {
    mounts_dir(work_dir, plugin_type, plugin_name)
        .join("staging")
        .join(volume_id)
}

pub fn target_dir(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    volume_id: &str,
) -> PathBuf {
    mounts_dir(work_dir, plugin_type, plugin_name)
        .join("target")
        .join(volume_id)
}

pub fn volumes_dir(work_dir: &Path, plugin_type: &str, plugin_name: &str) -> PathBuf {
    csi_dir(work_dir, plugin_type, plugin_name).join("volumes")
}

pub fn volume_state_path(
    work_dir: &Path,
    plugin_type: &str,
    plugin_name: &str,
    volume_id: &str,
) -> PathBuf {
    volumes_dir(work_dir, plugin_type, plugin_name)
        .join(volume_id)
        .join("state")
}

pub fn provider_dir(work_dir: &Path, provider_type: &str, provider_name: &str) -> PathBuf {
    work_dir
        .join("resource_providers")
        .join(provider_type)
        .join(provider_name)
}

pub fn latest_symlink(work_dir: &Path, provider_type: &str, provider_name: &str) -> PathBuf {
    provider_dir(work_dir, provider_type, provider_name).join("latest")
}

pub fn provider_state_path(
    work_dir: &Path,
    provider_type: &str,
    provider_name: &str,
    provider_id: &str,
) -> PathBuf {
    provider_dir(work_dir, provider_type, provider_name)
        .join(provider_id)
        .join("resource_provider_state")
}

pub fn operation_updates_path(
    work_dir: &Path,
    provider_type: &str,
    provider_name: &str,
    provider_id: &str,
    operation_uuid: &str,
) -> PathBuf {
    provider_dir(work_dir, provider_type, provider_name)
        .join(provider_id)
        .join("operations")
        .join(operation_uuid)
        .join("updates")
}

pub fn registry_path(work_dir: &Path) -> PathBuf {
    work_dir.join("resource_providers").join("registry")
}

/// Points the `latest` symlink of a provider at the given id, replacing any
/// previous target atomically (create-then-rename).
pub async fn point_latest_symlink(
    work_dir: &Path,
    provider_type: &str,
    provider_name: &str,
    provider_id: &str,
) -> anyhow::Result<()> {
    let link = latest_symlink(work_dir, provider_type, provider_name);
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = link.with_extension("tmp");
    let _ = tokio::fs::remove_file(&staging).await;
    tokio::fs::symlink(provider_id, &staging).await?;
    tokio::fs::rename(&staging, &link).await?;
    Ok(())
}

/// Resolves the `latest` symlink to a provider id, if one was ever admitted.
pub async fn read_latest_symlink(
    work_dir: &Path,
    provider_type: &str,
    provider_name: &str,
) -> anyhow::Result<Option<String>> {
    let link = latest_symlink(work_dir, provider_type, provider_name);
    match tokio::fs::read_link(&link).await {
        Ok(target) => Ok(Some(target.to_string_lossy().into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_matches_expected_shape() {
        let work_dir = Path::new("/var/lib/storlet");
        assert_eq!(
            volume_state_path(work_dir, "org.example.csi", "local", "vol-1"),
            Path::new("/var/lib/storlet/csi/org.example.csi/local/volumes/vol-1/state")
        );
        assert_eq!(
            operation_updates_path(work_dir, "org.example.rp", "test", "rp-id", "op-1"),
            Path::new(
                "/var/lib/storlet/resource_providers/org.example.rp/test/rp-id/operations/op-1/updates"
            )
        );
    }

    #[tokio::test]
    async fn latest_symlink_round_trip() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");

        assert!(read_latest_symlink(tempdir.path(), "t", "n")
            .await
            .unwrap()
            .is_none());

        point_latest_symlink(tempdir.path(), "t", "n", "id-1")
            .await
            .expect("should create symlink");
        point_latest_symlink(tempdir.path(), "t", "n", "id-2")
            .await
            .expect("should replace symlink");

        assert_eq!(
            read_latest_symlink(tempdir.path(), "t", "n").await.unwrap(),
            Some("id-2".to_string())
        );
    }
}
