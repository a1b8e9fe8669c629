//! The plugin supervisor keeps the CSI plugin process alive. Each start
//! waits for the plugin's endpoint socket to appear, probes it, and then
//! publishes a ready [`CsiClient`] on a watch channel. When the process
//! exits the client is withdrawn, so callers block until the next start
//! completes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::PluginContainer;
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::checkpoint;
use crate::csi::CsiClient;
use crate::fs_watch::FileSystemWatcher;
use crate::paths;

/// How long a freshly launched plugin gets to create its endpoint socket.
const SOCKET_WAIT: Duration = Duration::from_secs(60);

/// Receiver side of the supervisor's client channel. `None` while the plugin
/// is down or restarting.
pub type ClientWatch = watch::Receiver<Option<CsiClient>>;

/// Waits until the supervisor publishes a ready client.
pub async fn wait_for_client(client_watch: &mut ClientWatch) -> anyhow::Result<CsiClient> {
    loop {
        {
            let current = client_watch.borrow();
            if let Some(client) = current.as_ref() {
                return Ok(client.clone());
            }
        }
        client_watch
            .changed()
            .await
            .map_err(|_| anyhow::anyhow!("plugin supervisor has stopped"))?;
    }
}

/// Checkpointed launch configuration of the plugin container, so a restarted
/// provider reuses the same container id (and thus the same endpoint path).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ContainerConfig {
    container_id: String,
    command: String,
    args: Vec<String>,
}

pub struct PluginSupervisor {
    client_watch: ClientWatch,
    endpoint_path: PathBuf,
    terminations: Arc<AtomicU64>,
}

impl PluginSupervisor {
    /// Launches the plugin described by `container` and starts the
    /// supervision loop. Returns as soon as the loop is running; use
    /// [`PluginSupervisor::client_watch`] to wait for readiness.
    pub async fn start(
        work_dir: impl Into<PathBuf>,
        plugin_type: &str,
        plugin_name: &str,
        container: &PluginContainer,
    ) -> anyhow::Result<Self> {
        let work_dir = work_dir.into();

        let config = recover_container_config(&work_dir, plugin_type, plugin_name, container).await?;
        let endpoint_path = paths::endpoint_socket_path(
            &work_dir,
            plugin_type,
            plugin_name,
            &config.container_id,
        );

        let (client_tx, client_rx) = watch::channel(None);
        let terminations = Arc::new(AtomicU64::new(0));

        tokio::spawn(supervise(
            config,
            endpoint_path.clone(),
            client_tx,
            terminations.clone(),
        ));

        Ok(PluginSupervisor {
            client_watch: client_rx,
            endpoint_path,
            terminations,
        })
    }

    pub fn client_watch(&self) -> ClientWatch {
        self.client_watch.clone()
    }

    pub fn endpoint_path(&self) -> &PathBuf {
        &self.endpoint_path
    }

    /// Number of times the plugin process has terminated since start.
    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }
}

async fn recover_container_config(
    work_dir: &PathBuf,
    plugin_type: &str,
    plugin_name: &str,
    container: &PluginContainer,
) -> anyhow::Result<ContainerConfig> {
    let containers_dir = paths::csi_dir(work_dir, plugin_type, plugin_name).join("containers");
    tokio::fs::create_dir_all(&containers_dir).await?;

    // Reuse a previously checkpointed container if one exists
    let mut entries = tokio::fs::read_dir(&containers_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let config_path = entry.path().join("config");
        if let Some(config) = checkpoint::recover::<ContainerConfig>(&config_path).await? {
            return Ok(config);
        }
    }

    let config = ContainerConfig {
        container_id: Uuid::new_v4().to_string(),
        command: container.command.clone(),
        args: container.args.clone(),
    };
    let config_path =
        paths::container_dir(work_dir, plugin_type, plugin_name, &config.container_id)
            .join("config");
    checkpoint::checkpoint(&config_path, &config).await?;
    Ok(config)
}

async fn supervise(
    config: ContainerConfig,
    endpoint_path: PathBuf,
    client_tx: watch::Sender<Option<CsiClient>>,
    terminations: Arc<AtomicU64>,
) {
    let mut backoff = ExponentialBackoffStrategy::new(
        Duration::from_secs(1),
        Duration::from_secs(60),
    );

    loop {
        match run_once(&config, &endpoint_path, &client_tx).await {
            Ok(status) => {
                terminations.fetch_add(1, Ordering::SeqCst);
                warn!(
                    container_id = %config.container_id,
                    %status,
                    "CSI plugin terminated, restarting"
                );
                backoff.reset();
            }
            Err(e) => {
                error!(
                    error = %e,
                    container_id = %config.container_id,
                    "CSI plugin failed to come up, backing off before relaunch"
                );
            }
        }

        if client_tx.send(None).is_err() {
            // Nobody is listening anymore; stop supervising
            return;
        }
        backoff.wait().await;
    }
}

/// One supervised run: launch, wait for the socket, probe, publish the
/// client, then block until the process exits.
async fn run_once(
    config: &ContainerConfig,
    endpoint_path: &PathBuf,
    client_tx: &watch::Sender<Option<CsiClient>>,
) -> anyhow::Result<std::process::ExitStatus> {
    let endpoint_dir = endpoint_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("endpoint path has no parent directory"))?
        .to_owned();
    tokio::fs::create_dir_all(&endpoint_dir).await?;
    // A stale socket from a previous run would satisfy the wait below
    // without a live listener behind it
    let _ = tokio::fs::remove_file(endpoint_path).await;

    let mut child = tokio::process::Command::new(&config.command)
        .args(&config.args)
        .env("CSI_ENDPOINT", format!("unix://{}", endpoint_path.display()))
        .kill_on_drop(true)
        .spawn()?;

    info!(
        command = %config.command,
        container_id = %config.container_id,
        "Launched CSI plugin"
    );

    match timeout(SOCKET_WAIT, wait_for_socket(endpoint_path, &endpoint_dir)).await {
        Ok(result) => result?,
        Err(_) => {
            let _ = child.kill().await;
            anyhow::bail!(
                "plugin did not create its endpoint socket within {:?}",
                SOCKET_WAIT
            );
        }
    }

    let client = match CsiClient::connect(endpoint_path).await {
        Ok(client) => client,
        Err(e) => {
            let _ = child.kill().await;
            return Err(e.into());
        }
    };

    // Publish the ready client; calls blocked in wait_for_client resume here
    let _ = client_tx.send(Some(client));

    let status = child.wait().await?;
    Ok(status)
}

async fn wait_for_socket(endpoint_path: &PathBuf, endpoint_dir: &PathBuf) -> anyhow::Result<()> {
    // Set up the watch before the existence check so a creation between the
    // two is not missed
    let mut events = FileSystemWatcher::new(endpoint_dir)?;

    if tokio::fs::metadata(endpoint_path).await.is_ok() {
        return Ok(());
    }

    while let Some(res) = events.next().await {
        match res {
            Ok(event) if event.kind.is_create() => {
                if event.paths.iter().any(|p| p == endpoint_path) {
                    return Ok(());
                }
            }
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "Error watching for plugin endpoint socket");
            }
        }
    }
    anyhow::bail!("endpoint watch ended before the socket appeared")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin;

    /// The supervisor against a fake "plugin": a long sleep as the process,
    /// with the CSI endpoint served in-process by csi-mock.
    #[tokio::test]
    async fn supervisor_publishes_client_when_socket_appears() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");

        let container = PluginContainer {
            services: Vec::new(),
            command: "sleep".to_string(),
            args: vec!["300".to_string()],
        };

        let supervisor = PluginSupervisor::start(
            tempdir.path(),
            "org.storlet.csi.test",
            "test",
            &container,
        )
        .await
        .expect("supervisor should start");

        // Give the "plugin" a moment to be spawned, then serve CSI on the
        // endpoint path ourselves
        tokio::time::sleep(Duration::from_millis(250)).await;
        let endpoint = supervisor.endpoint_path().clone();
        let _server = csi_mock::MockCsiPlugin::builder()
            .capacity_mb("test", 4096)
            .serve(&endpoint)
            .await
            .expect("mock plugin should serve");

        let mut watch = supervisor.client_watch();
        let client = timeout(Duration::from_secs(10), plugin::wait_for_client(&mut watch))
            .await
            .expect("timed out waiting for CSI client")
            .expect("client should become ready");

        assert!(client.capabilities.controller_service);
        assert_eq!(supervisor.terminations(), 0);
    }

    #[tokio::test]
    async fn container_id_is_reused_across_restarts() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let container = PluginContainer {
            services: Vec::new(),
            command: "sleep".to_string(),
            args: vec!["300".to_string()],
        };

        let first = recover_container_config(
            &tempdir.path().to_owned(),
            "org.storlet.csi.test",
            "test",
            &container,
        )
        .await
        .unwrap();
        let second = recover_container_config(
            &tempdir.path().to_owned(),
            "org.storlet.csi.test",
            "test",
            &container,
        )
        .await
        .unwrap();

        assert_eq!(first.container_id, second.container_id);
    }
}
