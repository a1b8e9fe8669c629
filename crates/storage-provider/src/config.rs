//! Daemon configuration. This can be assembled manually in code or, for the
//! CLI binary, from flags. Defaults mirror a single-plugin local storage
//! setup.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::api::{PluginContainer, PluginService, ResourceProviderInfo, StoragePluginInfo};

const DEFAULT_PORT: u16 = 5051;

/// Everything the daemon needs to run: where the manager listens, where the
/// provider persists state, and how to launch the CSI plugin.
#[derive(Clone, Debug)]
pub struct Config {
    /// Work directory holding all provider and CSI state (spec layout under
    /// `csi/` and `resource_providers/`).
    pub work_dir: PathBuf,
    pub server_config: ServerConfig,
    /// Dotted reverse-DNS resource provider type.
    pub provider_type: String,
    /// Identifier within the provider type.
    pub provider_name: String,
    pub plugin: PluginConfig,
    /// Where the disk profile catalog lives and how often to poll it.
    pub profiles: ProfileConfig,
    /// Role stamped onto new storage pools.
    pub default_role: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: IpAddr,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct PluginConfig {
    pub plugin_type: String,
    pub plugin_name: String,
    /// Command used to launch the plugin process. The endpoint socket path is
    /// passed in `CSI_ENDPOINT`.
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ProfileConfig {
    /// URI of the profile catalog; `file://` and `http(s)://` are accepted.
    pub catalog_uri: String,
    pub poll_interval: Duration,
}

impl Config {
    /// Returns a Config with all of the defaults set. Useful for cases when
    /// you don't want to set most of the values yourself.
    pub fn default_config() -> anyhow::Result<Self> {
        Ok(Config {
            work_dir: default_work_dir()?,
            server_config: ServerConfig {
                addr: "127.0.0.1".parse().unwrap(),
                port: DEFAULT_PORT,
            },
            provider_type: "org.storlet.rp.local.storage".to_string(),
            provider_name: "local".to_string(),
            plugin: PluginConfig {
                plugin_type: "org.storlet.csi.local".to_string(),
                plugin_name: "local".to_string(),
                command: "csi-mock-plugin".to_string(),
                args: Vec::new(),
            },
            profiles: ProfileConfig {
                catalog_uri: "file:///etc/storlet/profiles.json".to_string(),
                poll_interval: Duration::from_secs(60),
            },
            default_role: None,
        })
    }

    /// The provider identity submitted on SUBSCRIBE. The id field is left
    /// empty; the registrar assigns one on first admission.
    pub fn provider_info(&self) -> ResourceProviderInfo {
        ResourceProviderInfo {
            r#type: self.provider_type.clone(),
            name: self.provider_name.clone(),
            id: None,
            storage: Some(StoragePluginInfo {
                plugin_type: self.plugin.plugin_type.clone(),
                plugin_name: self.plugin.plugin_name.clone(),
                containers: vec![PluginContainer {
                    services: vec![
                        PluginService::ControllerService as i32,
                        PluginService::NodeService as i32,
                    ],
                    command: self.plugin.command.clone(),
                    args: self.plugin.args.clone(),
                }],
            }),
            default_reservations: Vec::new(),
        }
    }
}

fn default_work_dir() -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from("/var/lib/storlet"))
}
