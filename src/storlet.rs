use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use storage_provider::api::ContentType;
use storage_provider::config::{Config, PluginConfig, ProfileConfig, ServerConfig};
use storage_provider::manager::{self, ResourceProviderManager, ResourceProviderMessage};
use storage_provider::plugin::PluginSupervisor;
use storage_provider::profile::UriProfileAdaptor;
use storage_provider::provider::{ProviderOptions, StorageLocalResourceProvider};
use storage_provider::registrar::Registrar;
use structopt::StructOpt;
use tracing::{debug, info};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "storlet",
    about = "A per-node storage resource provider daemon backed by a CSI plugin"
)]
struct Opts {
    /// Directory holding all provider and CSI state
    #[structopt(long, default_value = "/var/lib/storlet")]
    work_dir: PathBuf,

    /// Address the manager endpoint listens on
    #[structopt(long, short = "a", default_value = "127.0.0.1")]
    addr: IpAddr,

    /// Port the manager endpoint listens on
    #[structopt(long, short = "p", default_value = "5051")]
    port: u16,

    /// Resource provider name within its type
    #[structopt(long, default_value = "local")]
    provider_name: String,

    /// CSI plugin name
    #[structopt(long, default_value = "local")]
    plugin_name: String,

    /// Command used to launch the CSI plugin process
    #[structopt(long, default_value = "csi-mock-plugin")]
    plugin_command: String,

    /// Arguments for the CSI plugin process
    #[structopt(long)]
    plugin_arg: Vec<String>,

    /// URI of the disk profile catalog (file:// or http(s)://)
    #[structopt(long, default_value = "file:///etc/storlet/profiles.json")]
    profile_catalog: String,

    /// Seconds between profile catalog polls
    #[structopt(long, default_value = "60")]
    profile_poll_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let opts = Opts::from_args();
    let mut config = Config::default_config()?;
    config.work_dir = opts.work_dir;
    config.server_config = ServerConfig {
        addr: opts.addr,
        port: opts.port,
    };
    config.provider_name = opts.provider_name;
    config.plugin = PluginConfig {
        plugin_type: config.plugin.plugin_type,
        plugin_name: opts.plugin_name,
        command: opts.plugin_command,
        args: opts.plugin_arg,
    };
    config.profiles = ProfileConfig {
        catalog_uri: opts.profile_catalog,
        poll_interval: Duration::from_secs(opts.profile_poll_seconds),
    };

    storage_provider::prepare_work_dir(&config.work_dir).await?;

    // Agent side: the registrar-backed manager endpoint
    let registrar = Arc::new(Registrar::recover(&config.work_dir).await?);
    let (manager, mut messages) = ResourceProviderManager::new(registrar);
    let listen_addr = config.server_config.socket_addr();
    tokio::spawn(manager::serve(manager, listen_addr));
    info!(%listen_addr, "Resource provider manager listening");

    // Provider side: plugin supervision and the provider actor
    let info = config.provider_info();
    let container = info
        .storage
        .as_ref()
        .and_then(|s| s.containers.first())
        .expect("provider_info always describes one plugin container")
        .clone();
    let supervisor = PluginSupervisor::start(
        &config.work_dir,
        &config.plugin.plugin_type,
        &config.plugin.plugin_name,
        &container,
    )
    .await?;

    let provider = StorageLocalResourceProvider::start(ProviderOptions {
        work_dir: config.work_dir.clone(),
        endpoint: format!("http://{}/api/v1/resource_provider", listen_addr),
        info,
        adaptor: Arc::new(UriProfileAdaptor::new(config.profiles.catalog_uri.clone())),
        poll_interval: config.profiles.poll_interval,
        content_type: ContentType::Protobuf,
        client_watch: supervisor.client_watch(),
        boot_id: storage_provider::host_boot_id().await,
    })
    .await?;

    // In a full agent the manager's messages feed resource offers; the
    // standalone daemon just surfaces them in the log
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            match message {
                ResourceProviderMessage::UpdateState {
                    provider_id,
                    update,
                } => {
                    info!(
                        provider_id = %provider_id,
                        resources = update.resources.len(),
                        resource_version = %update.resource_version_uuid,
                        "Provider state updated"
                    );
                }
                other => debug!(?other, "Resource provider message"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!(
        provider_id = ?provider.provider_id().await,
        plugin_terminations = supervisor.terminations(),
        "Shutting down"
    );
    Ok(())
}
