use std::path::PathBuf;

use csi_mock::MockCsiPlugin;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "csi-mock-plugin",
    about = "An in-memory CSI plugin backed by plain directories"
)]
struct Opts {
    /// Socket path to serve on; falls back to the CSI_ENDPOINT environment
    /// variable (with an optional unix:// scheme)
    #[structopt(long)]
    endpoint: Option<PathBuf>,

    /// Backing capacity as profile=MB, repeatable
    #[structopt(long, number_of_values = 1)]
    capacity: Vec<String>,

    /// Directory to create volume backing directories under
    #[structopt(long)]
    backing_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opts = Opts::from_args();

    let endpoint = match opts.endpoint {
        Some(path) => path,
        None => {
            let raw = std::env::var("CSI_ENDPOINT")
                .map_err(|_| anyhow::anyhow!("either --endpoint or CSI_ENDPOINT is required"))?;
            PathBuf::from(raw.trim_start_matches("unix://"))
        }
    };

    let mut builder = MockCsiPlugin::builder();
    for spec in &opts.capacity {
        let (profile, mb) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("capacity must be profile=MB, got {:?}", spec))?;
        builder = builder.capacity_mb(profile, mb.parse()?);
    }
    if let Some(dir) = opts.backing_dir {
        builder = builder.backing_dir(dir);
    }

    let handle = builder.serve(&endpoint).await?;
    info!(endpoint = %endpoint.display(), "csi-mock-plugin running");

    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    Ok(())
}
