//! CSI client plumbing: a UNIX-socket tonic channel, plugin capability
//! discovery, and the retry loop every CSI call goes through.
//!
//! Transport-level unavailability is retried with capped exponential
//! backoff; anything the plugin itself rejects is surfaced to the caller
//! unchanged.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_csi::v1_3_0::controller_client::ControllerClient;
use k8s_csi::v1_3_0::controller_service_capability::{
    rpc::Type as ControllerRpc, Type as ControllerCapabilityType,
};
use k8s_csi::v1_3_0::identity_client::IdentityClient;
use k8s_csi::v1_3_0::node_client::NodeClient;
use k8s_csi::v1_3_0::node_service_capability::{
    rpc::Type as NodeRpc, Type as NodeCapabilityType,
};
use k8s_csi::v1_3_0::plugin_capability::{service::Type as PluginServiceType, Type as PluginCapabilityType};
use k8s_csi::v1_3_0::{
    ControllerGetCapabilitiesRequest, GetPluginCapabilitiesRequest, GetPluginInfoRequest,
    NodeGetCapabilitiesRequest, ProbeRequest,
};
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(300);

/// Errors produced by CSI calls after retry classification.
#[derive(Error, Debug)]
pub enum CsiError {
    /// The plugin reported a terminal status for the call.
    #[error("CSI {call} call failed: {status}")]
    Call {
        call: &'static str,
        status: tonic::Status,
    },
    /// Connecting to the plugin endpoint failed.
    #[error("unable to connect to CSI endpoint: {0}")]
    Connect(#[from] tonic::transport::Error),
}

/// Returns a new UNIX socket channel suitable for use with tonic generated
/// gRPC clients. Instead of using `YourClient::connect`, pass the returned
/// channel to `YourClient::new`.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    // Get an owned copy of the path so we can use it in the FnMut closure
    let p = path.as_ref().to_owned();

    // This is a dummy http endpoint needed for the Endpoint constructors, it
    // is ignored by the connector
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            // Connect to a Uds socket
            UnixStream::connect(p.clone())
        }))
        .await
}

/// The subset of plugin capabilities the provider branches on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PluginCapabilities {
    pub controller_service: bool,
    pub create_delete_volume: bool,
    pub publish_unpublish_volume: bool,
    pub list_volumes: bool,
    pub get_capacity: bool,
    pub stage_unstage_volume: bool,
}

/// A connected, probed CSI plugin endpoint. Cheap to clone; all clones share
/// one HTTP/2 channel.
#[derive(Clone, Debug)]
pub struct CsiClient {
    channel: Channel,
    pub plugin_name: String,
    pub capabilities: PluginCapabilities,
}

impl CsiClient {
    /// Connects to the endpoint socket, issues a one-shot PROBE to validate
    /// it, and resolves the plugin's capability set.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, CsiError> {
        let channel = socket_channel(path).await?;

        let identity = IdentityClient::new(channel.clone());
        call_with_retry("Probe", || {
            let mut client = identity.clone();
            async move { client.probe(ProbeRequest {}).await.map(|r| r.into_inner()) }
        })
        .await?;

        let info = call_with_retry("GetPluginInfo", || {
            let mut client = identity.clone();
            async move {
                client
                    .get_plugin_info(GetPluginInfoRequest {})
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;

        let plugin_capabilities = call_with_retry("GetPluginCapabilities", || {
            let mut client = identity.clone();
            async move {
                client
                    .get_plugin_capabilities(GetPluginCapabilitiesRequest {})
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;

        let mut capabilities = PluginCapabilities::default();
        for capability in plugin_capabilities.capabilities {
            if let Some(PluginCapabilityType::Service(service)) = capability.r#type {
                if service.r#type == PluginServiceType::ControllerService as i32 {
                    capabilities.controller_service = true;
                }
            }
        }

        if capabilities.controller_service {
            let response = call_with_retry("ControllerGetCapabilities", || {
                let mut client = ControllerClient::new(channel.clone());
                async move {
                    client
                        .controller_get_capabilities(ControllerGetCapabilitiesRequest {})
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
            for capability in response.capabilities {
                if let Some(ControllerCapabilityType::Rpc(rpc)) = capability.r#type {
                    if rpc.r#type == ControllerRpc::CreateDeleteVolume as i32 {
                        capabilities.create_delete_volume = true;
                    } else if rpc.r#type == ControllerRpc::PublishUnpublishVolume as i32 {
                        capabilities.publish_unpublish_volume = true;
                    } else if rpc.r#type == ControllerRpc::ListVolumes as i32 {
                        capabilities.list_volumes = true;
                    } else if rpc.r#type == ControllerRpc::GetCapacity as i32 {
                        capabilities.get_capacity = true;
                    }
                }
            }
        }

        let response = call_with_retry("NodeGetCapabilities", || {
            let mut client = NodeClient::new(channel.clone());
            async move {
                client
                    .node_get_capabilities(NodeGetCapabilitiesRequest {})
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await?;
        for capability in response.capabilities {
            if let Some(NodeCapabilityType::Rpc(rpc)) = capability.r#type {
                if rpc.r#type == NodeRpc::StageUnstageVolume as i32 {
                    capabilities.stage_unstage_volume = true;
                }
            }
        }

        debug!(plugin = %info.name, ?capabilities, "Connected to CSI plugin");

        Ok(CsiClient {
            channel,
            plugin_name: info.name,
            capabilities,
        })
    }

    pub fn identity(&self) -> IdentityClient<Channel> {
        IdentityClient::new(self.channel.clone())
    }

    pub fn controller(&self) -> ControllerClient<Channel> {
        ControllerClient::new(self.channel.clone())
    }

    pub fn node(&self) -> NodeClient<Channel> {
        NodeClient::new(self.channel.clone())
    }
}

/// Whether a gRPC status is a transport-level condition worth retrying.
/// Everything else is treated as the plugin's verdict on the call.
pub fn is_retryable(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
    )
}

/// Issues a CSI call, retrying transport-level failures with capped
/// exponential backoff. Dropping the returned future interrupts the loop at
/// the next suspension point.
pub async fn call_with_retry<F, Fut, T>(call: &'static str, mut issue: F) -> Result<T, CsiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, tonic::Status>>,
{
    let mut backoff = ExponentialBackoffStrategy::new(RETRY_BASE, RETRY_CAP);
    loop {
        match issue().await {
            Ok(response) => return Ok(response),
            Err(status) if is_retryable(&status) => {
                warn!(
                    call,
                    code = ?status.code(),
                    message = status.message(),
                    "Retryable CSI failure, backing off"
                );
                backoff.wait().await;
            }
            Err(status) => return Err(CsiError::Call { call, status }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_classification() {
        assert!(is_retryable(&tonic::Status::unavailable("down")));
        assert!(is_retryable(&tonic::Status::deadline_exceeded("slow")));
        assert!(!is_retryable(&tonic::Status::invalid_argument("bad")));
        assert!(!is_retryable(&tonic::Status::not_found("nope")));
        assert!(!is_retryable(&tonic::Status::already_exists("dup")));
        assert!(!is_retryable(&tonic::Status::internal("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = call_with_retry("Test", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(tonic::Status::unavailable("not yet"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("should eventually succeed");

        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), CsiError> = call_with_retry("Test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(tonic::Status::failed_precondition("no")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
