//! Wire types for the provider ↔ agent API. A provider talks to the manager
//! through a single HTTP endpoint: `Call` messages go up, and a SUBSCRIBE
//! call opens a long-lived chunked response carrying framed `Event` records.
//! Both JSON and binary protobuf encodings are supported, so every type here
//! derives both `serde` and `prost` implementations.

mod operation;
mod resource;

pub use operation::*;
pub use resource::*;

use serde::{Deserialize, Serialize};

/// Name of the header carrying the subscription stream id. A SUBSCRIBE
/// response sets it; every later call on the same session must repeat it.
pub const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";

/// Media types understood by the manager endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// `application/json`
    Json,
    /// `application/x-protobuf`
    Protobuf,
}

impl ContentType {
    /// Parses a `Content-Type` (or `Accept`) media type. Returns `None` for
    /// types the endpoint does not speak.
    pub fn from_media_type(value: &str) -> Option<Self> {
        // Parameters (e.g. charset) are irrelevant for our two types
        match value.split(';').next().unwrap_or_default().trim() {
            "application/json" => Some(ContentType::Json),
            "application/x-protobuf" => Some(ContentType::Protobuf),
            _ => None,
        }
    }

    /// The canonical media type string.
    pub fn as_media_type(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Protobuf => "application/x-protobuf",
        }
    }
}

/// Identity of a resource provider instance. `type` and `name` are immutable
/// once admitted; `id` is assigned by the registrar on first admission.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProviderInfo {
    /// Dotted reverse-DNS type, e.g. `org.storlet.rp.local.storage`.
    #[prost(string, tag = "1")]
    pub r#type: String,
    /// Identifier within the type.
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(message, optional, tag = "4")]
    pub storage: Option<StoragePluginInfo>,
    /// Reservations stamped onto newly surfaced storage pools.
    #[prost(message, repeated, tag = "5")]
    pub default_reservations: Vec<Reservation>,
}

/// Descriptor of the CSI plugin backing a storage provider.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePluginInfo {
    #[prost(string, tag = "1")]
    pub plugin_type: String,
    #[prost(string, tag = "2")]
    pub plugin_name: String,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<PluginContainer>,
}

/// One runnable container (process) of the plugin, together with the CSI
/// services it hosts.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginContainer {
    #[prost(enumeration = "PluginService", repeated, tag = "1")]
    pub services: Vec<i32>,
    #[prost(string, tag = "2")]
    pub command: String,
    #[prost(string, repeated, tag = "3")]
    pub args: Vec<String>,
}

impl PluginContainer {
    /// Whether this container hosts the given CSI service.
    pub fn hosts(&self, service: PluginService) -> bool {
        self.services.contains(&(service as i32))
    }
}

/// CSI services a plugin container can host.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum PluginService {
    UnknownService = 0,
    ControllerService = 1,
    NodeService = 2,
}

/// A provider-to-manager message.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Call {
    #[prost(enumeration = "CallType", tag = "1")]
    pub r#type: i32,
    /// Unset only for the very first SUBSCRIBE of a new provider.
    #[prost(string, optional, tag = "2")]
    pub resource_provider_id: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub subscribe: Option<Subscribe>,
    #[prost(message, optional, tag = "4")]
    pub update_state: Option<UpdateState>,
    #[prost(message, optional, tag = "5")]
    pub update_operation_status: Option<UpdateOperationStatus>,
    #[prost(message, optional, tag = "6")]
    pub update_publish_resources_status: Option<UpdatePublishResourcesStatus>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum CallType {
    UnknownCall = 0,
    Subscribe = 1,
    UpdateState = 2,
    UpdateOperationStatus = 3,
    UpdatePublishResourcesStatus = 4,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscribe {
    #[prost(message, optional, tag = "1")]
    pub info: Option<ResourceProviderInfo>,
}

/// Full snapshot of the provider's view: total resources, outstanding
/// operations, and the fencing token guarding both.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateState {
    #[prost(message, repeated, tag = "1")]
    pub resources: Vec<Resource>,
    #[prost(message, repeated, tag = "2")]
    pub operations: Vec<Operation>,
    #[prost(string, tag = "3")]
    pub resource_version_uuid: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOperationStatus {
    #[prost(string, tag = "1")]
    pub operation_uuid: String,
    #[prost(string, optional, tag = "2")]
    pub framework_id: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<OperationStatus>,
    /// Set on reconciliation replies when the retried status is not the
    /// latest one anymore.
    #[prost(message, optional, tag = "4")]
    pub latest_status: Option<OperationStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePublishResourcesStatus {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(enumeration = "PublishResourcesStatus", tag = "2")]
    pub status: i32,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum PublishResourcesStatus {
    UnknownPublishStatus = 0,
    Ok = 1,
    Failed = 2,
}

/// A manager-to-provider message, delivered on the subscription stream.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[prost(enumeration = "EventType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub subscribed: Option<Subscribed>,
    #[prost(message, optional, tag = "3")]
    pub apply_operation: Option<ApplyOperation>,
    #[prost(message, optional, tag = "4")]
    pub publish_resources: Option<PublishResources>,
    #[prost(message, optional, tag = "5")]
    pub acknowledge_operation_status: Option<AcknowledgeOperationStatus>,
    #[prost(message, optional, tag = "6")]
    pub reconcile_operations: Option<ReconcileOperations>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum EventType {
    UnknownEvent = 0,
    Subscribed = 1,
    ApplyOperation = 2,
    PublishResources = 3,
    AcknowledgeOperationStatus = 4,
    ReconcileOperations = 5,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscribed {
    #[prost(string, tag = "1")]
    pub provider_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyOperation {
    #[prost(message, optional, tag = "1")]
    pub info: Option<OperationInfo>,
    #[prost(string, optional, tag = "2")]
    pub framework_id: Option<String>,
    #[prost(string, tag = "3")]
    pub operation_uuid: String,
    /// The fencing token the control plane observed; a mismatch with the
    /// provider's current version drops the operation.
    #[prost(string, tag = "4")]
    pub resource_version_uuid: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishResources {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Resource>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AcknowledgeOperationStatus {
    #[prost(string, tag = "1")]
    pub status_uuid: String,
    #[prost(string, tag = "2")]
    pub operation_uuid: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileOperations {
    #[prost(string, repeated, tag = "1")]
    pub operation_uuids: Vec<String>,
}

/// Encodes a message in the given wire encoding.
pub fn encode<M>(message: &M, content_type: ContentType) -> anyhow::Result<Vec<u8>>
where
    M: prost::Message + Serialize,
{
    match content_type {
        ContentType::Json => Ok(serde_json::to_vec(message)?),
        ContentType::Protobuf => {
            let mut buf = Vec::with_capacity(message.encoded_len());
            message.encode(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Decodes a message from the given wire encoding.
pub fn decode<M>(bytes: &[u8], content_type: ContentType) -> anyhow::Result<M>
where
    M: prost::Message + serde::de::DeserializeOwned + Default,
{
    match content_type {
        ContentType::Json => Ok(serde_json::from_slice(bytes)?),
        ContentType::Protobuf => Ok(M::decode(bytes)?),
    }
}
