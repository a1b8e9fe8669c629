//! Operation records: what the control plane asked for, and the append-only
//! trail of statuses each operation accumulates on its way to a terminal
//! state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resource::{Resource, SourceType};

/// The payload of an `APPLY_OPERATION` event.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationInfo {
    #[prost(enumeration = "OperationType", tag = "1")]
    pub r#type: i32,
    /// Framework-visible identifier, if the framework set one.
    #[prost(string, optional, tag = "2")]
    pub id: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub reserve: Option<Reserve>,
    #[prost(message, optional, tag = "4")]
    pub unreserve: Option<Unreserve>,
    #[prost(message, optional, tag = "5")]
    pub create: Option<Create>,
    #[prost(message, optional, tag = "6")]
    pub destroy: Option<Destroy>,
    #[prost(message, optional, tag = "7")]
    pub create_disk: Option<CreateDisk>,
    #[prost(message, optional, tag = "8")]
    pub destroy_disk: Option<DestroyDisk>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum OperationType {
    UnknownOperation = 0,
    Reserve = 1,
    Unreserve = 2,
    Create = 3,
    Destroy = 4,
    CreateDisk = 5,
    DestroyDisk = 6,
}

impl OperationInfo {
    pub fn operation_type(&self) -> OperationType {
        OperationType::from_i32(self.r#type).unwrap_or(OperationType::UnknownOperation)
    }

    /// Speculative operations apply synchronously to totals and never reach
    /// the plugin.
    pub fn is_speculative(&self) -> bool {
        matches!(
            self.operation_type(),
            OperationType::Reserve
                | OperationType::Unreserve
                | OperationType::Create
                | OperationType::Destroy
        )
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Reserve {
    #[prost(message, repeated, tag = "1")]
    pub resources: Vec<Resource>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Unreserve {
    #[prost(message, repeated, tag = "1")]
    pub resources: Vec<Resource>,
}

/// Creates persistent volumes out of MOUNT (or PATH) disks.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Create {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<Resource>,
}

/// Destroys persistent volumes, scrubbing their contents first.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Destroy {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<Resource>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateDisk {
    #[prost(message, optional, tag = "1")]
    pub source: Option<Resource>,
    #[prost(enumeration = "SourceType", tag = "2")]
    pub target_type: i32,
    /// Required when importing a pre-existing volume, which carries no
    /// profile of its own.
    #[prost(string, optional, tag = "3")]
    pub target_profile: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DestroyDisk {
    #[prost(message, optional, tag = "1")]
    pub source: Option<Resource>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum OperationState {
    UnknownState = 0,
    Pending = 1,
    Finished = 2,
    Failed = 3,
    Error = 4,
    Dropped = 5,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Finished
                | OperationState::Failed
                | OperationState::Error
                | OperationState::Dropped
        )
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationStatus {
    #[prost(enumeration = "OperationState", tag = "1")]
    pub state: i32,
    /// Identifies this status for acknowledgement. Unset on statuses that
    /// are never retried (e.g. PENDING).
    #[prost(string, optional, tag = "2")]
    pub uuid: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub operation_id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub message: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub converted_resources: Vec<Resource>,
}

impl OperationStatus {
    pub fn new(state: OperationState, operation_id: Option<String>) -> Self {
        OperationStatus {
            state: state as i32,
            uuid: Some(Uuid::new_v4().to_string()),
            operation_id,
            message: None,
            converted_resources: Vec::new(),
        }
    }

    pub fn operation_state(&self) -> OperationState {
        OperationState::from_i32(self.state).unwrap_or(OperationState::UnknownState)
    }

    pub fn is_terminal(&self) -> bool {
        self.operation_state().is_terminal()
    }
}

/// The full record of a submitted operation. Statuses are append-only; the
/// last one is the latest.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, optional, tag = "2")]
    pub framework_id: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub info: Option<OperationInfo>,
    #[prost(message, repeated, tag = "4")]
    pub statuses: Vec<OperationStatus>,
}

impl Operation {
    pub fn latest_status(&self) -> Option<&OperationStatus> {
        self.statuses.last()
    }

    pub fn is_terminated(&self) -> bool {
        self.latest_status()
            .map(OperationStatus::is_terminal)
            .unwrap_or(false)
    }
}
