//! Disk resource types and the arithmetic the operation pipeline performs on
//! them. A resource is a scalar number of megabytes qualified by where it
//! came from (`provider_id`), who it is reserved for, and what kind of disk
//! backs it (`DiskInfo`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The resource name used for all disk resources.
pub const DISK_RESOURCE_NAME: &str = "disk";

/// A scalar disk resource.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Scalar value in megabytes.
    #[prost(uint64, tag = "2")]
    pub disk_mb: u64,
    #[prost(string, optional, tag = "3")]
    pub provider_id: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub reservations: Vec<Reservation>,
    #[prost(message, optional, tag = "5")]
    pub disk: Option<DiskInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Reservation {
    #[prost(string, tag = "1")]
    pub role: String,
    #[prost(string, optional, tag = "2")]
    pub principal: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskInfo {
    #[prost(message, optional, tag = "1")]
    pub source: Option<DiskSource>,
    /// Present on persistent volumes created with a CREATE operation.
    #[prost(message, optional, tag = "2")]
    pub persistence: Option<Persistence>,
    /// Where a persistent volume is mounted inside a task sandbox.
    #[prost(string, optional, tag = "3")]
    pub container_path: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Persistence {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, optional, tag = "2")]
    pub principal: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSource {
    #[prost(enumeration = "SourceType", tag = "1")]
    pub r#type: i32,
    /// CSI volume id. Present on managed and pre-existing volumes.
    #[prost(string, optional, tag = "2")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub profile: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub vendor: Option<String>,
    #[prost(map = "string, string", tag = "5")]
    pub metadata: HashMap<String, String>,
    /// Root directory under which MOUNT volumes are exposed, relative to the
    /// plugin's mount directory.
    #[prost(string, optional, tag = "6")]
    pub mount_root: Option<String>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum SourceType {
    UnknownSource = 0,
    Raw = 1,
    Path = 2,
    Mount = 3,
    Block = 4,
}

impl Resource {
    /// A RAW disk resource, optionally under a profile and/or carrying a
    /// volume id.
    pub fn raw(disk_mb: u64, profile: Option<&str>, id: Option<&str>) -> Self {
        Resource {
            name: DISK_RESOURCE_NAME.to_string(),
            disk_mb,
            provider_id: None,
            reservations: Vec::new(),
            disk: Some(DiskInfo {
                source: Some(DiskSource {
                    r#type: SourceType::Raw as i32,
                    id: id.map(str::to_string),
                    profile: profile.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    pub fn source(&self) -> Option<&DiskSource> {
        self.disk.as_ref().and_then(|d| d.source.as_ref())
    }

    pub fn source_type(&self) -> Option<SourceType> {
        self.source().and_then(|s| SourceType::from_i32(s.r#type))
    }

    pub fn volume_id(&self) -> Option<&str> {
        self.source().and_then(|s| s.id.as_deref())
    }

    pub fn profile(&self) -> Option<&str> {
        self.source().and_then(|s| s.profile.as_deref())
    }

    /// A storage pool is unallocated RAW capacity under a profile.
    pub fn is_storage_pool(&self) -> bool {
        matches!(self.source_type(), Some(SourceType::Raw))
            && self.volume_id().is_none()
            && self.profile().is_some()
    }

    /// A pre-existing volume was discovered on the backend but has not been
    /// adopted under any profile.
    pub fn is_pre_existing_volume(&self) -> bool {
        matches!(self.source_type(), Some(SourceType::Raw))
            && self.volume_id().is_some()
            && self.profile().is_none()
    }

    /// A managed volume is a MOUNT or BLOCK disk created through the
    /// provider; it always has both an id and a profile.
    pub fn is_managed_volume(&self) -> bool {
        matches!(
            self.source_type(),
            Some(SourceType::Mount) | Some(SourceType::Block)
        ) && self.volume_id().is_some()
            && self.profile().is_some()
    }

    pub fn is_persistent_volume(&self) -> bool {
        self.disk
            .as_ref()
            .map(|d| d.persistence.is_some())
            .unwrap_or(false)
    }

    /// Two resources share an identity when every field except the scalar
    /// value matches. Same-identity resources merge when added.
    pub fn has_same_identity(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.provider_id == other.provider_id
            && self.reservations == other.reservations
            && self.disk == other.disk
    }
}

/// A collection of resources with merge-on-add and checked-subtract
/// semantics. The provider's totals are one of these.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub fn new(resources: Vec<Resource>) -> Self {
        let mut out = Resources::default();
        for resource in resources {
            out.add(resource);
        }
        out
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<Resource> {
        self.0.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds a resource, merging it into an existing entry with the same
    /// identity. Zero-valued resources are dropped.
    pub fn add(&mut self, resource: Resource) {
        if resource.disk_mb == 0 {
            return;
        }
        match self.0.iter_mut().find(|r| r.has_same_identity(&resource)) {
            Some(existing) => existing.disk_mb += resource.disk_mb,
            None => self.0.push(resource),
        }
    }

    /// Subtracts a resource, failing when the collection does not contain it.
    pub fn subtract(&mut self, resource: &Resource) -> anyhow::Result<()> {
        if resource.disk_mb == 0 {
            return Ok(());
        }
        let index = self
            .0
            .iter()
            .position(|r| r.has_same_identity(resource) && r.disk_mb >= resource.disk_mb)
            .ok_or_else(|| anyhow::anyhow!("resources do not contain the subtrahend"))?;
        self.0[index].disk_mb -= resource.disk_mb;
        if self.0[index].disk_mb == 0 {
            self.0.remove(index);
        }
        Ok(())
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        resource.disk_mb == 0
            || self
                .0
                .iter()
                .any(|r| r.has_same_identity(resource) && r.disk_mb >= resource.disk_mb)
    }

    /// Applies a conversion: consumed resources are subtracted, converted
    /// ones added. Fails without modifying anything when the consumed set is
    /// not contained.
    pub fn apply(&mut self, conversion: &ResourceConversion) -> anyhow::Result<()> {
        let mut result = self.clone();
        for consumed in &conversion.consumed {
            result.subtract(consumed)?;
        }
        for converted in &conversion.converted {
            result.add(converted.clone());
        }
        *self = result;
        Ok(())
    }

    /// Total megabytes held in storage pools under the given profile.
    pub fn storage_pool_mb(&self, profile: &str) -> u64 {
        self.0
            .iter()
            .filter(|r| r.is_storage_pool() && r.profile() == Some(profile))
            .map(|r| r.disk_mb)
            .sum()
    }

    /// Removes and returns all storage pools under the given profile.
    pub fn take_storage_pools(&mut self, profile: &str) -> Vec<Resource> {
        let (pools, rest) = self
            .0
            .drain(..)
            .partition(|r| r.is_storage_pool() && r.profile() == Some(profile));
        self.0 = rest;
        pools
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        Resources::new(resources)
    }
}

impl IntoIterator for Resources {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// How an operation changes a set of resources: `consumed` disappears and
/// `converted` takes its place.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConversion {
    pub consumed: Vec<Resource>,
    pub converted: Vec<Resource>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pools_merge_on_add() {
        let mut resources = Resources::default();
        resources.add(Resource::raw(2048, Some("fast"), None));
        resources.add(Resource::raw(2048, Some("fast"), None));
        resources.add(Resource::raw(1024, Some("slow"), None));

        assert_eq!(resources.storage_pool_mb("fast"), 4096);
        assert_eq!(resources.storage_pool_mb("slow"), 1024);
        assert_eq!(resources.iter().count(), 2);
    }

    #[test]
    fn subtract_requires_containment() {
        let mut resources = Resources::new(vec![Resource::raw(4096, Some("fast"), None)]);

        assert!(resources
            .subtract(&Resource::raw(8192, Some("fast"), None))
            .is_err());
        assert!(resources
            .subtract(&Resource::raw(4096, Some("slow"), None))
            .is_err());
        resources
            .subtract(&Resource::raw(4096, Some("fast"), None))
            .expect("should subtract");
        assert!(resources.is_empty());
    }

    #[test]
    fn conversion_is_atomic() {
        let mut resources = Resources::new(vec![Resource::raw(4096, Some("fast"), None)]);

        let bad = ResourceConversion {
            consumed: vec![Resource::raw(8192, Some("fast"), None)],
            converted: vec![Resource::raw(8192, None, Some("vol-1"))],
        };
        assert!(resources.apply(&bad).is_err());
        // Nothing changed
        assert_eq!(resources.storage_pool_mb("fast"), 4096);

        let good = ResourceConversion {
            consumed: vec![Resource::raw(4096, Some("fast"), None)],
            converted: vec![Resource::raw(4096, None, Some("vol-1"))],
        };
        resources.apply(&good).expect("should apply");
        assert_eq!(resources.storage_pool_mb("fast"), 0);
        assert!(resources.iter().any(|r| r.is_pre_existing_volume()));
    }

    #[test]
    fn classification() {
        assert!(Resource::raw(1, Some("p"), None).is_storage_pool());
        assert!(Resource::raw(1, None, Some("vol")).is_pre_existing_volume());

        let mut managed = Resource::raw(1, Some("p"), Some("vol"));
        managed.disk.as_mut().unwrap().source.as_mut().unwrap().r#type = SourceType::Mount as i32;
        assert!(managed.is_managed_volume());
        assert!(!managed.is_storage_pool());
    }
}
