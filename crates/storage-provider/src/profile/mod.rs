//! Disk profiles: named presets mapping to a CSI volume capability and
//! creation parameters. The provider polls a catalog for the set of known
//! profiles and reconciles its storage pools when that set changes.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_csi::v1_3_0 as csi;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::api::SourceType;

/// A serializable mirror of the CSI volume capability, so profile
/// information can be checkpointed alongside volume state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessType {
    Block,
    Mount {
        #[serde(default)]
        fs_type: Option<String>,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

impl VolumeCapability {
    /// A plain single-writer mount capability, the common case for local
    /// storage.
    pub fn mount() -> Self {
        VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: None,
                mount_flags: Vec::new(),
            },
        }
    }

    pub fn block() -> Self {
        VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Block,
        }
    }

    /// Whether this capability can satisfy a conversion to the given disk
    /// source type.
    pub fn supports(&self, target: SourceType) -> bool {
        match target {
            SourceType::Mount => matches!(self.access_type, AccessType::Mount { .. }),
            SourceType::Block => matches!(self.access_type, AccessType::Block),
            _ => false,
        }
    }

    pub fn to_csi(&self) -> csi::VolumeCapability {
        let mode = match self.access_mode {
            AccessMode::SingleNodeWriter => {
                csi::volume_capability::access_mode::Mode::SingleNodeWriter
            }
            AccessMode::SingleNodeReaderOnly => {
                csi::volume_capability::access_mode::Mode::SingleNodeReaderOnly
            }
            AccessMode::MultiNodeReaderOnly => {
                csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly
            }
            AccessMode::MultiNodeSingleWriter => {
                csi::volume_capability::access_mode::Mode::MultiNodeSingleWriter
            }
            AccessMode::MultiNodeMultiWriter => {
                csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter
            }
        };
        let access_type = match &self.access_type {
            AccessType::Block => csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            ),
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: fs_type.clone().unwrap_or_default(),
                mount_flags: mount_flags.clone(),
            }),
        };
        csi::VolumeCapability {
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(access_type),
        }
    }
}

/// What a profile name translates to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub capability: VolumeCapability,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ProfileInfo {
    /// A mount profile whose parameters carry the profile name, which is the
    /// convention the local storage plugins use for capacity accounting.
    pub fn mount(profile: &str) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("profile".to_string(), profile.to_string());
        ProfileInfo {
            capability: VolumeCapability::mount(),
            parameters,
        }
    }
}

pub type ProfileMap = HashMap<String, ProfileInfo>;

/// Source of truth for the set of known profiles.
#[async_trait::async_trait]
pub trait ProfileAdaptor: Send + Sync + 'static {
    /// Fetches the current catalog. Individual profiles that fail to
    /// translate are skipped; they will be retried on the next poll.
    async fn fetch_profiles(&self) -> anyhow::Result<ProfileMap>;
}

/// Catalog document shape: `{"profiles": {"<name>": {...}}}`. Entries are
/// parsed individually so one malformed profile does not poison the rest.
#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    profiles: HashMap<String, serde_json::Value>,
}

fn parse_catalog(bytes: &[u8]) -> anyhow::Result<ProfileMap> {
    let document: CatalogDocument = serde_json::from_slice(bytes)?;
    let mut profiles = ProfileMap::new();
    for (name, value) in document.profiles {
        match serde_json::from_value::<ProfileInfo>(value) {
            Ok(info) => {
                profiles.insert(name, info);
            }
            Err(e) => {
                warn!(profile = %name, error = %e, "Skipping untranslatable disk profile");
            }
        }
    }
    Ok(profiles)
}

/// Polls a catalog at a `file://` or `http(s)://` URI.
pub struct UriProfileAdaptor {
    uri: String,
    client: reqwest::Client,
}

impl UriProfileAdaptor {
    pub fn new(uri: impl Into<String>) -> Self {
        UriProfileAdaptor {
            uri: uri.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ProfileAdaptor for UriProfileAdaptor {
    async fn fetch_profiles(&self) -> anyhow::Result<ProfileMap> {
        let bytes = if let Some(path) = self.uri.strip_prefix("file://") {
            tokio::fs::read(path).await?
        } else {
            self.client
                .get(&self.uri)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?
                .to_vec()
        };
        parse_catalog(&bytes)
    }
}

/// An adaptor whose catalog is set directly, for tests and embeddings that
/// manage profiles themselves.
#[derive(Clone, Default)]
pub struct StaticProfileAdaptor {
    profiles: Arc<RwLock<ProfileMap>>,
}

impl StaticProfileAdaptor {
    pub fn new(profiles: ProfileMap) -> Self {
        StaticProfileAdaptor {
            profiles: Arc::new(RwLock::new(profiles)),
        }
    }

    pub async fn set(&self, profiles: ProfileMap) {
        *self.profiles.write().await = profiles;
    }

    pub async fn remove(&self, profile: &str) {
        self.profiles.write().await.remove(profile);
    }
}

#[async_trait::async_trait]
impl ProfileAdaptor for StaticProfileAdaptor {
    async fn fetch_profiles(&self) -> anyhow::Result<ProfileMap> {
        Ok(self.profiles.read().await.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn catalog_parses_and_skips_bad_entries() {
        let doc = serde_json::json!({
            "profiles": {
                "fast": {
                    "capability": {
                        "access_mode": "SingleNodeWriter",
                        "access_type": {"type": "mount", "fs_type": "xfs"}
                    },
                    "parameters": {"profile": "fast"}
                },
                "broken": {"capability": "nope"}
            }
        });

        let profiles = parse_catalog(&serde_json::to_vec(&doc).unwrap()).unwrap();
        assert_eq!(profiles.len(), 1);
        let fast = profiles.get("fast").expect("fast profile should parse");
        assert!(fast.capability.supports(SourceType::Mount));
        assert!(!fast.capability.supports(SourceType::Block));
        assert_eq!(fast.parameters.get("profile").unwrap(), "fast");
    }

    #[tokio::test]
    async fn file_uri_adaptor_reads_catalog() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let path = tempdir.path().join("profiles.json");
        let doc = serde_json::json!({
            "profiles": {
                "test": {
                    "capability": {
                        "access_mode": "SingleNodeWriter",
                        "access_type": {"type": "mount"}
                    }
                }
            }
        });
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let adaptor = UriProfileAdaptor::new(format!("file://{}", path.display()));
        let profiles = adaptor.fetch_profiles().await.unwrap();
        assert!(profiles.contains_key("test"));
    }

    #[test]
    fn capability_round_trips_to_csi() {
        let capability = VolumeCapability::mount();
        let csi_capability = capability.to_csi();
        assert!(matches!(
            csi_capability.access_type,
            Some(csi::volume_capability::AccessType::Mount(_))
        ));

        let block = VolumeCapability::block().to_csi();
        assert!(matches!(
            block.access_type,
            Some(csi::volume_capability::AccessType::Block(_))
        ));
    }
}
