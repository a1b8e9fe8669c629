//! Persistent admission of resource provider identities. The registrar is
//! the only component that decides whether a subscribing provider is new,
//! returning, or permanently gone; its registry survives process restarts
//! and a removed id can never be admitted again.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::api::ResourceProviderInfo;
use crate::checkpoint;
use crate::paths;

/// The persisted registry: admitted providers keyed by id, plus tombstones
/// for removed ones.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    pub providers: HashMap<String, ResourceProviderInfo>,
    /// Removed ids, with the (type, name) they were admitted under. Both the
    /// id and the identity are blocked from readmission.
    pub removed: HashMap<String, (String, String)>,
}

impl Registry {
    pub fn get(&self, provider_id: &str) -> Option<&ResourceProviderInfo> {
        self.providers.get(provider_id)
    }
}

/// An operation applied against the registry.
#[derive(Clone, Debug)]
pub enum RegistryOperation {
    /// Admit the given identity; `info.id` must be set by the caller.
    AdmitResourceProvider(ResourceProviderInfo),
    /// Remove the provider with the given id, tombstoning it.
    RemoveResourceProvider(String),
}

pub struct Registrar {
    path: PathBuf,
    registry: Mutex<Registry>,
}

impl Registrar {
    /// Recovers the registry from the work directory, or starts empty.
    pub async fn recover(work_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = paths::registry_path(&work_dir.into());
        let registry = checkpoint::recover(&path).await?.unwrap_or_default();
        Ok(Registrar {
            path,
            registry: Mutex::new(registry),
        })
    }

    /// A snapshot of the current registry.
    pub async fn registry(&self) -> Registry {
        self.registry.lock().await.clone()
    }

    /// Applies an operation, persisting the result before returning. The
    /// returned bool reports whether the registry was mutated; violations of
    /// the admission rules are errors.
    pub async fn apply(&self, operation: RegistryOperation) -> anyhow::Result<bool> {
        let mut registry = self.registry.lock().await;

        let mutated = match operation {
            RegistryOperation::AdmitResourceProvider(info) => self.admit(&mut registry, info)?,
            RegistryOperation::RemoveResourceProvider(id) => {
                match registry.providers.remove(&id) {
                    Some(info) => {
                        info!(provider_id = %id, "Removing resource provider");
                        registry.removed.insert(id, (info.r#type, info.name));
                        true
                    }
                    None if registry.removed.contains_key(&id) => false,
                    None => anyhow::bail!("cannot remove unknown resource provider {}", id),
                }
            }
        };

        if mutated {
            checkpoint::checkpoint(&self.path, &*registry).await?;
        }
        Ok(mutated)
    }

    fn admit(&self, registry: &mut Registry, info: ResourceProviderInfo) -> anyhow::Result<bool> {
        let id = info
            .id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cannot admit a resource provider without an id"))?;

        if registry.removed.contains_key(&id) {
            anyhow::bail!("resource provider {} has been removed", id);
        }
        if registry
            .removed
            .values()
            .any(|(t, n)| *t == info.r#type && *n == info.name)
        {
            anyhow::bail!(
                "a resource provider named {}/{} has been removed",
                info.r#type,
                info.name
            );
        }

        if let Some(existing) = registry.providers.get(&id) {
            if existing.r#type != info.r#type || existing.name != info.name {
                anyhow::bail!(
                    "resource provider {} is already admitted as {}/{}",
                    id,
                    existing.r#type,
                    existing.name
                );
            }
            return Ok(false);
        }

        if let Some(existing) = registry
            .providers
            .values()
            .find(|p| p.r#type == info.r#type && p.name == info.name)
        {
            anyhow::bail!(
                "a resource provider named {}/{} is already admitted with id {}",
                info.r#type,
                info.name,
                existing.id.as_deref().unwrap_or_default()
            );
        }

        info!(provider_id = %id, r#type = %info.r#type, name = %info.name, "Admitting resource provider");
        registry.providers.insert(id, info);
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(id: &str, name: &str) -> ResourceProviderInfo {
        ResourceProviderInfo {
            r#type: "org.storlet.rp.local.storage".to_string(),
            name: name.to_string(),
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn admit_is_idempotent() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let registrar = Registrar::recover(tempdir.path()).await.unwrap();

        assert!(registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
            .await
            .unwrap());
        assert!(!registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn changed_identity_is_rejected() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let registrar = Registrar::recover(tempdir.path()).await.unwrap();

        registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
            .await
            .unwrap();

        // Same id, different name
        assert!(registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "b")))
            .await
            .is_err());
        // Same name, different id
        assert!(registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-2", "a")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn removed_provider_cannot_be_readmitted() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let registrar = Registrar::recover(tempdir.path()).await.unwrap();

        registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
            .await
            .unwrap();
        assert!(registrar
            .apply(RegistryOperation::RemoveResourceProvider("id-1".to_string()))
            .await
            .unwrap());

        assert!(registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
            .await
            .is_err());
        // The (type, name) tombstone also blocks a fresh id
        assert!(registrar
            .apply(RegistryOperation::AdmitResourceProvider(info("id-2", "a")))
            .await
            .is_err());
        // Double remove does not mutate
        assert!(!registrar
            .apply(RegistryOperation::RemoveResourceProvider("id-1".to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn registry_survives_restart() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        {
            let registrar = Registrar::recover(tempdir.path()).await.unwrap();
            registrar
                .apply(RegistryOperation::AdmitResourceProvider(info("id-1", "a")))
                .await
                .unwrap();
            registrar
                .apply(RegistryOperation::AdmitResourceProvider(info("id-2", "b")))
                .await
                .unwrap();
            registrar
                .apply(RegistryOperation::RemoveResourceProvider("id-2".to_string()))
                .await
                .unwrap();
        }

        let registrar = Registrar::recover(tempdir.path()).await.unwrap();
        let registry = registrar.registry().await;
        assert!(registry.get("id-1").is_some());
        assert!(registry.get("id-2").is_none());
        assert!(registry.removed.contains_key("id-2"));
    }
}
