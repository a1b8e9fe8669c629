//! Pure operation logic: input validation and the resource conversions each
//! operation produces. Everything here is synchronous; the provider applies
//! the results to its totals and drives the volume manager for the
//! non-speculative operations.

use std::collections::HashMap;

use crate::api::{
    CreateDisk, DestroyDisk, DiskInfo, DiskSource, OperationInfo, OperationType, Resource,
    ResourceConversion, Resources, SourceType,
};

/// Validated parameters of a CREATE_DISK operation.
pub struct CreateDiskRequest {
    pub source: Resource,
    pub target_type: SourceType,
    pub profile: String,
    /// Set on the import path: the pre-existing volume to adopt.
    pub import_volume_id: Option<String>,
}

/// Checks a CREATE_DISK payload: the source is RAW and either carries a
/// profile (new volume) or an id plus a target profile (import), and the
/// target is MOUNT or BLOCK.
pub fn validate_create_disk(create_disk: &CreateDisk) -> anyhow::Result<CreateDiskRequest> {
    let source = create_disk
        .source
        .clone()
        .ok_or_else(|| anyhow::anyhow!("'create_disk.source' is required"))?;

    if !matches!(source.source_type(), Some(SourceType::Raw)) {
        anyhow::bail!("'create_disk.source' must be a RAW disk resource");
    }
    if source.disk_mb == 0 {
        anyhow::bail!("'create_disk.source' must have a positive size");
    }

    let target_type = create_disk.target_type();
    if !matches!(target_type, SourceType::Mount | SourceType::Block) {
        anyhow::bail!("'create_disk.target_type' must be MOUNT or BLOCK");
    }

    match (source.profile(), source.volume_id()) {
        (Some(profile), None) => Ok(CreateDiskRequest {
            profile: profile.to_string(),
            target_type,
            import_volume_id: None,
            source,
        }),
        (None, Some(id)) => {
            let profile = create_disk.target_profile.clone().ok_or_else(|| {
                anyhow::anyhow!("'create_disk.target_profile' is required to import a volume")
            })?;
            Ok(CreateDiskRequest {
                profile,
                target_type,
                import_volume_id: Some(id.to_string()),
                source,
            })
        }
        _ => anyhow::bail!(
            "'create_disk.source' must be either a storage pool or a pre-existing volume"
        ),
    }
}

/// The conversion a successful CREATE_DISK yields: the same scalar, upgraded
/// to the target type, addressed by the new volume id and annotated with the
/// plugin's volume context.
pub fn create_disk_conversion(
    request: &CreateDiskRequest,
    volume_id: &str,
    metadata: HashMap<String, String>,
    mount_root: &str,
) -> ResourceConversion {
    let mut converted = request.source.clone();
    let disk = converted.disk.get_or_insert_with(DiskInfo::default);
    let source = disk.source.get_or_insert_with(DiskSource::default);
    source.r#type = request.target_type as i32;
    source.id = Some(volume_id.to_string());
    source.profile = Some(request.profile.clone());
    source.metadata = metadata;
    if request.target_type == SourceType::Mount {
        source.mount_root = Some(mount_root.to_string());
    }

    ResourceConversion {
        consumed: vec![request.source.clone()],
        converted: vec![converted],
    }
}

/// Checks a DESTROY_DISK payload: a managed MOUNT or BLOCK volume that is
/// not serving as a persistent volume.
pub fn validate_destroy_disk(destroy_disk: &DestroyDisk) -> anyhow::Result<Resource> {
    let source = destroy_disk
        .source
        .clone()
        .ok_or_else(|| anyhow::anyhow!("'destroy_disk.source' is required"))?;

    if !matches!(
        source.source_type(),
        Some(SourceType::Mount) | Some(SourceType::Block)
    ) {
        anyhow::bail!("'destroy_disk.source' must be a MOUNT or BLOCK disk resource");
    }
    if source.volume_id().is_none() {
        anyhow::bail!("'destroy_disk.source' must carry a volume id");
    }
    if source.is_persistent_volume() {
        anyhow::bail!("a persistent volume must be destroyed before its disk");
    }
    Ok(source)
}

/// The conversion a successful DESTROY_DISK yields. When the profile has
/// disappeared from the catalog, the freed capacity cannot rejoin a pool, so
/// the converted scalar is zero and the caller schedules a reconciliation.
pub fn destroy_disk_conversion(source: &Resource, profile_known: bool) -> ResourceConversion {
    let mut converted = source.clone();
    let disk_source = converted
        .disk
        .as_mut()
        .and_then(|d| d.source.as_mut())
        .expect("validated destroy source always has a disk source");
    disk_source.r#type = SourceType::Raw as i32;
    disk_source.id = None;
    disk_source.metadata = HashMap::new();
    disk_source.mount_root = None;
    if !profile_known {
        converted.disk_mb = 0;
    }

    ResourceConversion {
        consumed: vec![source.clone()],
        converted: vec![converted],
    }
}

/// Applies a speculative operation to a copy of the totals, returning the
/// conversion it amounts to. Fails without side effects when the consumed
/// resources are not contained in the totals.
pub fn speculative_conversion(
    info: &OperationInfo,
    totals: &Resources,
) -> anyhow::Result<ResourceConversion> {
    let conversion = match info.operation_type() {
        OperationType::Reserve => {
            let resources = &info
                .reserve
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("'reserve' is required"))?
                .resources;
            let mut consumed = Vec::new();
            for resource in resources {
                if resource.reservations.is_empty() {
                    anyhow::bail!("reserved resources must carry a reservation");
                }
                let mut unreserved = resource.clone();
                unreserved.reservations.pop();
                consumed.push(unreserved);
            }
            ResourceConversion {
                consumed,
                converted: resources.clone(),
            }
        }
        OperationType::Unreserve => {
            let resources = &info
                .unreserve
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("'unreserve' is required"))?
                .resources;
            let mut converted = Vec::new();
            for resource in resources {
                if resource.reservations.is_empty() {
                    anyhow::bail!("unreserved resources must carry a reservation");
                }
                let mut unreserved = resource.clone();
                unreserved.reservations.pop();
                converted.push(unreserved);
            }
            ResourceConversion {
                consumed: resources.clone(),
                converted,
            }
        }
        OperationType::Create => {
            let volumes = &info
                .create
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("'create' is required"))?
                .volumes;
            let mut consumed = Vec::new();
            for volume in volumes {
                if !volume.is_persistent_volume() {
                    anyhow::bail!("created volumes must carry persistence information");
                }
                consumed.push(strip_persistence(volume));
            }
            ResourceConversion {
                consumed,
                converted: volumes.clone(),
            }
        }
        OperationType::Destroy => {
            let volumes = &info
                .destroy
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("'destroy' is required"))?
                .volumes;
            let mut converted = Vec::new();
            for volume in volumes {
                if !volume.is_persistent_volume() {
                    anyhow::bail!("destroyed volumes must carry persistence information");
                }
                converted.push(strip_persistence(volume));
            }
            ResourceConversion {
                consumed: volumes.clone(),
                converted,
            }
        }
        other => anyhow::bail!("operation {:?} is not speculative", other),
    };

    // Prove the conversion applies before reporting it
    let mut scratch = totals.clone();
    scratch.apply(&conversion)?;
    Ok(conversion)
}

fn strip_persistence(volume: &Resource) -> Resource {
    let mut stripped = volume.clone();
    if let Some(disk) = stripped.disk.as_mut() {
        disk.persistence = None;
        disk.container_path = None;
    }
    stripped
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{Persistence, Reservation};

    fn mount_volume(disk_mb: u64, id: &str) -> Resource {
        let mut resource = Resource::raw(disk_mb, Some("test"), Some(id));
        resource
            .disk
            .as_mut()
            .unwrap()
            .source
            .as_mut()
            .unwrap()
            .r#type = SourceType::Mount as i32;
        resource
    }

    #[test]
    fn create_disk_requires_raw_source() {
        let mut create_disk = CreateDisk {
            source: Some(mount_volume(1024, "vol")),
            target_type: SourceType::Mount as i32,
            target_profile: None,
        };
        assert!(validate_create_disk(&create_disk).is_err());

        create_disk.source = Some(Resource::raw(1024, Some("test"), None));
        let request = validate_create_disk(&create_disk).expect("pool source should validate");
        assert!(request.import_volume_id.is_none());
        assert_eq!(request.profile, "test");
    }

    #[test]
    fn create_disk_import_needs_target_profile() {
        let mut create_disk = CreateDisk {
            source: Some(Resource::raw(1024, None, Some("legacy"))),
            target_type: SourceType::Mount as i32,
            target_profile: None,
        };
        assert!(validate_create_disk(&create_disk).is_err());

        create_disk.target_profile = Some("test".to_string());
        let request = validate_create_disk(&create_disk).expect("import should validate");
        assert_eq!(request.import_volume_id.as_deref(), Some("legacy"));
    }

    #[test]
    fn create_then_destroy_round_trips_the_pool() {
        let create_disk = CreateDisk {
            source: Some(Resource::raw(4096, Some("test"), None)),
            target_type: SourceType::Mount as i32,
            target_profile: None,
        };
        let request = validate_create_disk(&create_disk).unwrap();

        let mut totals = Resources::new(vec![Resource::raw(4096, Some("test"), None)]);
        let conversion =
            create_disk_conversion(&request, "vol-1", HashMap::new(), "/mnt/csi");
        totals.apply(&conversion).unwrap();
        assert_eq!(totals.storage_pool_mb("test"), 0);

        let volume = conversion.converted[0].clone();
        assert!(volume.is_managed_volume());
        assert_eq!(volume.source().unwrap().mount_root.as_deref(), Some("/mnt/csi"));

        let source = validate_destroy_disk(&DestroyDisk {
            source: Some(volume),
        })
        .unwrap();
        totals
            .apply(&destroy_disk_conversion(&source, true))
            .unwrap();
        assert_eq!(totals.storage_pool_mb("test"), 4096);
    }

    #[test]
    fn destroy_with_vanished_profile_converts_to_zero() {
        let source = mount_volume(1024, "vol");
        let conversion = destroy_disk_conversion(&source, false);
        assert_eq!(conversion.converted[0].disk_mb, 0);
    }

    #[test]
    fn destroy_rejects_persistent_volumes() {
        let mut volume = mount_volume(1024, "vol");
        volume.disk.as_mut().unwrap().persistence = Some(Persistence {
            id: "pv-1".to_string(),
            principal: None,
        });
        assert!(validate_destroy_disk(&DestroyDisk {
            source: Some(volume),
        })
        .is_err());
    }

    #[test]
    fn reserve_unreserve_round_trip() {
        let mut reserved = Resource::raw(2048, Some("test"), None);
        reserved.reservations.push(Reservation {
            role: "storage".to_string(),
            principal: None,
        });

        let totals = Resources::new(vec![Resource::raw(4096, Some("test"), None)]);

        let reserve = OperationInfo {
            r#type: OperationType::Reserve as i32,
            reserve: Some(crate::api::Reserve {
                resources: vec![reserved.clone()],
            }),
            ..Default::default()
        };
        let conversion = speculative_conversion(&reserve, &totals).unwrap();
        let mut totals_after = totals.clone();
        totals_after.apply(&conversion).unwrap();
        assert_eq!(totals_after.storage_pool_mb("test"), 2048);

        let unreserve = OperationInfo {
            r#type: OperationType::Unreserve as i32,
            unreserve: Some(crate::api::Unreserve {
                resources: vec![reserved],
            }),
            ..Default::default()
        };
        let conversion = speculative_conversion(&unreserve, &totals_after).unwrap();
        totals_after.apply(&conversion).unwrap();
        assert_eq!(totals_after, totals);
    }

    #[test]
    fn speculative_conversion_fails_on_uncontained_resources() {
        let mut reserved = Resource::raw(8192, Some("test"), None);
        reserved.reservations.push(Reservation {
            role: "storage".to_string(),
            principal: None,
        });
        let reserve = OperationInfo {
            r#type: OperationType::Reserve as i32,
            reserve: Some(crate::api::Reserve {
                resources: vec![reserved],
            }),
            ..Default::default()
        };

        let totals = Resources::new(vec![Resource::raw(4096, Some("test"), None)]);
        assert!(speculative_conversion(&reserve, &totals).is_err());
    }
}
