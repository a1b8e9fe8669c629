//! The storage local resource provider: subscribes to the manager, owns the
//! provider's totals and fencing token, applies operations, keeps its state
//! checkpointed, and reports every outcome through the status-update
//! manager.
//!
//! The provider is a single logical actor: all state lives behind one lock
//! that is never held across a CSI call, and long-running work (operations,
//! publishes) runs in spawned tasks that re-enter the actor to record their
//! results.

mod operations;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::api::{
    self, ApplyOperation, Call, CallType, ContentType, Event, EventType, Operation,
    OperationState, OperationStatus, OperationType, PublishResources, PublishResourcesStatus,
    Resource, ResourceConversion, ResourceProviderInfo, Resources, Subscribe,
    UpdateOperationStatus, UpdatePublishResourcesStatus, UpdateState, STREAM_ID_HEADER,
};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::checkpoint;
use crate::csi::{call_with_retry, CsiClient};
use crate::paths;
use crate::plugin::{self, ClientWatch};
use crate::profile::{ProfileAdaptor, ProfileMap};
use crate::recordio::RecordIoDecoder;
use crate::status::StatusUpdateManager;
use crate::volume::VolumeManager;

const MB: i64 = 1024 * 1024;

pub struct ProviderOptions {
    pub work_dir: PathBuf,
    /// Manager endpoint, e.g. `http://127.0.0.1:5051/api/v1/resource_provider`.
    pub endpoint: String,
    pub info: ResourceProviderInfo,
    pub adaptor: Arc<dyn ProfileAdaptor>,
    pub poll_interval: Duration,
    pub content_type: ContentType,
    pub client_watch: ClientWatch,
    pub boot_id: String,
}

/// The provider's durable state, checkpointed on every mutation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ProviderCheckpoint {
    resources: Vec<Resource>,
    resource_version: String,
    operations: Vec<Operation>,
    profiles: ProfileMap,
}

struct Connection {
    provider_id: String,
    stream_id: String,
}

#[derive(Default)]
struct ProviderState {
    provider_id: Option<String>,
    connection: Option<Connection>,
    totals: Resources,
    resource_version: String,
    operations: HashMap<String, Operation>,
    profiles: ProfileMap,
    /// While true, operations incompatible with a pool reconciliation are
    /// dropped.
    reconciling: bool,
    status: Option<Arc<StatusUpdateManager>>,
    /// Pre-existing volume discovery has run.
    discovered: bool,
}

struct Inner {
    work_dir: PathBuf,
    endpoint: String,
    info: ResourceProviderInfo,
    adaptor: Arc<dyn ProfileAdaptor>,
    poll_interval: Duration,
    content_type: ContentType,
    client_watch: ClientWatch,
    http: reqwest::Client,
    volumes: Arc<VolumeManager>,
    state: Mutex<ProviderState>,
}

/// Handle to a running provider.
#[derive(Clone)]
pub struct StorageLocalResourceProvider {
    inner: Arc<Inner>,
    tasks: Arc<Vec<tokio::task::JoinHandle<()>>>,
}

impl StorageLocalResourceProvider {
    /// Recovers persisted state and starts the subscription, profile poll,
    /// and status delivery loops.
    pub async fn start(options: ProviderOptions) -> anyhow::Result<Self> {
        let storage = options
            .info
            .storage
            .clone()
            .ok_or_else(|| anyhow::anyhow!("a storage provider needs 'info.storage'"))?;

        let volumes = Arc::new(VolumeManager::new(
            options.work_dir.clone(),
            &storage.plugin_type,
            &storage.plugin_name,
            &options.boot_id,
            options.client_watch.clone(),
        ));
        volumes.recover().await?;

        let inner = Arc::new(Inner {
            work_dir: options.work_dir,
            endpoint: options.endpoint,
            info: options.info,
            adaptor: options.adaptor,
            poll_interval: options.poll_interval,
            content_type: options.content_type,
            client_watch: options.client_watch,
            http: reqwest::Client::new(),
            volumes,
            state: Mutex::new(ProviderState::default()),
        });

        recover(&inner).await?;

        let tasks = vec![
            tokio::spawn(run(inner.clone())),
            tokio::spawn(poll_profiles(inner.clone())),
        ];

        Ok(StorageLocalResourceProvider {
            inner,
            tasks: Arc::new(tasks),
        })
    }

    /// Stops the subscription and poll loops. Used by embedders that
    /// restart the provider in place; durable state is untouched.
    pub fn stop(&self) {
        for task in self.tasks.iter() {
            task.abort();
        }
    }

    /// Snapshot of the provider's total resources, for embedders and tests.
    pub async fn totals(&self) -> Vec<Resource> {
        self.inner.state.lock().await.totals.to_vec()
    }

    pub async fn resource_version(&self) -> String {
        self.inner.state.lock().await.resource_version.clone()
    }

    pub async fn provider_id(&self) -> Option<String> {
        self.inner.state.lock().await.provider_id.clone()
    }

    pub fn volume_manager(&self) -> Arc<VolumeManager> {
        self.inner.volumes.clone()
    }
}

async fn run(inner: Arc<Inner>) {
    let mut backoff =
        ExponentialBackoffStrategy::new(Duration::from_secs(1), Duration::from_secs(60));
    loop {
        match subscribe_and_process(&inner).await {
            Ok(()) => {
                info!("Subscription stream closed, resubscribing");
                backoff.reset();
            }
            Err(e) => {
                warn!(error = %e, "Subscription failed, backing off");
            }
        }
        inner.state.lock().await.connection = None;
        backoff.wait().await;
    }
}

async fn subscribe_and_process(inner: &Arc<Inner>) -> anyhow::Result<()> {
    let call = {
        let state = inner.state.lock().await;
        let mut info = inner.info.clone();
        info.id = state.provider_id.clone();
        Call {
            r#type: CallType::Subscribe as i32,
            resource_provider_id: None,
            subscribe: Some(Subscribe { info: Some(info) }),
            ..Default::default()
        }
    };

    let response = inner
        .http
        .post(&inner.endpoint)
        .header(http::header::CONTENT_TYPE, inner.content_type.as_media_type())
        .header(http::header::ACCEPT, inner.content_type.as_media_type())
        .body(api::encode(&call, inner.content_type)?)
        .send()
        .await?;

    if response.status() != http::StatusCode::OK {
        anyhow::bail!(
            "subscription rejected with {}: {}",
            response.status(),
            String::from_utf8_lossy(&response.bytes().await.unwrap_or_default())
        );
    }

    let stream_id = response
        .headers()
        .get(STREAM_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("subscription response carried no stream id"))?
        .to_string();

    let mut body = response.bytes_stream();
    let mut decoder = RecordIoDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for record in decoder.decode(&chunk)? {
            let event: Event = api::decode(&record, inner.content_type)?;
            handle_event(inner, &stream_id, event).await?;
        }
    }
    Ok(())
}

async fn handle_event(inner: &Arc<Inner>, stream_id: &str, event: Event) -> anyhow::Result<()> {
    match EventType::from_i32(event.r#type) {
        Some(EventType::Subscribed) => {
            let subscribed = event
                .subscribed
                .ok_or_else(|| anyhow::anyhow!("SUBSCRIBED event without a payload"))?;
            handle_subscribed(inner, subscribed.provider_id, stream_id.to_string()).await?;
        }
        Some(EventType::ApplyOperation) => {
            let apply = event
                .apply_operation
                .ok_or_else(|| anyhow::anyhow!("APPLY_OPERATION event without a payload"))?;
            let inner = inner.clone();
            tokio::spawn(async move { apply_operation(&inner, apply).await });
        }
        Some(EventType::PublishResources) => {
            let publish = event
                .publish_resources
                .ok_or_else(|| anyhow::anyhow!("PUBLISH_RESOURCES event without a payload"))?;
            let inner = inner.clone();
            tokio::spawn(async move { inner.publish_resources(publish).await });
        }
        Some(EventType::AcknowledgeOperationStatus) => {
            let ack = event
                .acknowledge_operation_status
                .ok_or_else(|| anyhow::anyhow!("acknowledgement event without a payload"))?;
            inner
                .acknowledge_operation_status(&ack.operation_uuid, &ack.status_uuid)
                .await?;
        }
        Some(EventType::ReconcileOperations) => {
            let reconcile = event
                .reconcile_operations
                .ok_or_else(|| anyhow::anyhow!("RECONCILE_OPERATIONS event without a payload"))?;
            inner.reconcile_operations(&reconcile.operation_uuids).await;
        }
        _ => warn!(r#type = event.r#type, "Ignoring unknown event type"),
    }
    Ok(())
}

async fn poll_profiles(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.tick().await; // the first tick fires immediately
    loop {
        ticker.tick().await;
        if inner.state.lock().await.connection.is_none() {
            continue;
        }
        match inner.adaptor.fetch_profiles().await {
            Ok(fetched) => {
                let changed = {
                    let mut state = inner.state.lock().await;
                    let changed = fetched != state.profiles;
                    if changed {
                        info!(
                            known = state.profiles.len(),
                            fetched = fetched.len(),
                            "Disk profile set changed"
                        );
                        state.profiles = fetched;
                    }
                    changed
                };
                if changed {
                    if let Err(e) = inner.reconcile_storage_pools().await {
                        error!(error = %e, "Storage pool reconciliation failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Unable to poll the disk profile catalog"),
        }
    }
}

/// Restores identity and durable state from the work directory.
async fn recover(inner: &Arc<Inner>) -> anyhow::Result<()> {
    let provider_id =
        paths::read_latest_symlink(&inner.work_dir, &inner.info.r#type, &inner.info.name).await?;

    let mut state = inner.state.lock().await;
    match provider_id {
        Some(provider_id) => {
            let recovered: ProviderCheckpoint = checkpoint::recover(paths::provider_state_path(
                &inner.work_dir,
                &inner.info.r#type,
                &inner.info.name,
                &provider_id,
            ))
            .await?
            .unwrap_or_default();

            state.provider_id = Some(provider_id.clone());
            state.totals = Resources::new(recovered.resources);
            state.resource_version = if recovered.resource_version.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                recovered.resource_version
            };
            state.profiles = recovered.profiles;
            state.operations = recovered
                .operations
                .into_iter()
                .map(|op| (op.uuid.clone(), op))
                .collect();

            ensure_status_manager(inner, &mut state, &provider_id).await?;

            // Operations interrupted mid-apply cannot be resumed; they are
            // failed deterministically and the control plane learns about
            // it through the status stream
            let interrupted: Vec<String> = state
                .operations
                .values()
                .filter(|op| !op.is_terminated())
                .map(|op| op.uuid.clone())
                .collect();
            for uuid in interrupted {
                let operation = state.operations.get_mut(&uuid).expect("uuid enumerated above");
                let status = OperationStatus {
                    state: OperationState::Dropped as i32,
                    uuid: Some(Uuid::new_v4().to_string()),
                    operation_id: operation.info.as_ref().and_then(|i| i.id.clone()),
                    message: Some("Operation was interrupted by a provider restart".to_string()),
                    converted_resources: Vec::new(),
                };
                operation.statuses.push(status.clone());
                let framework_id = operation.framework_id.clone();
                if let Some(status_manager) = &state.status {
                    status_manager.update(&uuid, framework_id, status).await?;
                }
            }
            inner.checkpoint_state(&state).await?;
            info!(provider_id = %provider_id, "Recovered resource provider state");
        }
        None => {
            state.resource_version = Uuid::new_v4().to_string();
        }
    }
    Ok(())
}

async fn ensure_status_manager(
    inner: &Arc<Inner>,
    state: &mut ProviderState,
    provider_id: &str,
) -> anyhow::Result<()> {
    if state.status.is_some() {
        return Ok(());
    }
    let (status_manager, outbox) = StatusUpdateManager::new(
        &inner.work_dir,
        &inner.info.r#type,
        &inner.info.name,
        provider_id,
    );
    status_manager.recover().await?;
    state.status = Some(status_manager);
    spawn_status_outbox(inner.clone(), outbox);
    Ok(())
}

#[instrument(level = "info", skip(inner, stream_id))]
async fn handle_subscribed(
    inner: &Arc<Inner>,
    provider_id: String,
    stream_id: String,
) -> anyhow::Result<()> {
    {
        let mut state = inner.state.lock().await;
        if state.provider_id.as_deref() != Some(provider_id.as_str()) {
            // First admission: persist the identity before anything else
            paths::point_latest_symlink(
                &inner.work_dir,
                &inner.info.r#type,
                &inner.info.name,
                &provider_id,
            )
            .await?;
            state.provider_id = Some(provider_id.clone());
        }
        ensure_status_manager(inner, &mut state, &provider_id).await?;
        state.connection = Some(Connection {
            provider_id,
            stream_id,
        });
    }

    // Fetch profiles before the first reconciliation so the initial totals
    // carry every known pool
    match inner.adaptor.fetch_profiles().await {
        Ok(profiles) => {
            let mut state = inner.state.lock().await;
            state.profiles = profiles;
        }
        Err(e) => warn!(error = %e, "Unable to fetch disk profiles on subscription"),
    }

    inner.discover_pre_existing_volumes().await;
    inner.reconcile_storage_pools().await?;

    if let Some(status_manager) = inner.status_manager().await {
        status_manager.replay().await;
    }
    Ok(())
}

/// The operation apply pipeline: record, fence, gate, dispatch, report.
#[instrument(level = "info", skip(inner, apply), fields(operation_uuid = %apply.operation_uuid))]
async fn apply_operation(inner: &Arc<Inner>, apply: ApplyOperation) {
    let operation_uuid = apply.operation_uuid.clone();
    let info = match apply.info.clone() {
        Some(info) => info,
        None => {
            warn!("APPLY_OPERATION without operation info, ignoring");
            return;
        }
    };

    enum Gate {
        Pass,
        Drop(&'static str),
    }

    let gate = {
        let mut state = inner.state.lock().await;
        if state.operations.contains_key(&operation_uuid) {
            // Duplicate delivery; the status stream retries handle the rest
            return;
        }

        let gate = if apply.resource_version_uuid != state.resource_version {
            Gate::Drop("Mismatched resource version")
        } else if state.reconciling && !info.is_speculative() {
            Gate::Drop("Storage pool reconciliation is in progress")
        } else {
            Gate::Pass
        };

        let operation = Operation {
            uuid: operation_uuid.clone(),
            framework_id: apply.framework_id.clone(),
            info: Some(info.clone()),
            statuses: vec![OperationStatus {
                state: OperationState::Pending as i32,
                uuid: None,
                operation_id: info.id.clone(),
                message: None,
                converted_resources: Vec::new(),
            }],
        };
        state.operations.insert(operation_uuid.clone(), operation);
        if let Err(e) = inner.checkpoint_state(&state).await {
            error!(error = %e, "Unable to checkpoint operation; failing fast");
            std::process::abort();
        }
        gate
    };

    if let Gate::Drop(reason) = gate {
        info!(reason, "Dropping operation");
        inner
            .finish_operation(
                &operation_uuid,
                OperationState::Dropped,
                Err(anyhow::anyhow!("{}", reason)),
            )
            .await;
        return;
    }

    let outcome = if info.is_speculative() {
        inner.apply_speculative(&info).await
    } else {
        match info.operation_type() {
            OperationType::CreateDisk => inner.apply_create_disk(&operation_uuid, &info).await,
            OperationType::DestroyDisk => apply_destroy_disk(inner, &info).await,
            other => Err(anyhow::anyhow!("unsupported operation type {:?}", other)),
        }
    };

    match outcome {
        Ok(conversion) => {
            inner
                .finish_operation(&operation_uuid, OperationState::Finished, Ok(conversion))
                .await
        }
        Err(e) => {
            inner
                .finish_operation(&operation_uuid, OperationState::Failed, Err(e))
                .await
        }
    }
}

async fn apply_destroy_disk(
    inner: &Arc<Inner>,
    info: &api::OperationInfo,
) -> anyhow::Result<ResourceConversion> {
    let destroy_disk = info
        .destroy_disk
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("'destroy_disk' is required"))?;
    let source = operations::validate_destroy_disk(destroy_disk)?;
    let volume_id = source
        .volume_id()
        .expect("validated destroy source always has an id")
        .to_string();

    inner.volumes.delete_volume(&volume_id).await?;

    let profile_known = {
        let state = inner.state.lock().await;
        source
            .profile()
            .map(|profile| state.profiles.contains_key(profile))
            .unwrap_or(false)
    };

    if !profile_known {
        // The freed capacity has no pool to return to; let a reconciliation
        // rebuild the pools from the plugin's view
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.reconcile_storage_pools().await {
                error!(error = %e, "Reconciliation after destroy failed");
            }
        });
    }

    Ok(operations::destroy_disk_conversion(&source, profile_known))
}

impl Inner {
    async fn status_manager(&self) -> Option<Arc<StatusUpdateManager>> {
        self.state.lock().await.status.clone()
    }

    async fn checkpoint_state(&self, state: &ProviderState) -> anyhow::Result<()> {
        let provider_id = match &state.provider_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let snapshot = ProviderCheckpoint {
            resources: state.totals.to_vec(),
            resource_version: state.resource_version.clone(),
            operations: state.operations.values().cloned().collect(),
            profiles: state.profiles.clone(),
        };
        checkpoint::checkpoint(
            paths::provider_state_path(
                &self.work_dir,
                &self.info.r#type,
                &self.info.name,
                &provider_id,
            ),
            &snapshot,
        )
        .await
    }

    /// One-shot discovery of volumes the plugin already has that the
    /// provider has no record of; they surface as pre-existing RAW
    /// resources.
    async fn discover_pre_existing_volumes(&self) {
        {
            let state = self.state.lock().await;
            if state.discovered {
                return;
            }
        }

        let client = match self.csi_client().await {
            Ok(client) => client,
            Err(_) => return,
        };
        if !client.capabilities.list_volumes {
            self.state.lock().await.discovered = true;
            return;
        }

        let response = call_with_retry("ListVolumes", || {
            let mut controller = client.controller();
            async move {
                controller
                    .list_volumes(k8s_csi::v1_3_0::ListVolumesRequest {
                        max_entries: 0,
                        starting_token: String::new(),
                    })
                    .await
                    .map(|r| r.into_inner())
            }
        })
        .await;

        let entries = match response {
            Ok(response) => response.entries,
            Err(e) => {
                warn!(error = %e, "Unable to list pre-existing volumes");
                return;
            }
        };

        let known = self.volumes.volume_ids().await;
        let mut state = self.state.lock().await;
        for entry in entries {
            let volume = match entry.volume {
                Some(volume) => volume,
                None => continue,
            };
            if known.contains(&volume.volume_id) {
                continue;
            }
            let mut resource = Resource::raw(
                (volume.capacity_bytes / MB).max(0) as u64,
                None,
                Some(&volume.volume_id),
            );
            resource.provider_id = state.provider_id.clone();
            info!(volume_id = %volume.volume_id, "Discovered pre-existing volume");
            state.totals.add(resource);
        }
        state.discovered = true;
    }

    async fn csi_client(&self) -> anyhow::Result<CsiClient> {
        let mut watch = self.client_watch.clone();
        plugin::wait_for_client(&mut watch).await
    }

    /// Queries `GetCapacity` for every known profile and replaces the
    /// storage pools in the totals accordingly. The resource version is
    /// refreshed only when the totals actually changed.
    async fn reconcile_storage_pools(&self) -> anyhow::Result<()> {
        let profiles = {
            let mut state = self.state.lock().await;
            state.reconciling = true;
            state.profiles.clone()
        };

        let result = self.reconcile_pools_inner(profiles).await;

        let mut state = self.state.lock().await;
        state.reconciling = false;
        let changed = match result {
            Ok(changed) => changed,
            Err(e) => {
                drop(state);
                return Err(e);
            }
        };

        if changed {
            state.resource_version = Uuid::new_v4().to_string();
            self.checkpoint_state(&state).await?;
        }
        drop(state);

        self.send_update_state().await
    }

    async fn reconcile_pools_inner(&self, profiles: ProfileMap) -> anyhow::Result<bool> {
        let client = self.csi_client().await?;

        let mut capacities: HashMap<String, u64> = HashMap::new();
        if client.capabilities.get_capacity {
            for (name, info) in &profiles {
                let request = k8s_csi::v1_3_0::GetCapacityRequest {
                    volume_capabilities: vec![info.capability.to_csi()],
                    parameters: info.parameters.clone().into_iter().collect(),
                    accessible_topology: None,
                };
                let response = call_with_retry("GetCapacity", || {
                    let mut controller = client.controller();
                    let request = request.clone();
                    async move {
                        controller
                            .get_capacity(request)
                            .await
                            .map(|r| r.into_inner())
                    }
                })
                .await?;
                capacities.insert(name.clone(), (response.available_capacity / MB).max(0) as u64);
            }
        }

        let mut state = self.state.lock().await;
        let mut changed = false;

        // Pools under profiles that are gone simply disappear
        let stale: Vec<String> = state
            .totals
            .iter()
            .filter(|r| r.is_storage_pool())
            .filter_map(|r| r.profile().map(str::to_string))
            .filter(|profile| !profiles.contains_key(profile))
            .collect();
        for profile in stale {
            info!(profile = %profile, "Removing storage pools of a vanished profile");
            state.totals.take_storage_pools(&profile);
            changed = true;
        }

        for (profile, capacity_mb) in capacities {
            if state.totals.storage_pool_mb(&profile) == capacity_mb {
                continue;
            }
            state.totals.take_storage_pools(&profile);
            let mut pool = Resource::raw(capacity_mb, Some(&profile), None);
            pool.provider_id = state.provider_id.clone();
            pool.reservations = self.info.default_reservations.clone();
            state.totals.add(pool);
            changed = true;
        }

        Ok(changed)
    }

    /// Pushes the full state (totals, outstanding operations, fencing
    /// token) up to the manager.
    async fn send_update_state(&self) -> anyhow::Result<()> {
        let call = {
            let state = self.state.lock().await;
            Call {
                r#type: CallType::UpdateState as i32,
                update_state: Some(UpdateState {
                    resources: state.totals.to_vec(),
                    operations: state.operations.values().cloned().collect(),
                    resource_version_uuid: state.resource_version.clone(),
                }),
                ..Default::default()
            }
        };
        self.send_call(call).await
    }

    async fn send_call(&self, mut call: Call) -> anyhow::Result<()> {
        let (provider_id, stream_id) = {
            let state = self.state.lock().await;
            match &state.connection {
                Some(connection) => (
                    connection.provider_id.clone(),
                    connection.stream_id.clone(),
                ),
                None => anyhow::bail!("provider is not subscribed"),
            }
        };
        call.resource_provider_id = Some(provider_id);

        let response = self
            .http
            .post(&self.endpoint)
            .header(http::header::CONTENT_TYPE, self.content_type.as_media_type())
            .header(STREAM_ID_HEADER, stream_id)
            .body(api::encode(&call, self.content_type)?)
            .send()
            .await?;

        if response.status() != http::StatusCode::ACCEPTED {
            anyhow::bail!(
                "call rejected with {}: {}",
                response.status(),
                String::from_utf8_lossy(&response.bytes().await.unwrap_or_default())
            );
        }
        Ok(())
    }

    async fn apply_speculative(
        &self,
        info: &api::OperationInfo,
    ) -> anyhow::Result<ResourceConversion> {
        let conversion = {
            let state = self.state.lock().await;
            operations::speculative_conversion(info, &state.totals)?
        };

        // DESTROY scrubs the persistent volume's data before the disk is
        // returned to its unparted state
        if info.operation_type() == OperationType::Destroy {
            if let Some(destroy) = &info.destroy {
                for volume in &destroy.volumes {
                    if let Some(volume_id) = volume.volume_id() {
                        let path = self.volumes.published_path(volume_id);
                        if let Err(e) = scrub_directory(&path).await {
                            warn!(volume_id = %volume_id, error = %e, "Unable to scrub persistent volume");
                        }
                    }
                }
            }
        }

        Ok(conversion)
    }

    async fn apply_create_disk(
        &self,
        operation_uuid: &str,
        info: &api::OperationInfo,
    ) -> anyhow::Result<ResourceConversion> {
        let create_disk = info
            .create_disk
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("'create_disk' is required"))?;
        let request = operations::validate_create_disk(create_disk)?;

        let profile_info = {
            let state = self.state.lock().await;
            if !state.totals.contains(&request.source) {
                anyhow::bail!("the source resource is no longer part of the totals");
            }
            state
                .profiles
                .get(&request.profile)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown disk profile {:?}", request.profile))?
        };

        if !profile_info.capability.supports(request.target_type) {
            anyhow::bail!(
                "profile {:?} does not support {:?} disks",
                request.profile,
                request.target_type
            );
        }

        let (volume_id, metadata) = match &request.import_volume_id {
            // The operation uuid doubles as the volume name so retries of
            // the same operation converge on the same volume
            None => {
                self.volumes
                    .create_volume(operation_uuid, request.source.disk_mb, &profile_info)
                    .await?
            }
            Some(import_id) => {
                self.volumes.validate_volume(import_id, &profile_info).await?;
                (import_id.clone(), HashMap::new())
            }
        };

        let mount_root = self.volumes.mount_root();
        Ok(operations::create_disk_conversion(
            &request,
            &volume_id,
            metadata,
            &mount_root.to_string_lossy(),
        ))
    }

    /// Records an operation's terminal status, applies its conversion to
    /// the totals, and hands the status to the delivery stream.
    async fn finish_operation(
        &self,
        operation_uuid: &str,
        terminal_state: OperationState,
        outcome: anyhow::Result<ResourceConversion>,
    ) {
        let mut state = self.state.lock().await;
        let operation = match state.operations.get_mut(operation_uuid) {
            Some(operation) => operation,
            None => {
                error!(operation_uuid, "Finishing an operation that is not recorded");
                return;
            }
        };

        let mut status = OperationStatus {
            state: terminal_state as i32,
            uuid: Some(Uuid::new_v4().to_string()),
            operation_id: operation.info.as_ref().and_then(|i| i.id.clone()),
            message: None,
            converted_resources: Vec::new(),
        };
        let mut conversion = None;
        match outcome {
            Ok(applied) => {
                status.converted_resources = applied.converted.clone();
                conversion = Some(applied);
            }
            Err(e) => {
                status.message = Some(e.to_string());
            }
        }

        operation.statuses.push(status.clone());
        let framework_id = operation.framework_id.clone();

        if let Some(conversion) = conversion {
            if let Err(e) = state.totals.apply(&conversion) {
                // The conversion was validated against the totals up front;
                // failing here means the provider's bookkeeping is broken
                error!(error = %e, "Unable to apply operation conversion; failing fast");
                std::process::abort();
            }
        }

        if let Err(e) = self.checkpoint_state(&state).await {
            error!(error = %e, "Unable to checkpoint provider state; failing fast");
            std::process::abort();
        }

        let status_manager = state.status.clone();
        drop(state);

        if let Some(status_manager) = status_manager {
            if let Err(e) = status_manager
                .update(operation_uuid, framework_id, status)
                .await
            {
                error!(error = %e, "Unable to persist operation status; failing fast");
                std::process::abort();
            }
        }
    }

    async fn acknowledge_operation_status(
        &self,
        operation_uuid: &str,
        status_uuid: &str,
    ) -> anyhow::Result<()> {
        let status_manager = match self.status_manager().await {
            Some(status_manager) => status_manager,
            None => return Ok(()),
        };
        let terminated = status_manager.acknowledge(operation_uuid, status_uuid).await?;
        if terminated {
            let mut state = self.state.lock().await;
            state.operations.remove(operation_uuid);
            self.checkpoint_state(&state).await?;
            debug!(operation_uuid, "Operation record garbage-collected");
        }
        Ok(())
    }

    /// Answers a reconciliation request from the provider's own operation
    /// records: known operations replay their latest status, unknown uuids
    /// get `OPERATION_DROPPED`.
    async fn reconcile_operations(&self, operation_uuids: &[String]) {
        let replies: Vec<UpdateOperationStatus> = {
            let state = self.state.lock().await;
            operation_uuids
                .iter()
                .map(|uuid| match state.operations.get(uuid) {
                    Some(operation) => {
                        let latest = operation.latest_status().cloned();
                        UpdateOperationStatus {
                            operation_uuid: uuid.clone(),
                            framework_id: operation.framework_id.clone(),
                            status: latest.clone(),
                            latest_status: latest,
                        }
                    }
                    None => UpdateOperationStatus {
                        operation_uuid: uuid.clone(),
                        framework_id: None,
                        status: Some(OperationStatus {
                            state: OperationState::Dropped as i32,
                            uuid: None,
                            operation_id: None,
                            message: Some("Unknown operation".to_string()),
                            converted_resources: Vec::new(),
                        }),
                        latest_status: None,
                    },
                })
                .collect()
        };

        for update in replies {
            let call = Call {
                r#type: CallType::UpdateOperationStatus as i32,
                update_operation_status: Some(update),
                ..Default::default()
            };
            if let Err(e) = self.send_call(call).await {
                warn!(error = %e, "Unable to send reconciliation reply");
            }
        }
    }

    /// Drives every addressed volume to `PUBLISHED` and reports the publish
    /// verdict back to the manager.
    #[instrument(level = "info", skip(self, publish), fields(uuid = %publish.uuid))]
    async fn publish_resources(&self, publish: PublishResources) {
        let mut result = Ok(());
        for resource in &publish.resources {
            if let Some(volume_id) = resource.volume_id() {
                if let Err(e) = self.volumes.publish_volume(volume_id).await {
                    error!(volume_id = %volume_id, error = %e, "Unable to publish volume");
                    result = Err(e);
                    break;
                }
            }
        }

        let status = if result.is_ok() {
            PublishResourcesStatus::Ok
        } else {
            PublishResourcesStatus::Failed
        };
        let call = Call {
            r#type: CallType::UpdatePublishResourcesStatus as i32,
            update_publish_resources_status: Some(UpdatePublishResourcesStatus {
                uuid: publish.uuid.clone(),
                status: status as i32,
            }),
            ..Default::default()
        };
        if let Err(e) = self.send_call(call).await {
            warn!(error = %e, "Unable to report publish status");
        }
    }
}

fn spawn_status_outbox(
    inner: Arc<Inner>,
    mut outbox: mpsc::UnboundedReceiver<UpdateOperationStatus>,
) {
    tokio::spawn(async move {
        while let Some(update) = outbox.recv().await {
            let call = Call {
                r#type: CallType::UpdateOperationStatus as i32,
                update_operation_status: Some(update),
                ..Default::default()
            };
            if let Err(e) = inner.send_call(call).await {
                // The status manager's retry loop redelivers after the next
                // subscription
                debug!(error = %e, "Status update not sent");
            }
        }
    });
}

/// Removes the contents of a directory without removing the directory
/// itself (the filesystem-scrub step of DESTROY).
async fn scrub_directory(path: &std::path::Path) -> anyhow::Result<()> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
