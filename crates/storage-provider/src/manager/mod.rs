//! The resource provider manager (the agent side of the provider API). It
//! accepts `Call`s on a single HTTP endpoint, multiplexes one long-lived
//! event stream per subscribed provider, admits identities through the
//! registrar, fans publish requests in, and surfaces state and status
//! updates to the embedding agent through a message queue.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use futures::future;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, Response, StatusCode};
use hyper::Body;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use warp::Filter;

use crate::api::{
    self, AcknowledgeOperationStatus, ApplyOperation, Call, CallType, ContentType, Event,
    EventType, PublishResources, PublishResourcesStatus, Resource, ResourceProviderInfo,
    Subscribed, UpdateOperationStatus, UpdateState, STREAM_ID_HEADER,
};
use crate::recordio;
use crate::registrar::{Registrar, RegistryOperation};

/// Messages the manager forwards to whatever embeds it (the agent).
#[derive(Clone, Debug)]
pub enum ResourceProviderMessage {
    Subscribed {
        provider_id: String,
    },
    Disconnected {
        provider_id: String,
    },
    UpdateState {
        provider_id: String,
        update: UpdateState,
    },
    UpdateOperationStatus {
        update: UpdateOperationStatus,
    },
}

struct Subscription {
    stream_id: String,
    info: ResourceProviderInfo,
    events: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct ManagerState {
    subscriptions: HashMap<String, Subscription>,
    pending_publishes: HashMap<String, PendingPublish>,
}

struct PendingPublish {
    provider_id: String,
    result: oneshot::Sender<anyhow::Result<()>>,
}

pub struct ResourceProviderManager {
    registrar: Arc<Registrar>,
    state: Arc<RwLock<ManagerState>>,
    messages: mpsc::UnboundedSender<ResourceProviderMessage>,
}

impl ResourceProviderManager {
    pub fn new(
        registrar: Arc<Registrar>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<ResourceProviderMessage>,
    ) {
        let (messages, inbox) = mpsc::unbounded_channel();
        (
            Arc::new(ResourceProviderManager {
                registrar,
                state: Arc::new(RwLock::new(ManagerState::default())),
                messages,
            }),
            inbox,
        )
    }

    /// The warp filter serving the provider endpoint at
    /// `POST /api/v1/resource_provider`. Takes a clone of the manager
    /// handle; the filter keeps it alive for as long as the server runs.
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (Response<Body>,), Error = warp::Rejection> + Clone {
        let manager = self;
        let endpoint = warp::path!("api" / "v1" / "resource_provider");

        let calls = endpoint
            .and(warp::post())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and_then(move |headers: HeaderMap, body: hyper::body::Bytes| {
                let manager = manager.clone();
                async move {
                    Ok::<_, warp::Rejection>(manager.handle_call(headers, body.as_ref()).await)
                }
            });

        // Anything else on the endpoint path is a method error
        let method_not_allowed = endpoint.map(|| {
            plain_response(StatusCode::METHOD_NOT_ALLOWED, "expecting a POST request")
        });

        calls.or(method_not_allowed).unify()
    }

    /// Dispatches one HTTP call against the endpoint.
    pub async fn handle_call(&self, headers: HeaderMap, body: &[u8]) -> Response<Body> {
        let content_type = match headers.get(CONTENT_TYPE) {
            None => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    "expecting a 'Content-Type' header",
                )
            }
            Some(value) => match value.to_str().ok().and_then(ContentType::from_media_type) {
                Some(content_type) => content_type,
                None => {
                    return plain_response(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "unsupported media type",
                    )
                }
            },
        };

        let call: Call = match api::decode(body, content_type) {
            Ok(call) => call,
            Err(e) => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    format!("unable to parse call: {}", e),
                )
            }
        };

        match CallType::from_i32(call.r#type) {
            Some(CallType::Subscribe) => self.subscribe(&headers, content_type, call).await,
            Some(_) => self.forward(&headers, call).await,
            None => plain_response(StatusCode::BAD_REQUEST, "unknown call type"),
        }
    }

    #[instrument(level = "info", skip(self, headers, call))]
    async fn subscribe(
        &self,
        headers: &HeaderMap,
        content_type: ContentType,
        call: Call,
    ) -> Response<Body> {
        let accept = match negotiate_accept(headers, content_type) {
            Some(accept) => accept,
            None => return plain_response(StatusCode::NOT_ACCEPTABLE, "not acceptable"),
        };

        let mut info = match call.subscribe.and_then(|s| s.info) {
            Some(info) => info,
            None => {
                return plain_response(StatusCode::BAD_REQUEST, "expecting 'subscribe.info'")
            }
        };

        let registry = self.registrar.registry().await;
        let provider_id = match &info.id {
            None => {
                // First subscription of a new provider: assign an id and
                // admit it
                let id = Uuid::new_v4().to_string();
                info.id = Some(id.clone());
                match self
                    .registrar
                    .apply(RegistryOperation::AdmitResourceProvider(info.clone()))
                    .await
                {
                    Ok(_) => id,
                    Err(e) => {
                        error!(error = %e, "Unable to admit resource provider");
                        return plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("unable to admit resource provider: {}", e),
                        );
                    }
                }
            }
            Some(id) => match registry.get(id) {
                Some(stored) => {
                    // Type and name are immutable after admission
                    if stored.r#type != info.r#type || stored.name != info.name {
                        warn!(provider_id = %id, "Resubscription with a changed identity");
                        return plain_response(
                            StatusCode::BAD_REQUEST,
                            "resource provider type and name are immutable",
                        );
                    }
                    id.clone()
                }
                None => {
                    // The provider presented an id we have no record of
                    warn!(provider_id = %id, "Subscription from unknown resource provider");
                    return plain_response(
                        StatusCode::BAD_REQUEST,
                        "unknown resource provider id",
                    );
                }
            },
        };

        let stream_id = Uuid::new_v4().to_string();
        let (events, event_rx) = mpsc::unbounded_channel::<Event>();

        let mut subscribed = Event {
            r#type: EventType::Subscribed as i32,
            ..Default::default()
        };
        subscribed.subscribed = Some(Subscribed {
            provider_id: provider_id.clone(),
        });
        let _ = events.send(subscribed);

        {
            let mut state = self.state.write().await;
            if let Some(old) = state.subscriptions.insert(
                provider_id.clone(),
                Subscription {
                    stream_id: stream_id.clone(),
                    info,
                    events,
                },
            ) {
                // An already-subscribed provider subscribing again replaces
                // the connection; the replaced stream ends when its sender
                // drops here
                info!(provider_id = %provider_id, old_stream = %old.stream_id, "Replacing subscription");
                fail_pending_publishes(&mut state, &provider_id);
            }
        }

        let _ = self.messages.send(ResourceProviderMessage::Subscribed {
            provider_id: provider_id.clone(),
        });

        let body = self.stream_events(provider_id, stream_id.clone(), accept, event_rx);

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, accept.as_media_type())
            .header(STREAM_ID_HEADER, stream_id)
            .body(body)
            .expect("subscribe response is statically well-formed")
    }

    /// Spawns the task pumping events into the chunked response body and
    /// returns that body.
    fn stream_events(
        &self,
        provider_id: String,
        stream_id: String,
        accept: ContentType,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Body {
        let (mut sender, body) = Body::channel();
        let cleanup = SubscriptionCleanup {
            provider_id,
            stream_id,
            messages: self.messages.clone(),
        };
        // The task only needs the shared state for cleanup, not the whole
        // manager, which keeps ownership acyclic
        let manager_state = self.state.clone();

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let bytes = match api::encode(&event, accept) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "Unable to encode event, dropping stream");
                        break;
                    }
                };
                if sender
                    .send_data(recordio::encode_frame(&bytes).into())
                    .await
                    .is_err()
                {
                    debug!(provider_id = %cleanup.provider_id, "Subscriber went away");
                    break;
                }
            }
            cleanup.run(&manager_state).await;
        });

        body
    }

    async fn forward(&self, headers: &HeaderMap, call: Call) -> Response<Body> {
        let provider_id = match &call.resource_provider_id {
            Some(id) => id.clone(),
            None => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    "expecting 'resource_provider_id'",
                )
            }
        };

        {
            let state = self.state.read().await;
            let subscription = match state.subscriptions.get(&provider_id) {
                Some(subscription) => subscription,
                None => {
                    return plain_response(
                        StatusCode::BAD_REQUEST,
                        "resource provider is not subscribed",
                    )
                }
            };
            let stream_id = headers
                .get(STREAM_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if stream_id != subscription.stream_id {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    "stream id does not match the subscription",
                );
            }
        }

        match CallType::from_i32(call.r#type) {
            Some(CallType::UpdateState) => {
                let update = match call.update_state {
                    Some(update) => update,
                    None => {
                        return plain_response(StatusCode::BAD_REQUEST, "expecting 'update_state'")
                    }
                };
                let _ = self.messages.send(ResourceProviderMessage::UpdateState {
                    provider_id,
                    update,
                });
            }
            Some(CallType::UpdateOperationStatus) => {
                let update = match call.update_operation_status {
                    Some(update) => update,
                    None => {
                        return plain_response(
                            StatusCode::BAD_REQUEST,
                            "expecting 'update_operation_status'",
                        )
                    }
                };
                let _ = self
                    .messages
                    .send(ResourceProviderMessage::UpdateOperationStatus { update });
            }
            Some(CallType::UpdatePublishResourcesStatus) => {
                let update = match call.update_publish_resources_status {
                    Some(update) => update,
                    None => {
                        return plain_response(
                            StatusCode::BAD_REQUEST,
                            "expecting 'update_publish_resources_status'",
                        )
                    }
                };
                let mut state = self.state.write().await;
                if let Some(pending) = state.pending_publishes.remove(&update.uuid) {
                    let result = if update.status == PublishResourcesStatus::Ok as i32 {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(
                            "provider {} failed to publish resources",
                            pending.provider_id
                        ))
                    };
                    let _ = pending.result.send(result);
                } else {
                    warn!(uuid = %update.uuid, "Publish status for unknown publish");
                }
            }
            _ => return plain_response(StatusCode::BAD_REQUEST, "unexpected call type"),
        }

        plain_response(StatusCode::ACCEPTED, "")
    }

    /// Sends an operation to a subscribed provider.
    pub async fn apply_operation(
        &self,
        provider_id: &str,
        operation: ApplyOperation,
    ) -> anyhow::Result<()> {
        let mut event = Event {
            r#type: EventType::ApplyOperation as i32,
            ..Default::default()
        };
        event.apply_operation = Some(operation);
        self.send_event(provider_id, event).await
    }

    /// Forwards an acknowledgement from the control plane to the provider.
    pub async fn acknowledge_operation_status(
        &self,
        provider_id: &str,
        acknowledgement: AcknowledgeOperationStatus,
    ) -> anyhow::Result<()> {
        let mut event = Event {
            r#type: EventType::AcknowledgeOperationStatus as i32,
            ..Default::default()
        };
        event.acknowledge_operation_status = Some(acknowledgement);
        self.send_event(provider_id, event).await
    }

    /// Asks a provider for the fate of the given operations.
    pub async fn reconcile_operations(
        &self,
        provider_id: &str,
        operation_uuids: Vec<String>,
    ) -> anyhow::Result<()> {
        let mut event = Event {
            r#type: EventType::ReconcileOperations as i32,
            ..Default::default()
        };
        event.reconcile_operations = Some(api::ReconcileOperations { operation_uuids });
        self.send_event(provider_id, event).await
    }

    /// Publishes resources to their providers. Resources are grouped by
    /// provider id, each group gets a publish uuid, and the returned future
    /// resolves once every group has been acknowledged `OK`. It fails on the
    /// first `FAILED` acknowledgement or provider disconnection.
    pub async fn publish_resources(&self, resources: &[Resource]) -> anyhow::Result<()> {
        let mut groups: HashMap<String, Vec<Resource>> = HashMap::new();
        for resource in resources {
            if let Some(provider_id) = &resource.provider_id {
                groups
                    .entry(provider_id.clone())
                    .or_default()
                    .push(resource.clone());
            }
        }

        let mut receivers = Vec::new();
        {
            let mut state = self.state.write().await;
            for (provider_id, group) in groups {
                let subscription = state
                    .subscriptions
                    .get(&provider_id)
                    .ok_or_else(|| {
                        anyhow::anyhow!("resource provider {} is not subscribed", provider_id)
                    })?;

                let uuid = Uuid::new_v4().to_string();
                let mut event = Event {
                    r#type: EventType::PublishResources as i32,
                    ..Default::default()
                };
                event.publish_resources = Some(PublishResources {
                    uuid: uuid.clone(),
                    resources: group,
                });
                subscription
                    .events
                    .send(event)
                    .map_err(|_| anyhow::anyhow!("subscription stream is closed"))?;

                let (tx, rx) = oneshot::channel();
                state.pending_publishes.insert(
                    uuid,
                    PendingPublish {
                        provider_id,
                        result: tx,
                    },
                );
                receivers.push(rx);
            }
        }

        for result in future::join_all(receivers).await {
            result.map_err(|_| anyhow::anyhow!("publish cancelled by disconnection"))??;
        }
        Ok(())
    }

    /// The identity a provider subscribed with, if it is currently
    /// subscribed.
    pub async fn subscribed_info(&self, provider_id: &str) -> Option<ResourceProviderInfo> {
        let state = self.state.read().await;
        state
            .subscriptions
            .get(provider_id)
            .map(|s| s.info.clone())
    }

    async fn send_event(&self, provider_id: &str, event: Event) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let subscription = state
            .subscriptions
            .get(provider_id)
            .ok_or_else(|| anyhow::anyhow!("resource provider {} is not subscribed", provider_id))?;
        subscription
            .events
            .send(event)
            .map_err(|_| anyhow::anyhow!("subscription stream is closed"))
    }
}

struct SubscriptionCleanup {
    provider_id: String,
    stream_id: String,
    messages: mpsc::UnboundedSender<ResourceProviderMessage>,
}

impl SubscriptionCleanup {
    async fn run(self, state: &RwLock<ManagerState>) {
        let mut state = state.write().await;
        let still_current = state
            .subscriptions
            .get(&self.provider_id)
            .map(|s| s.stream_id == self.stream_id)
            .unwrap_or(false);
        if still_current {
            state.subscriptions.remove(&self.provider_id);
            fail_pending_publishes(&mut state, &self.provider_id);
            let _ = self.messages.send(ResourceProviderMessage::Disconnected {
                provider_id: self.provider_id,
            });
        }
    }
}

fn fail_pending_publishes(state: &mut ManagerState, provider_id: &str) {
    let uuids: Vec<String> = state
        .pending_publishes
        .iter()
        .filter(|(_, p)| p.provider_id == provider_id)
        .map(|(uuid, _)| uuid.clone())
        .collect();
    for uuid in uuids {
        if let Some(pending) = state.pending_publishes.remove(&uuid) {
            let _ = pending.result.send(Err(anyhow::anyhow!(
                "resource provider {} disconnected before acknowledging publish",
                provider_id
            )));
        }
    }
}

/// Picks the event encoding: the `Accept` header wins when present, the
/// request's own content type otherwise. `None` means nothing we speak is
/// acceptable.
fn negotiate_accept(headers: &HeaderMap, content_type: ContentType) -> Option<ContentType> {
    let accept = match headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
        None => return Some(content_type),
        Some(value) => value,
    };

    for media_type in accept.split(',') {
        let media_type = media_type.trim();
        if media_type.starts_with("*/*") {
            return Some(content_type);
        }
        if let Some(accepted) = ContentType::from_media_type(media_type) {
            return Some(accepted);
        }
    }
    None
}

fn plain_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.into()))
        .expect("plain response is statically well-formed")
}

/// Convenience for embedding: serves the manager endpoint on the given
/// address until the process exits.
pub async fn serve(
    manager: Arc<ResourceProviderManager>,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let routes = manager.routes().recover(handle_rejection);
    warp::serve(routes).run(addr).await;
    Ok(())
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    if err.is_not_found() {
        Ok(warp::reply::with_status(
            "not found",
            StatusCode::NOT_FOUND,
        ))
    } else {
        Ok(warp::reply::with_status(
            "bad request",
            StatusCode::BAD_REQUEST,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{CallType, Subscribe};
    use crate::recordio::RecordIoDecoder;
    use hyper::body::HttpBody;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    fn subscribe_call(id: Option<&str>, name: &str) -> Call {
        Call {
            r#type: CallType::Subscribe as i32,
            resource_provider_id: None,
            subscribe: Some(Subscribe {
                info: Some(ResourceProviderInfo {
                    r#type: "org.storlet.rp.local.storage".to_string(),
                    name: name.to_string(),
                    id: id.map(str::to_string),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }
    }

    async fn setup() -> (
        tempfile::TempDir,
        Arc<ResourceProviderManager>,
        mpsc::UnboundedReceiver<ResourceProviderMessage>,
    ) {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let registrar = Arc::new(Registrar::recover(tempdir.path()).await.unwrap());
        let (manager, inbox) = ResourceProviderManager::new(registrar);
        (tempdir, manager, inbox)
    }

    /// Subscribes and returns (provider id, stream id, response body).
    async fn subscribe(
        manager: &Arc<ResourceProviderManager>,
        call: Call,
    ) -> (String, String, Body) {
        let mut response = manager
            .handle_call(json_headers(), &serde_json::to_vec(&call).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .expect("subscribe response must carry a stream id")
            .to_str()
            .unwrap()
            .to_string();

        let chunk = response
            .body_mut()
            .data()
            .await
            .expect("stream should produce the subscribed event")
            .expect("stream should not error");
        let mut decoder = RecordIoDecoder::new();
        let records = decoder.decode(&chunk).unwrap();
        let event: Event = api::decode(&records[0], ContentType::Json).unwrap();
        assert_eq!(event.r#type, EventType::Subscribed as i32);
        let provider_id = event.subscribed.unwrap().provider_id;

        (provider_id, stream_id, response.into_body())
    }

    async fn next_event(body: &mut Body, decoder: &mut RecordIoDecoder) -> Event {
        loop {
            let chunk = body
                .data()
                .await
                .expect("stream should stay open")
                .expect("stream should not error");
            let mut records = decoder.decode(&chunk).unwrap();
            if let Some(record) = records.pop() {
                return api::decode(&record, ContentType::Json).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn missing_content_type_is_bad_request() {
        let (_tempdir, manager, _inbox) = setup().await;
        let response = manager.handle_call(HeaderMap::new(), b"{}").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_content_type_is_rejected() {
        let (_tempdir, manager, _inbox) = setup().await;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        let response = manager.handle_call(headers, b"{}").await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unparsable_call_is_bad_request() {
        let (_tempdir, manager, _inbox) = setup().await;
        let response = manager.handle_call(json_headers(), b"{ nope").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unacceptable_accept_header_is_not_acceptable() {
        let (_tempdir, manager, _inbox) = setup().await;
        let mut headers = json_headers();
        headers.insert(ACCEPT, "text/html".parse().unwrap());
        let response = manager
            .handle_call(
                headers,
                &serde_json::to_vec(&subscribe_call(None, "test")).unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn call_from_unsubscribed_provider_is_bad_request() {
        let (_tempdir, manager, _inbox) = setup().await;
        let call = Call {
            r#type: CallType::UpdateState as i32,
            resource_provider_id: Some("nope".to_string()),
            update_state: Some(UpdateState::default()),
            ..Default::default()
        };
        let response = manager
            .handle_call(json_headers(), &serde_json::to_vec(&call).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscribe_assigns_and_keeps_provider_id() {
        let (_tempdir, manager, mut inbox) = setup().await;

        let (provider_id, _, _body) = subscribe(&manager, subscribe_call(None, "test")).await;
        assert!(matches!(
            inbox.recv().await,
            Some(ResourceProviderMessage::Subscribed { provider_id: id }) if id == provider_id
        ));

        // Resubscription with the assigned id yields the same id
        let (again, _, _body2) =
            subscribe(&manager, subscribe_call(Some(&provider_id), "test")).await;
        assert_eq!(again, provider_id);
    }

    #[tokio::test]
    async fn resubscription_with_changed_identity_is_rejected() {
        let (_tempdir, manager, _inbox) = setup().await;
        let (provider_id, _, _body) = subscribe(&manager, subscribe_call(None, "test")).await;

        let call = subscribe_call(Some(&provider_id), "different");
        let response = manager
            .handle_call(json_headers(), &serde_json::to_vec(&call).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_provider_id_is_rejected() {
        let (_tempdir, manager, _inbox) = setup().await;
        let call = subscribe_call(Some("never-admitted"), "test");
        let response = manager
            .handle_call(json_headers(), &serde_json::to_vec(&call).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_id_mismatch_is_rejected() {
        let (_tempdir, manager, _inbox) = setup().await;
        let (provider_id, _stream_id, _body) =
            subscribe(&manager, subscribe_call(None, "test")).await;

        let call = Call {
            r#type: CallType::UpdateState as i32,
            resource_provider_id: Some(provider_id),
            update_state: Some(UpdateState::default()),
            ..Default::default()
        };
        let mut headers = json_headers();
        headers.insert(STREAM_ID_HEADER, "wrong".parse().unwrap());
        let response = manager
            .handle_call(headers, &serde_json::to_vec(&call).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn publish_resolves_after_ok_acknowledgement() {
        let (_tempdir, manager, _inbox) = setup().await;
        let (provider_id, stream_id, mut body) =
            subscribe(&manager, subscribe_call(None, "test")).await;

        let mut resource = Resource::raw(1024, Some("test"), Some("vol-1"));
        resource.provider_id = Some(provider_id.clone());

        let publisher = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.publish_resources(&[resource]).await })
        };

        let mut decoder = RecordIoDecoder::new();
        let event = next_event(&mut body, &mut decoder).await;
        assert_eq!(event.r#type, EventType::PublishResources as i32);
        let publish = event.publish_resources.unwrap();
        assert_eq!(publish.resources.len(), 1);

        let ack = Call {
            r#type: CallType::UpdatePublishResourcesStatus as i32,
            resource_provider_id: Some(provider_id),
            update_publish_resources_status: Some(crate::api::UpdatePublishResourcesStatus {
                uuid: publish.uuid,
                status: PublishResourcesStatus::Ok as i32,
            }),
            ..Default::default()
        };
        let mut headers = json_headers();
        headers.insert(STREAM_ID_HEADER, stream_id.parse().unwrap());
        let response = manager
            .handle_call(headers, &serde_json::to_vec(&ack).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        publisher
            .await
            .unwrap()
            .expect("publish should resolve once acknowledged OK");
    }
}
