//! Reliable at-least-once delivery of operation status updates. Each
//! operation has its own ordered stream: the oldest unacknowledged status is
//! (re)transmitted with capped exponential backoff until the control plane
//! acknowledges it, and a terminal status stays in the stream until its
//! acknowledgement garbage-collects the whole stream.
//!
//! Every status and acknowledgement is appended to a per-operation log
//! before anything else happens, so a restart replays exactly the
//! undelivered tail.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::api::{OperationState, OperationStatus, UpdateOperationStatus};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::checkpoint;
use crate::paths;

/// Minimum interval before an unacknowledged update is retransmitted.
const RETRY_BASE: Duration = Duration::from_secs(10);
const RETRY_CAP: Duration = Duration::from_secs(300);
/// How often the retry loop looks for due retransmissions.
const TICK: Duration = Duration::from_secs(1);

/// One record of the per-operation append log.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogRecord {
    Update {
        framework_id: Option<String>,
        status: OperationStatus,
    },
    Ack {
        status_uuid: String,
    },
}

struct Stream {
    framework_id: Option<String>,
    /// Full status history, for reconciliation replies.
    statuses: Vec<OperationStatus>,
    /// Statuses not yet acknowledged, oldest first. Only the front is ever
    /// in flight.
    unacked: VecDeque<OperationStatus>,
    backoff: ExponentialBackoffStrategy,
    next_retry: Option<Instant>,
}

impl Stream {
    fn new(framework_id: Option<String>) -> Self {
        Stream {
            framework_id,
            statuses: Vec::new(),
            unacked: VecDeque::new(),
            backoff: ExponentialBackoffStrategy::new(RETRY_BASE, RETRY_CAP),
            next_retry: None,
        }
    }

    fn latest_status(&self) -> Option<&OperationStatus> {
        self.statuses.last()
    }
}

pub struct StatusUpdateManager {
    work_dir: PathBuf,
    provider_type: String,
    provider_name: String,
    provider_id: String,
    streams: Mutex<HashMap<String, Stream>>,
    forward: mpsc::UnboundedSender<UpdateOperationStatus>,
}

impl StatusUpdateManager {
    /// Creates the manager and starts its retry loop. Updates due for
    /// (re)transmission are emitted on the returned receiver; the embedding
    /// provider turns them into `UPDATE_OPERATION_STATUS` calls.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        provider_type: &str,
        provider_name: &str,
        provider_id: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpdateOperationStatus>) {
        let (forward, outbox) = mpsc::unbounded_channel();
        let manager = Arc::new(StatusUpdateManager {
            work_dir: work_dir.into(),
            provider_type: provider_type.to_string(),
            provider_name: provider_name.to_string(),
            provider_id: provider_id.to_string(),
            streams: Mutex::new(HashMap::new()),
            forward,
        });

        let retry_manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                ticker.tick().await;
                retry_manager.retransmit_due().await;
            }
        });

        (manager, outbox)
    }

    fn log_path(&self, operation_uuid: &str) -> PathBuf {
        paths::operation_updates_path(
            &self.work_dir,
            &self.provider_type,
            &self.provider_name,
            &self.provider_id,
            operation_uuid,
        )
    }

    fn operations_dir(&self) -> PathBuf {
        self.log_path("x")
            .parent()
            .and_then(|p| p.parent())
            .expect("updates path always has an operations dir above it")
            .to_owned()
    }

    /// Rebuilds streams from the on-disk logs. Unterminated streams resume
    /// delivery immediately.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let operations_dir = self.operations_dir();
        tokio::fs::create_dir_all(&operations_dir).await?;

        let dirs: Vec<PathBuf> = ReadDirStream::new(tokio::fs::read_dir(&operations_dir).await?)
            .map(|res| res.map(|entry| entry.path()))
            .collect::<Result<Vec<PathBuf>, _>>()
            .await?;

        let mut streams = self.streams.lock().await;
        for dir in dirs {
            let operation_uuid = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let records: Vec<LogRecord> =
                checkpoint::read_records(self.log_path(&operation_uuid)).await?;

            let mut stream = Stream::new(None);
            for record in records {
                match record {
                    LogRecord::Update {
                        framework_id,
                        status,
                    } => {
                        stream.framework_id = framework_id;
                        stream.statuses.push(status.clone());
                        stream.unacked.push_back(status);
                    }
                    LogRecord::Ack { status_uuid } => {
                        stream
                            .unacked
                            .retain(|s| s.uuid.as_deref() != Some(status_uuid.as_str()));
                    }
                }
            }

            let fully_acked_terminal = stream.unacked.is_empty()
                && stream
                    .latest_status()
                    .map(OperationStatus::is_terminal)
                    .unwrap_or(false);
            if fully_acked_terminal || stream.statuses.is_empty() {
                // Nothing left to deliver; a crash raced the stream GC
                drop(tokio::fs::remove_dir_all(&dir).await);
                continue;
            }

            if !stream.unacked.is_empty() {
                stream.next_retry = Some(Instant::now());
            }
            info!(
                operation_uuid = %operation_uuid,
                pending = stream.unacked.len(),
                "Recovered operation status stream"
            );
            streams.insert(operation_uuid, stream);
        }
        Ok(())
    }

    /// Appends a status to its operation's stream and offers it for
    /// delivery. The log write happens before anything becomes visible.
    pub async fn update(
        &self,
        operation_uuid: &str,
        framework_id: Option<String>,
        status: OperationStatus,
    ) -> anyhow::Result<()> {
        checkpoint::append_record(
            self.log_path(operation_uuid),
            &LogRecord::Update {
                framework_id: framework_id.clone(),
                status: status.clone(),
            },
        )
        .await?;

        let mut streams = self.streams.lock().await;
        let stream = streams
            .entry(operation_uuid.to_string())
            .or_insert_with(|| Stream::new(framework_id));
        stream.statuses.push(status.clone());
        stream.unacked.push_back(status);

        // A freshly queued head goes out right away
        if stream.unacked.len() == 1 {
            self.transmit(operation_uuid, stream);
        }
        Ok(())
    }

    /// Processes an acknowledgement. Returns true when the acknowledged
    /// status was terminal and the stream has been garbage-collected.
    pub async fn acknowledge(
        &self,
        operation_uuid: &str,
        status_uuid: &str,
    ) -> anyhow::Result<bool> {
        let mut streams = self.streams.lock().await;
        let stream = match streams.get_mut(operation_uuid) {
            Some(stream) => stream,
            None => {
                warn!(
                    operation_uuid = %operation_uuid,
                    "Acknowledgement for unknown operation stream"
                );
                return Ok(false);
            }
        };

        match stream.unacked.front() {
            Some(head) if head.uuid.as_deref() == Some(status_uuid) => {}
            _ => {
                // Duplicate or out-of-order ack; the front retransmission
                // keeps the stream moving
                debug!(
                    operation_uuid = %operation_uuid,
                    status_uuid = %status_uuid,
                    "Ignoring stale acknowledgement"
                );
                return Ok(false);
            }
        }

        checkpoint::append_record(
            self.log_path(operation_uuid),
            &LogRecord::Ack {
                status_uuid: status_uuid.to_string(),
            },
        )
        .await?;

        let acked = stream.unacked.pop_front().expect("front checked above");
        stream.backoff.reset();
        stream.next_retry = None;

        if stream.unacked.is_empty() && acked.is_terminal() {
            streams.remove(operation_uuid);
            let dir = self
                .log_path(operation_uuid)
                .parent()
                .map(|p| p.to_owned())
                .expect("updates path always has a parent");
            drop(tokio::fs::remove_dir_all(dir).await);
            info!(operation_uuid = %operation_uuid, "Operation stream terminated and pruned");
            return Ok(true);
        }

        // Deliver the next queued status immediately
        if !stream.unacked.is_empty() {
            let stream_uuid = operation_uuid.to_string();
            self.transmit(&stream_uuid, stream);
        }
        Ok(false)
    }

    /// Re-offers the front of every stream right away, used after a
    /// (re)subscription.
    pub async fn replay(&self) {
        let mut streams = self.streams.lock().await;
        let uuids: Vec<String> = streams.keys().cloned().collect();
        for uuid in uuids {
            let stream = streams.get_mut(&uuid).expect("key enumerated above");
            if !stream.unacked.is_empty() {
                self.transmit(&uuid, stream);
            }
        }
    }

    /// Builds reconciliation replies: known streams answer with their latest
    /// status, unknown uuids with `OPERATION_DROPPED`.
    pub async fn reconcile(&self, operation_uuids: &[String]) -> Vec<UpdateOperationStatus> {
        let streams = self.streams.lock().await;
        operation_uuids
            .iter()
            .map(|uuid| match streams.get(uuid) {
                Some(stream) => {
                    let latest = stream.latest_status().cloned();
                    UpdateOperationStatus {
                        operation_uuid: uuid.clone(),
                        framework_id: stream.framework_id.clone(),
                        status: latest.clone(),
                        latest_status: latest,
                    }
                }
                None => UpdateOperationStatus {
                    operation_uuid: uuid.clone(),
                    framework_id: None,
                    status: Some(OperationStatus {
                        state: OperationState::Dropped as i32,
                        // No uuid: a reconciliation verdict is not
                        // acknowledged or retried
                        uuid: None,
                        operation_id: None,
                        message: Some("Unknown operation".to_string()),
                        converted_resources: Vec::new(),
                    }),
                    latest_status: None,
                },
            })
            .collect()
    }

    async fn retransmit_due(&self) {
        let now = Instant::now();
        let mut streams = self.streams.lock().await;
        let due: Vec<String> = streams
            .iter()
            .filter(|(_, s)| s.next_retry.map(|at| at <= now).unwrap_or(false))
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in due {
            let stream = streams.get_mut(&uuid).expect("key enumerated above");
            if stream.unacked.is_empty() {
                stream.next_retry = None;
                continue;
            }
            debug!(operation_uuid = %uuid, "Retransmitting unacknowledged operation status");
            self.transmit(&uuid, stream);
        }
    }

    fn transmit(&self, operation_uuid: &str, stream: &mut Stream) {
        let head = match stream.unacked.front() {
            Some(head) => head.clone(),
            None => return,
        };
        let update = UpdateOperationStatus {
            operation_uuid: operation_uuid.to_string(),
            framework_id: stream.framework_id.clone(),
            status: Some(head),
            latest_status: stream.latest_status().cloned(),
        };
        if self.forward.send(update).is_err() {
            warn!("Status update outbox is closed; updates will be retried after resubscription");
        }
        stream.next_retry = Some(Instant::now() + stream.backoff.next_duration());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::OperationState;
    use tokio::time::{advance, timeout};

    fn terminal_status() -> OperationStatus {
        OperationStatus::new(OperationState::Finished, None)
    }

    fn manager_in(
        tempdir: &tempfile::TempDir,
    ) -> (
        Arc<StatusUpdateManager>,
        mpsc::UnboundedReceiver<UpdateOperationStatus>,
    ) {
        StatusUpdateManager::new(tempdir.path(), "org.storlet.rp", "test", "rp-1")
    }

    #[tokio::test(start_paused = true)]
    async fn update_is_retried_until_acknowledged() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let (manager, mut outbox) = manager_in(&tempdir);

        let status = terminal_status();
        manager
            .update("op-1", None, status.clone())
            .await
            .expect("update should persist");

        // Immediate first delivery
        let first = outbox.recv().await.expect("first delivery");
        assert_eq!(first.status.as_ref().unwrap().uuid, status.uuid);

        // No ack: the minimum retry interval elapses and an identical
        // update goes out again
        advance(Duration::from_secs(11)).await;
        let second = outbox.recv().await.expect("retransmission");
        assert_eq!(second.status.as_ref().unwrap().uuid, status.uuid);

        // Acknowledge: terminal ack prunes the stream
        let terminated = manager
            .acknowledge("op-1", status.uuid.as_deref().unwrap())
            .await
            .expect("ack should persist");
        assert!(terminated);

        // And nothing further is transmitted
        advance(Duration::from_secs(600)).await;
        assert!(
            timeout(Duration::from_millis(10), outbox.recv())
                .await
                .is_err(),
            "no updates should follow an acknowledged terminal status"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn statuses_are_delivered_in_order() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let (manager, mut outbox) = manager_in(&tempdir);

        let first = OperationStatus::new(OperationState::Pending, None);
        let second = terminal_status();
        manager.update("op-1", None, first.clone()).await.unwrap();
        manager.update("op-1", None, second.clone()).await.unwrap();

        let delivered = outbox.recv().await.unwrap();
        assert_eq!(delivered.status.as_ref().unwrap().uuid, first.uuid);
        // The later status is visible as latest_status but not in flight
        assert_eq!(delivered.latest_status.as_ref().unwrap().uuid, second.uuid);

        manager
            .acknowledge("op-1", first.uuid.as_deref().unwrap())
            .await
            .unwrap();
        let delivered = outbox.recv().await.unwrap();
        assert_eq!(delivered.status.as_ref().unwrap().uuid, second.uuid);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_replays_unacknowledged_updates() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let status = terminal_status();
        {
            let (manager, mut outbox) = manager_in(&tempdir);
            manager.update("op-1", None, status.clone()).await.unwrap();
            let _ = outbox.recv().await;
        }

        let (manager, mut outbox) = manager_in(&tempdir);
        manager.recover().await.expect("recovery should succeed");

        advance(Duration::from_secs(2)).await;
        let replayed = outbox.recv().await.expect("replayed update");
        assert_eq!(replayed.status.as_ref().unwrap().uuid, status.uuid);

        // Terminal ack after recovery prunes the on-disk stream
        manager
            .acknowledge("op-1", status.uuid.as_deref().unwrap())
            .await
            .unwrap();
        let (manager, _outbox) = manager_in(&tempdir);
        manager.recover().await.unwrap();
        assert!(manager.reconcile(&["op-1".to_string()]).await[0]
            .status
            .as_ref()
            .unwrap()
            .state
            == OperationState::Dropped as i32);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_answers_known_and_unknown() {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let (manager, _outbox) = manager_in(&tempdir);

        let status = terminal_status();
        manager.update("op-1", None, status.clone()).await.unwrap();

        let replies = manager
            .reconcile(&["op-1".to_string(), "op-2".to_string()])
            .await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].status.as_ref().unwrap().uuid, status.uuid);
        assert_eq!(
            replies[1].status.as_ref().unwrap().state,
            OperationState::Dropped as i32
        );
    }
}
