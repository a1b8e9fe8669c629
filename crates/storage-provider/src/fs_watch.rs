//! A thin `Stream` wrapper over an OS filesystem watch, used to wait for a
//! plugin's endpoint socket to appear without polling.

use std::{
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use notify::{Event, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::error;

pub struct FileSystemWatcher {
    recv: UnboundedReceiver<NotifyResult<Event>>,
    _watcher: RecommendedWatcher, // holds on to the watcher so it doesn't get dropped
}

impl Stream for FileSystemWatcher {
    type Item = NotifyResult<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.recv.poll_recv(cx)
    }
}

impl FileSystemWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let (stream_tx, stream_rx) = unbounded_channel::<NotifyResult<Event>>();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            if let Err(e) = stream_tx.send(res) {
                error!(error = %e, "Unable to send inotify event into stream")
            }
        })?;
        watcher.watch(path.as_ref(), RecursiveMode::NonRecursive)?;

        Ok(FileSystemWatcher {
            recv: stream_rx,
            _watcher: watcher,
        })
    }
}
