//! Caller-facing response writer and the streaming heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";
const STREAM_BUFFER: usize = 32;

/// Response head handed to the HTTP layer, exactly once.
#[derive(Debug)]
pub enum DownstreamReply {
    Json { status: u16, body: Bytes },
    /// `200 text/event-stream`; the body ends when the relay drops its writer.
    Stream { body: mpsc::Receiver<Bytes> },
}

/// Write side of one caller response.
///
/// The first write decides the response shape: a JSON reply, or a committed event
/// stream. After a stream is committed no JSON reply is possible.
#[derive(Debug)]
pub struct Downstream {
    head: Mutex<Option<oneshot::Sender<DownstreamReply>>>,
    stream: OnceLock<mpsc::Sender<Bytes>>,
    wrote_data: AtomicBool,
}

impl Downstream {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<DownstreamReply>) {
        let (tx, rx) = oneshot::channel();
        let downstream = Arc::new(Self {
            head: Mutex::new(Some(tx)),
            stream: OnceLock::new(),
            wrote_data: AtomicBool::new(false),
        });
        (downstream, rx)
    }

    /// Whether the response is committed as a stream (keep-alive or data).
    pub fn has_written(&self) -> bool {
        self.stream.get().is_some()
    }

    /// Whether real payload bytes, not just keep-alives, reached the caller.
    pub fn has_data(&self) -> bool {
        self.wrote_data.load(Ordering::Acquire)
    }

    /// Sends a JSON reply. Returns `false` when the response was already decided.
    pub fn send_json(&self, status: u16, body: Bytes) -> bool {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stream.get().is_some() {
            return false;
        }
        match head.take() {
            Some(tx) => tx.send(DownstreamReply::Json { status, body }).is_ok(),
            None => false,
        }
    }

    /// Writes payload bytes, committing the stream if needed.
    pub async fn write_data(&self, chunk: Bytes) -> bool {
        let Some(tx) = self.stream_sender() else {
            return false;
        };
        let ok = tx.send(chunk).await.is_ok();
        if ok {
            self.wrote_data.store(true, Ordering::Release);
        }
        ok
    }

    /// Opens the event stream without writing to it. Idempotent.
    pub fn commit_stream(&self) -> bool {
        self.stream_sender().is_some()
    }

    pub async fn write_keepalive(&self) -> bool {
        match self.stream_sender() {
            Some(tx) => tx.send(Bytes::from_static(KEEPALIVE_FRAME)).await.is_ok(),
            None => false,
        }
    }

    fn stream_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = self.stream.get() {
            return Some(tx.clone());
        }
        let reply = head.take()?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if reply.send(DownstreamReply::Stream { body: rx }).is_err() {
            return None;
        }
        let _ = self.stream.set(tx.clone());
        Some(tx)
    }
}

/// Periodic keep-alive for a streaming request.
///
/// The task is aborted on [`StreamGuard::close`] or on drop, whichever comes first, so
/// every exit path of the request stops it exactly once.
#[derive(Debug)]
pub struct StreamGuard {
    downstream: Arc<Downstream>,
    task: Option<JoinHandle<()>>,
}

impl StreamGuard {
    pub fn start(downstream: Arc<Downstream>, interval: Duration) -> Self {
        let writer = downstream.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First keep-alive goes out after one full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !writer.write_keepalive().await {
                    break;
                }
            }
        });
        Self {
            downstream,
            task: Some(task),
        }
    }

    pub fn has_written(&self) -> bool {
        self.downstream.has_written()
    }

    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.close();
    }
}
