//! Event queue bridging a request's producers (the engine task and any
//! progress sink, wherever it is called from) to the single task writing the
//! response body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cancel::{CancelFlag, CancellationRegistry};
use crate::context::ProgressSink;
use crate::ids::SessionId;
use crate::markers::StreamChunk;

struct ProducerState {
    terminated: AtomicBool,
    cancel: CancelFlag,
    registry: Option<(Arc<CancellationRegistry>, SessionId)>,
}

impl ProducerState {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .registry
                .as_ref()
                .is_some_and(|(registry, session_id)| registry.is_cancelled(session_id))
    }
}

/// Producer half. `put` never blocks and is callable from OS threads.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::UnboundedSender<StreamChunk>,
    state: Arc<ProducerState>,
}

/// What the consumer observed on one `get`.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Chunk(StreamChunk),
    Timeout,
    Terminated,
}

/// Consumer half. Exactly one per request.
pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    done: bool,
}

/// Create a queue whose producers go quiet once `cancel` is set.
pub fn channel(cancel: CancelFlag) -> (QueueProducer, QueueConsumer) {
    build(cancel, None)
}

/// Like [`channel`], but producers also go quiet as soon as `session_id` is
/// recorded in `registry`.
pub fn session_channel(
    cancel: CancelFlag,
    registry: Arc<CancellationRegistry>,
    session_id: SessionId,
) -> (QueueProducer, QueueConsumer) {
    build(cancel, Some((registry, session_id)))
}

fn build(
    cancel: CancelFlag,
    registry: Option<(Arc<CancellationRegistry>, SessionId)>,
) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let producer = QueueProducer {
        tx,
        state: Arc::new(ProducerState {
            terminated: AtomicBool::new(false),
            cancel,
            registry,
        }),
    };
    (producer, QueueConsumer { rx, done: false })
}

impl QueueProducer {
    /// Enqueue a chunk. Returns false if it was dropped because the stream
    /// already ended, the request was cancelled, or the consumer is gone.
    pub fn put(&self, chunk: StreamChunk) -> bool {
        if chunk.is_terminator() {
            return self.terminate();
        }
        if self.state.terminated.load(Ordering::Acquire) || self.state.is_cancelled() {
            tracing::trace!(?chunk, "dropping chunk after end of stream");
            return false;
        }
        self.tx.send(chunk).is_ok()
    }

    /// Enqueue the terminator. Only the first call has any effect.
    pub fn terminate(&self) -> bool {
        if self.state.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send(StreamChunk::Terminator).is_ok()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::Acquire)
    }

    /// A progress sink that enqueues each message as a STATUS signal.
    pub fn progress_sink(&self) -> ProgressSink {
        let producer = self.clone();
        ProgressSink::new(move |message| {
            let _ = producer.put(StreamChunk::status(message));
        })
    }

    /// Guard that enqueues the terminator when dropped, on every exit path.
    pub fn terminator_guard(&self) -> TerminatorGuard {
        TerminatorGuard {
            producer: self.clone(),
        }
    }
}

pub struct TerminatorGuard {
    producer: QueueProducer,
}

impl Drop for TerminatorGuard {
    fn drop(&mut self) {
        let _ = self.producer.terminate();
    }
}

impl QueueConsumer {
    /// Wait up to `timeout` for the next chunk. Once the terminator has been
    /// seen every later call returns [`Received::Terminated`] immediately, so
    /// nothing enqueued after it is ever observed.
    pub async fn get(&mut self, timeout: Duration) -> Received {
        if self.done {
            return Received::Terminated;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Received::Timeout,
            Ok(Some(StreamChunk::Terminator)) => {
                self.done = true;
                Received::Terminated
            }
            Ok(Some(chunk)) => Received::Chunk(chunk),
            Ok(None) => {
                tracing::warn!("all producers dropped without a terminator");
                self.done = true;
                Received::Terminated
            }
        }
    }
}
