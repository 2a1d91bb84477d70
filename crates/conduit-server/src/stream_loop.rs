//! Per-request stream loop.
//!
//! A background task drives the reasoning engine inside the request context
//! and pushes everything it produces into the event queue. The consumer
//! drains the queue into the response body, writes a heartbeat whenever the
//! queue stays idle for one interval, and turns a client disconnect into
//! cancellation of the whole request.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::cancel::{CancelFlag, CancellationRegistry};
use conduit_core::context::{self, RequestContext};
use conduit_core::ids::SessionId;
use conduit_core::markers::{MarkerEncoder, StreamChunk};
use conduit_core::queue::{QueueConsumer, QueueProducer, Received};
use conduit_engine::{panic_message, EngineError, EngineEvent, EngineRequest, ReasoningEngine, SessionStore};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::fallback::{self, LastToolResult};

pub type BodySender = mpsc::Sender<Result<Bytes, Infallible>>;

/// How a run ended, as seen by the engine task.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Start the engine on its own task. The terminator is enqueued when the task
/// ends, whether it completes, fails, panics or is aborted. A panic is
/// reported as an ERROR marker ahead of it.
pub fn spawn_engine(
    ctx: RequestContext,
    engine: Arc<dyn ReasoningEngine>,
    request: EngineRequest,
    sessions: Arc<SessionStore>,
    producer: QueueProducer,
) -> JoinHandle<RunOutcome> {
    tokio::spawn(ctx.scope(async move {
        let _terminator = producer.terminator_guard();
        let run = AssertUnwindSafe(drive_engine(engine, request, &sessions, &producer));
        match run.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(panic = %message, "engine task panicked");
                let _ = producer.put(StreamChunk::error(format!("Internal error: {message}")));
                RunOutcome::Failed
            }
        }
    }))
}

#[instrument(skip_all, fields(session_id = %request.session_id, engine = engine.name()))]
async fn drive_engine(
    engine: Arc<dyn ReasoningEngine>,
    request: EngineRequest,
    sessions: &SessionStore,
    producer: &QueueProducer,
) -> RunOutcome {
    let session_id = request.session_id.clone();
    let message = request.message.clone();
    let tools = Arc::clone(&request.tools);

    let mut produced = String::new();
    let mut last_result: Option<LastToolResult> = None;

    let mut events = match engine.run(request).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(error = %e, "engine failed to start");
            let _ = producer.put(StreamChunk::error(e.to_string()));
            return RunOutcome::Failed;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            Ok(EngineEvent::TextChunk(text)) => {
                if text.is_empty() {
                    continue;
                }
                tracing::debug!(chars = text.len(), "text chunk");
                produced.push_str(&text);
                let _ = producer.put(StreamChunk::content(text));
            }
            Ok(EngineEvent::ToolCall { name, .. }) => {
                tracing::info!(tool = %name, "tool call");
            }
            Ok(EngineEvent::ToolResult { name, result }) => {
                tracing::info!(tool = %name, chars = result.content.len(), is_error = result.is_error, "tool result");
                if tools.is_user_facing(&name) {
                    last_result = Some(LastToolResult {
                        display_name: tools.display_name(&name),
                        content: result.content,
                    });
                }
            }
            Err(EngineError::Cancelled) => {
                tracing::info!("run cancelled");
                return RunOutcome::Cancelled;
            }
            Err(e) => {
                tracing::error!(error = %e, "engine run failed");
                let _ = producer.put(StreamChunk::error(e.to_string()));
                return RunOutcome::Failed;
            }
        }
    }

    if context::is_cancelled() {
        return RunOutcome::Cancelled;
    }

    if produced.trim().is_empty() {
        let text = fallback::synthesize(last_result.as_ref());
        tracing::info!(has_tool_result = last_result.is_some(), "no text produced, using fallback");
        let _ = producer.put(StreamChunk::content(text.clone()));
        produced = text;
    }

    sessions.record_exchange(&session_id, &message, &produced);
    RunOutcome::Completed
}

/// Consumer side of one request.
pub struct Pump {
    pub session_id: SessionId,
    pub heartbeat: Duration,
    pub cancel: CancelFlag,
    pub registry: Arc<CancellationRegistry>,
}

impl Pump {
    /// Drain `queue` into `body` until the terminator or a disconnect, then
    /// tear the engine task down.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn run(self, mut queue: QueueConsumer, body: BodySender, mut task: JoinHandle<RunOutcome>) {
        let mut encoder = MarkerEncoder::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = body.closed() => {
                    self.disconnect(&task);
                    break;
                }
                received = queue.get(self.heartbeat) => received,
            };

            let chunk = match received {
                Received::Chunk(chunk) => chunk,
                Received::Timeout => StreamChunk::Heartbeat,
                Received::Terminated => {
                    tracing::info!("end of response stream");
                    if let Some(tail) = encoder.encode(&StreamChunk::Terminator) {
                        let _ = body.send(Ok(Bytes::from(tail))).await;
                    }
                    break;
                }
            };
            if let StreamChunk::Signal(signal) = &chunk {
                tracing::info!(kind = %signal.kind, text = %signal.text, "progress");
            }

            let Some(text) = encoder.encode(&chunk) else {
                continue;
            };
            if body.send(Ok(Bytes::from(text))).await.is_err() {
                self.disconnect(&task);
                break;
            }
        }

        if !task.is_finished() {
            task.abort();
        }
        match (&mut task).await {
            Ok(outcome) => tracing::debug!(?outcome, "engine task finished"),
            Err(e) if e.is_cancelled() => tracing::debug!("engine task aborted"),
            Err(e) => tracing::error!(error = %e, "engine task panicked"),
        }
        let _ = self.registry.release(&self.session_id);
    }

    fn disconnect(&self, task: &JoinHandle<RunOutcome>) {
        tracing::info!("client disconnected, cancelling request");
        self.registry.cancel(&self.session_id);
        self.cancel.cancel();
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::queue;
    use conduit_engine::{ScriptStep, ScriptedEngine, ToolRegistry};
    use std::sync::Arc;

    struct Harness {
        ctx: RequestContext,
        producer: QueueProducer,
        consumer: QueueConsumer,
        registry: Arc<CancellationRegistry>,
        sessions: Arc<SessionStore>,
        session_id: SessionId,
    }

    fn harness() -> Harness {
        let flag = CancelFlag::new();
        let (producer, consumer) = queue::channel(flag.clone());
        let registry = Arc::new(CancellationRegistry::new());
        let session_id = SessionId::from_raw("s-1");
        let ctx = RequestContext::new(session_id.clone())
            .with_cancel_flag(flag)
            .with_registry(Arc::clone(&registry))
            .with_progress(producer.progress_sink());
        Harness {
            ctx,
            producer,
            consumer,
            registry,
            sessions: Arc::new(SessionStore::default()),
            session_id,
        }
    }

    fn request(session_id: &SessionId, message: &str) -> EngineRequest {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(conduit_engine::ReportProgressTool));
        EngineRequest {
            session_id: session_id.clone(),
            message: message.into(),
            prompt: message.into(),
            history: Vec::new(),
            tools: Arc::new(tools),
        }
    }

    async fn drain(consumer: &mut QueueConsumer) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        loop {
            match consumer.get(Duration::from_secs(5)).await {
                Received::Chunk(c) => out.push(c),
                Received::Timeout => panic!("queue stalled"),
                Received::Terminated => return out,
            }
        }
    }

    #[tokio::test]
    async fn silent_run_apologises_once() {
        let mut h = harness();
        let engine = Arc::new(ScriptedEngine::new(vec![ScriptStep::call(
            "report_progress",
            serde_json::json!({"message": "thinking"}),
        )]));
        let task = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer);
        let chunks = drain(&mut h.consumer).await;
        assert_eq!(
            chunks,
            vec![StreamChunk::status("thinking"), StreamChunk::content(fallback::APOLOGY)]
        );
        assert_eq!(task.await.unwrap(), RunOutcome::Completed);
        assert_eq!(h.sessions.history(&h.session_id).len(), 2);
    }

    #[tokio::test]
    async fn failure_enqueues_error_marker() {
        let mut h = harness();
        let engine = Arc::new(ScriptedEngine::new(vec![
            ScriptStep::text("partial"),
            ScriptStep::Fail("model overloaded".into()),
        ]));
        let task = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer);
        let chunks = drain(&mut h.consumer).await;
        assert_eq!(
            chunks,
            vec![StreamChunk::content("partial"), StreamChunk::error("model overloaded")]
        );
        assert_eq!(task.await.unwrap(), RunOutcome::Failed);
        assert!(!h.sessions.contains(&h.session_id));
    }

    #[tokio::test]
    async fn engine_that_cannot_start_reports_error() {
        let mut h = harness();
        let engine = Arc::new(ScriptedEngine::failing("no model"));
        let _ = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer);
        let chunks = drain(&mut h.consumer).await;
        assert_eq!(chunks, vec![StreamChunk::error("engine unavailable: no model")]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_yields_heartbeats() {
        let h = harness();
        let engine = Arc::new(ScriptedEngine::new(vec![
            ScriptStep::Sleep(Duration::from_millis(2500)),
            ScriptStep::text("done"),
        ]));
        let task = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer);
        let (body_tx, mut body_rx) = mpsc::channel(16);
        let pump = Pump {
            session_id: h.session_id.clone(),
            heartbeat: Duration::from_secs(1),
            cancel: CancelFlag::new(),
            registry: Arc::clone(&h.registry),
        };
        pump.run(h.consumer, body_tx, task).await;

        let mut written = Vec::new();
        while let Some(Ok(bytes)) = body_rx.recv().await {
            written.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        assert_eq!(written, vec![" ", " ", "done"]);
    }

    #[tokio::test]
    async fn trailing_space_reaches_the_body() {
        let h = harness();
        let engine = Arc::new(ScriptedEngine::new(vec![ScriptStep::text("Done."), ScriptStep::text(" ")]));
        let task = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer);
        let (body_tx, mut body_rx) = mpsc::channel(16);
        let pump = Pump {
            session_id: h.session_id.clone(),
            heartbeat: Duration::from_secs(5),
            cancel: CancelFlag::new(),
            registry: Arc::clone(&h.registry),
        };
        pump.run(h.consumer, body_tx, task).await;

        let mut written = String::new();
        while let Some(Ok(bytes)) = body_rx.recv().await {
            written.push_str(std::str::from_utf8(&bytes).unwrap());
        }
        assert_eq!(written, "Done. ");
    }

    #[tokio::test]
    async fn disconnect_cancels_and_releases() {
        let h = harness();
        let flag = h.ctx.cancel_flag().clone();
        let engine = Arc::new(ScriptedEngine::new(vec![ScriptStep::Sleep(Duration::from_secs(3600))]));
        let task = spawn_engine(h.ctx, engine, request(&h.session_id, "hi"), Arc::clone(&h.sessions), h.producer.clone());
        let (body_tx, body_rx) = mpsc::channel(16);
        drop(body_rx);

        let pump = Pump {
            session_id: h.session_id.clone(),
            heartbeat: Duration::from_secs(1),
            cancel: flag.clone(),
            registry: Arc::clone(&h.registry),
        };
        pump.run(h.consumer, body_tx, task).await;

        assert!(flag.is_cancelled());
        assert!(h.registry.is_empty());
        assert!(!h.producer.put(StreamChunk::content("late")));
    }
}
