use conduit_core::context::ProgressSink;
use conduit_core::markers::{self, MarkerDecoder, MarkerKind, StreamChunk};

/// Consumer half of a worker's response stream: progress goes to the
/// caller's sink, content is accumulated for the final result.
#[derive(Debug)]
pub struct StreamRelay {
    worker: String,
    decoder: MarkerDecoder,
    content: String,
    last_error: Option<String>,
    sink: Option<ProgressSink>,
    relayed: usize,
}

impl StreamRelay {
    pub fn new(worker: impl Into<String>, sink: Option<ProgressSink>) -> Self {
        Self {
            worker: worker.into(),
            decoder: MarkerDecoder::new(),
            content: String::new(),
            last_error: None,
            sink,
            relayed: 0,
        }
    }

    pub fn feed(&mut self, delivery: &[u8]) {
        for chunk in self.decoder.feed(delivery) {
            self.handle(chunk);
        }
    }

    /// Number of signals forwarded to the sink so far.
    pub fn relayed(&self) -> usize {
        self.relayed
    }

    /// Trimmed content. A worker whose only output was an error yields that
    /// error as an ERROR marker line so callers can tell it from a result.
    pub fn finish(mut self) -> String {
        for chunk in self.decoder.finish() {
            self.handle(chunk);
        }
        let text = self.content.trim();
        if text.is_empty() {
            if let Some(error) = &self.last_error {
                return markers::encode(MarkerKind::Error, error).trim_end().to_string();
            }
        }
        text.to_string()
    }

    fn handle(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Content(text) => self.content.push_str(&text),
            StreamChunk::Signal(signal) => {
                tracing::info!(
                    worker = %self.worker,
                    kind = %signal.kind,
                    message = %signal.text,
                    "relaying progress"
                );
                if signal.kind == MarkerKind::Error {
                    self.last_error = Some(signal.text.clone());
                }
                if let Some(sink) = &self.sink {
                    sink.report(signal.text.trim());
                    self.relayed += 1;
                }
            }
            StreamChunk::Heartbeat => tracing::trace!(worker = %self.worker, "heartbeat"),
            StreamChunk::Terminator => {}
        }
    }
}
