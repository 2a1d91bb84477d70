//! Line-oriented control markers carried inside a plain-text stream.
//!
//! A control signal is a single line `"▌KIND: text\n"`. Everything else is
//! content. A delivery consisting of one space is a heartbeat and carries no
//! content.

use serde::{Deserialize, Serialize};

/// Glyph that opens every control line (U+258C LEFT HALF BLOCK).
pub const SENTINEL: char = '\u{258C}';

/// Bytes written on idle to keep intermediaries from closing the connection.
pub const HEARTBEAT: &str = " ";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarkerKind {
    Status,
    Error,
    Success,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 3] = [MarkerKind::Status, MarkerKind::Error, MarkerKind::Success];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Error => "ERROR",
            Self::Success => "SUCCESS",
        }
    }
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlSignal {
    pub kind: MarkerKind,
    pub text: String,
}

/// One unit travelling through a request's event queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamChunk {
    Content(String),
    Signal(ControlSignal),
    Heartbeat,
    /// End of stream. Exactly one per request, never followed by anything.
    Terminator,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    pub fn signal(kind: MarkerKind, text: impl Into<String>) -> Self {
        Self::Signal(ControlSignal {
            kind,
            text: text.into(),
        })
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::signal(MarkerKind::Status, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::signal(MarkerKind::Error, text)
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Terminator)
    }
}

/// Encode a control signal as one wire line. Embedded line breaks are
/// flattened to spaces.
pub fn encode(kind: MarkerKind, text: &str) -> String {
    let text = text.replace(['\r', '\n'], " ");
    format!("{SENTINEL}{}: {text}\n", kind.as_str())
}

pub fn is_heartbeat(delivery: &[u8]) -> bool {
    delivery == HEARTBEAT.as_bytes()
}

fn error_prefix() -> String {
    format!("{SENTINEL}{}: ", MarkerKind::Error.as_str())
}

pub fn contains_error_marker(text: &str) -> bool {
    text.contains(&error_prefix())
}

/// Remove every `"▌ERROR: "` prefix, leaving the error text in place.
pub fn strip_error_markers(text: &str) -> String {
    text.replace(&error_prefix(), "")
}

/// Incremental decoder. Lines that may be control markers are held until their
/// newline arrives, so a marker split across deliveries is still recognised.
/// Content that cannot start a marker is released immediately.
#[derive(Debug)]
pub struct MarkerDecoder {
    utf8_tail: Vec<u8>,
    line: String,
    at_line_start: bool,
}

impl Default for MarkerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerDecoder {
    pub fn new() -> Self {
        Self {
            utf8_tail: Vec::new(),
            line: String::new(),
            at_line_start: true,
        }
    }

    /// Decode one transport delivery.
    pub fn feed(&mut self, delivery: &[u8]) -> Vec<StreamChunk> {
        if self.utf8_tail.is_empty() && is_heartbeat(delivery) {
            return vec![StreamChunk::Heartbeat];
        }

        self.utf8_tail.extend_from_slice(delivery);
        let valid = match std::str::from_utf8(&self.utf8_tail) {
            Ok(_) => self.utf8_tail.len(),
            // Incomplete trailing sequence: wait for the rest.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.utf8_tail.len(),
        };
        let text = String::from_utf8_lossy(&self.utf8_tail[..valid]).into_owned();
        self.utf8_tail.drain(..valid);

        let mut out = Vec::new();
        self.push_text(&text, &mut out);
        out
    }

    /// Flush whatever is buffered once the transport reports end of stream.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if !self.utf8_tail.is_empty() {
            let tail = String::from_utf8_lossy(&self.utf8_tail).into_owned();
            self.utf8_tail.clear();
            self.push_text(&tail, &mut out);
        }
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            push_chunk(&mut out, classify_line(line));
        }
        self.at_line_start = true;
        out
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<StreamChunk>) {
        let mut rest = text;
        while !rest.is_empty() {
            if self.at_line_start || !self.line.is_empty() {
                match rest.find('\n') {
                    Some(i) => {
                        self.line.push_str(&rest[..=i]);
                        rest = &rest[i + 1..];
                        let line = std::mem::take(&mut self.line);
                        push_chunk(out, classify_line(line));
                        self.at_line_start = true;
                    }
                    None => {
                        self.line.push_str(rest);
                        rest = "";
                        if !could_be_marker(&self.line) {
                            let line = std::mem::take(&mut self.line);
                            push_chunk(out, StreamChunk::Content(line));
                            self.at_line_start = false;
                        }
                    }
                }
            } else {
                match rest.find('\n') {
                    Some(i) => {
                        push_chunk(out, StreamChunk::content(&rest[..=i]));
                        rest = &rest[i + 1..];
                        self.at_line_start = true;
                    }
                    None => {
                        push_chunk(out, StreamChunk::content(rest));
                        rest = "";
                    }
                }
            }
        }
    }
}

// Heartbeat bytes coalesced in front of a marker by the transport are
// tolerated as leading spaces.
fn could_be_marker(partial: &str) -> bool {
    let t = partial.trim_start_matches(' ');
    t.is_empty() || t.starts_with(SENTINEL)
}

fn classify_line(line: String) -> StreamChunk {
    let body = line.trim_end_matches(['\n', '\r']);
    match body.trim_start_matches(' ').strip_prefix(SENTINEL) {
        Some(rest) => StreamChunk::Signal(parse_signal(rest)),
        None => StreamChunk::Content(line),
    }
}

fn parse_signal(rest: &str) -> ControlSignal {
    for kind in MarkerKind::ALL {
        if let Some(after) = rest.strip_prefix(kind.as_str()).and_then(|r| r.strip_prefix(':')) {
            let text = after.strip_prefix(' ').unwrap_or(after);
            return ControlSignal {
                kind,
                text: text.to_string(),
            };
        }
    }
    ControlSignal {
        kind: MarkerKind::Status,
        text: rest.trim().to_string(),
    }
}

fn push_chunk(out: &mut Vec<StreamChunk>, chunk: StreamChunk) {
    if let StreamChunk::Content(text) = &chunk {
        if text.is_empty() {
            return;
        }
        if let Some(StreamChunk::Content(prev)) = out.last_mut() {
            prev.push_str(text);
            return;
        }
    }
    out.push(chunk);
}

/// Writer-side state: guarantees every marker starts on a fresh line and that
/// no content delivery is ever a lone heartbeat-shaped space.
#[derive(Debug)]
pub struct MarkerEncoder {
    at_line_start: bool,
    held: String,
}

impl Default for MarkerEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerEncoder {
    pub fn new() -> Self {
        Self {
            at_line_start: true,
            held: String::new(),
        }
    }

    /// Wire text for `chunk`, or `None` when nothing should be written now.
    pub fn encode(&mut self, chunk: &StreamChunk) -> Option<String> {
        match chunk {
            StreamChunk::Content(text) => {
                if text.is_empty() {
                    return None;
                }
                let mut out = std::mem::take(&mut self.held);
                out.push_str(text);
                if is_heartbeat(out.as_bytes()) {
                    self.held = out;
                    return None;
                }
                self.at_line_start = out.ends_with('\n');
                Some(out)
            }
            StreamChunk::Signal(signal) => {
                let mut out = std::mem::take(&mut self.held);
                let line_start = if out.is_empty() {
                    self.at_line_start
                } else {
                    out.ends_with('\n')
                };
                if !line_start {
                    out.push('\n');
                }
                out.push_str(&encode(signal.kind, &signal.text));
                self.at_line_start = true;
                Some(out)
            }
            StreamChunk::Heartbeat => Some(HEARTBEAT.to_string()),
            // A held space can only be a trailing one now; write it as is.
            StreamChunk::Terminator => Some(std::mem::take(&mut self.held)).filter(|held| !held.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(deliveries: &[&[u8]]) -> Vec<StreamChunk> {
        let mut decoder = MarkerDecoder::new();
        let mut out = Vec::new();
        for d in deliveries {
            for chunk in decoder.feed(d) {
                push_chunk(&mut out, chunk);
            }
        }
        for chunk in decoder.finish() {
            push_chunk(&mut out, chunk);
        }
        out
    }

    #[test]
    fn encode_produces_single_line() {
        assert_eq!(encode(MarkerKind::Status, "loading"), "▌STATUS: loading\n");
        assert_eq!(encode(MarkerKind::Error, "a\nb"), "▌ERROR: a b\n");
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        for line in ["▌STATUS: Analyzing table EMP\n", "▌ERROR: boom \n", "▌SUCCESS: done: 3 rows\n"] {
            let chunks = decode_all(&[line.as_bytes()]);
            let [StreamChunk::Signal(sig)] = chunks.as_slice() else {
                panic!("expected one signal, got {chunks:?}");
            };
            assert_eq!(encode(sig.kind, &sig.text), line);
        }
    }

    #[test]
    fn marker_split_across_deliveries_is_recognised() {
        let chunks = decode_all(&[b"Intro\n\xE2\x96", b"\x8CSTA", b"TUS: working\nrest"]);
        assert_eq!(
            chunks,
            vec![
                StreamChunk::content("Intro\n"),
                StreamChunk::status("working"),
                StreamChunk::content("rest"),
            ]
        );
    }

    #[test]
    fn content_mid_line_is_released_without_waiting() {
        let mut decoder = MarkerDecoder::new();
        assert_eq!(decoder.feed(b"Hello"), vec![StreamChunk::content("Hello")]);
        assert_eq!(decoder.feed(b", world"), vec![StreamChunk::content(", world")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn lone_space_is_heartbeat() {
        let mut decoder = MarkerDecoder::new();
        assert_eq!(decoder.feed(b" "), vec![StreamChunk::Heartbeat]);
        assert_eq!(decoder.feed(b"  "), Vec::<StreamChunk>::new());
        assert_eq!(decoder.feed(b"x\n"), vec![StreamChunk::content("  x\n")]);
    }

    #[test]
    fn unknown_kind_becomes_status() {
        let chunks = decode_all(&[b"\xE2\x96\x8CWARN: careful\n"]);
        assert_eq!(chunks, vec![StreamChunk::status("WARN: careful")]);
    }

    #[test]
    fn leading_spaces_before_sentinel_are_tolerated() {
        let chunks = decode_all(&[" ▌STATUS: hi\n".as_bytes()]);
        assert_eq!(chunks, vec![StreamChunk::status("hi")]);
    }

    #[test]
    fn unterminated_marker_is_flushed_on_finish() {
        let mut decoder = MarkerDecoder::new();
        assert!(decoder.feed("▌SUCCESS: Completed".as_bytes()).is_empty());
        assert_eq!(decoder.finish(), vec![StreamChunk::signal(MarkerKind::Success, "Completed")]);
    }

    #[test]
    fn strip_error_markers_removes_exactly_prefix() {
        let text = "▌ERROR: ORA-00942: table does not exist";
        assert!(contains_error_marker(text));
        assert_eq!(strip_error_markers(text), "ORA-00942: table does not exist");
        assert_eq!(strip_error_markers("▌STATUS: x"), "▌STATUS: x");
    }

    #[test]
    fn encoder_starts_markers_on_fresh_line() {
        let mut enc = MarkerEncoder::new();
        assert_eq!(enc.encode(&StreamChunk::content("Partial")), Some("Partial".into()));
        assert_eq!(
            enc.encode(&StreamChunk::status("step")),
            Some("\n▌STATUS: step\n".into())
        );
        assert_eq!(
            enc.encode(&StreamChunk::status("next")),
            Some("▌STATUS: next\n".into())
        );
    }

    #[test]
    fn encoder_never_emits_lone_space_content() {
        let mut enc = MarkerEncoder::new();
        assert_eq!(enc.encode(&StreamChunk::content(" ")), None);
        assert_eq!(enc.encode(&StreamChunk::content("world")), Some(" world".into()));
        assert_eq!(enc.encode(&StreamChunk::Heartbeat), Some(" ".into()));
        assert_eq!(enc.encode(&StreamChunk::Terminator), None);
    }

    #[test]
    fn encoder_flushes_held_space_at_end() {
        let mut enc = MarkerEncoder::new();
        assert_eq!(enc.encode(&StreamChunk::content("Done.")), Some("Done.".into()));
        assert_eq!(enc.encode(&StreamChunk::content(" ")), None);
        assert_eq!(enc.encode(&StreamChunk::Terminator), Some(" ".into()));
        assert_eq!(enc.encode(&StreamChunk::Terminator), None);
    }

    #[test]
    fn encoder_output_decodes_back() {
        let chunks = vec![
            StreamChunk::content("Looking up"),
            StreamChunk::status("Querying"),
            StreamChunk::content("Found 3 rows.\n"),
            StreamChunk::error("timeout"),
        ];
        let mut enc = MarkerEncoder::new();
        let wire: Vec<String> = chunks.iter().filter_map(|c| enc.encode(c)).collect();
        let deliveries: Vec<&[u8]> = wire.iter().map(|s| s.as_bytes()).collect();
        assert_eq!(
            decode_all(&deliveries),
            vec![
                StreamChunk::content("Looking up\n"),
                StreamChunk::status("Querying"),
                StreamChunk::content("Found 3 rows.\n"),
                StreamChunk::error("timeout"),
            ]
        );
    }
}
