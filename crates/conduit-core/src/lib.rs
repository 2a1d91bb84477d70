//! Shared building blocks for conduit agents: identifiers, the in-band
//! control-marker codec, request context, cancellation and the event queue.

pub mod cancel;
pub mod context;
pub mod ids;
pub mod markers;
pub mod queue;
pub mod tools;
pub mod wire;

pub use cancel::{CancelFlag, Cancelled, CancellationRegistry};
pub use context::{Credentials, ProgressSink, RequestContext, UiContext};
pub use ids::{RequestId, SessionId};
pub use markers::{ControlSignal, MarkerDecoder, MarkerEncoder, MarkerKind, StreamChunk};
