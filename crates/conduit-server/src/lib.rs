//! HTTP surface of a conduit agent: the streaming generate endpoint, the
//! per-request stream loop behind it, and the health check.

pub mod fallback;
pub mod handlers;
pub mod prompt;
pub mod server;
pub mod stream_loop;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
