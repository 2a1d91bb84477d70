use std::time::Duration;

use conduit_core::context::{self, UiContext};
use conduit_core::wire::{GenerateRequest, GENERATE_PATH};
use futures::StreamExt;
use serde_json::Value;
use tracing::instrument;

use crate::error::DelegationError;
use crate::relay::StreamRelay;

/// Transport settings for delegation calls.
#[derive(Clone, Debug)]
pub struct DelegationConfig {
    /// Overall limit per call. `None` waits for the worker indefinitely.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Streaming client for one worker.
#[derive(Clone, Debug)]
pub struct DelegationClient {
    http: reqwest::Client,
    worker: String,
    endpoint: String,
    timeout: Option<Duration>,
}

impl DelegationClient {
    pub fn new(
        worker: impl Into<String>,
        endpoint: impl Into<String>,
        config: &DelegationConfig,
    ) -> Result<Self, DelegationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self::with_client(http, worker, endpoint).with_timeout(config.timeout))
    }

    /// Share an existing connection pool.
    pub fn with_client(http: reqwest::Client, worker: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            worker: worker.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `message` to the worker and return its accumulated content.
    /// Never fails: transport problems come back as `"Error calling …"` text.
    pub async fn delegate(&self, message: &str) -> String {
        match self.try_delegate(message).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(worker = %self.worker, error = %e, "delegation failed");
                self.failure_text(&e)
            }
        }
    }

    /// Text handed back to the engine in place of a result.
    pub fn failure_text(&self, error: &DelegationError) -> String {
        format!("Error calling {}: {error}", self.worker)
    }

    #[instrument(skip_all, fields(worker = %self.worker, endpoint = %self.endpoint))]
    pub async fn try_delegate(&self, message: &str) -> Result<String, DelegationError> {
        let ctx = context::current();
        let session_id = ctx
            .as_ref()
            .map(|c| c.session_id().to_string())
            .unwrap_or_else(|| "default".to_string());
        let ui = ctx.as_ref().map(|c| c.forwarded_ui_context()).unwrap_or_default();

        tracing::info!(session_id = %session_id, "delegating");
        tracing::info!(context = %masked(&ui), "context passed to worker");

        let body = GenerateRequest {
            message: message.to_string(),
            session_id: Some(session_id),
            context: Some(serde_json::to_value(&ui)?),
        };
        let mut request = self
            .http
            .post(format!("{}{}", self.endpoint, GENERATE_PATH))
            .json(&body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DelegationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut relay = StreamRelay::new(&self.worker, ctx.as_ref().and_then(|c| c.progress_sink()));
        let cancel = ctx.as_ref().map(|c| c.cancel_flag().clone());
        let mut stream = response.bytes_stream();

        loop {
            let next = match &cancel {
                Some(flag) => tokio::select! {
                    biased;
                    _ = flag.cancelled() => {
                        tracing::info!("request cancelled, closing worker stream");
                        break;
                    }
                    next = stream.next() => next,
                },
                None => stream.next().await,
            };
            match next {
                Some(Ok(bytes)) => relay.feed(&bytes),
                Some(Err(e)) => return Err(DelegationError::Stream(e.to_string())),
                None => break,
            }
        }

        let relayed = relay.relayed();
        let text = relay.finish();
        tracing::info!(length = text.len(), relayed, "received final response");
        Ok(text)
    }
}

/// Context with credential values replaced, for logging.
fn masked(ui: &UiContext) -> Value {
    let mut value = serde_json::to_value(ui).unwrap_or_default();
    if let Value::Object(map) = &mut value {
        for key in ["authToken", "dbCredentials"] {
            if let Some(v) = map.get_mut(key) {
                *v = Value::String("***".into());
            }
        }
    }
    value
}
