//! Request-scoped values visible to everything running inside a request.
//!
//! A [`RequestContext`] is established for the duration of a future with
//! [`RequestContext::scope`]. Code nested anywhere inside that future (the
//! engine, its tools, a delegation client several calls deep) reads it back
//! through the free functions in this module instead of taking it as a
//! parameter. The previous value is restored when the scoped future
//! completes or is dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;

use crate::cancel::{CancelFlag, Cancelled, CancellationRegistry};
use crate::ids::SessionId;

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// UI state forwarded by the caller: where the user is looking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiContext {
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(deserialize_with = "lenient_list", skip_serializing_if = "Vec::is_empty")]
    pub object_list: Vec<Value>,
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_credentials: Option<Value>,
    #[serde(rename = "session_id", deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// Strings as given, numbers and booleans as their text, anything else as absent.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

impl UiContext {
    /// Accepts an object, a JSON-encoded string holding an object, or null.
    /// Anything unparseable yields an empty context.
    pub fn from_value(value: Value) -> Self {
        let value = match value {
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(error = %e, "context string is not valid JSON, ignoring");
                    return Self::default();
                }
            },
            other => other,
        };
        match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "malformed context object, ignoring");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Copy with credential fields cleared, safe to show to a model or a log.
    pub fn without_credentials(&self) -> Self {
        Self {
            auth_token: None,
            db_credentials: None,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Callable receiving progress text for the current request.
///
/// Cheap to clone and safe to invoke from any task or OS thread.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(&str) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn report(&self, message: &str) {
        (self.0)(message);
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink(..)")
    }
}

/// Credentials available to tools. Raw database credentials win over the
/// opaque auth token.
#[derive(Debug)]
pub enum Credentials<'a> {
    Database(&'a Value),
    Token(&'a SecretString),
}

#[derive(Clone)]
pub struct RequestContext {
    session_id: SessionId,
    auth_token: Option<SecretString>,
    db_credentials: Option<Value>,
    ui: UiContext,
    progress: Option<ProgressSink>,
    cancel: CancelFlag,
    registry: Option<Arc<CancellationRegistry>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("session_id", &self.session_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("db_credentials", &self.db_credentials.as_ref().map(|_| "***"))
            .field("ui", &self.ui)
            .field("has_progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RequestContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            auth_token: None,
            db_credentials: None,
            ui: UiContext::default(),
            progress: None,
            cancel: CancelFlag::new(),
            registry: None,
        }
    }

    /// Build from an inbound UI context, lifting its credential fields into
    /// the dedicated slots.
    pub fn from_ui_context(session_id: SessionId, mut ui: UiContext) -> Self {
        let auth_token = ui.auth_token.take().filter(|t| !t.is_empty());
        let db_credentials = ui.db_credentials.take().filter(|c| !c.is_null());
        Self {
            auth_token: auth_token.map(SecretString::from),
            db_credentials,
            ui,
            ..Self::new(session_id)
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_db_credentials(mut self, credentials: Value) -> Self {
        self.db_credentials = Some(credentials);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CancellationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn auth_token(&self) -> Option<&SecretString> {
        self.auth_token.as_ref()
    }

    pub fn db_credentials(&self) -> Option<&Value> {
        self.db_credentials.as_ref()
    }

    pub fn credentials(&self) -> Option<Credentials<'_>> {
        self.db_credentials
            .as_ref()
            .map(Credentials::Database)
            .or_else(|| self.auth_token.as_ref().map(Credentials::Token))
    }

    pub fn ui_context(&self) -> &UiContext {
        &self.ui
    }

    pub fn progress_sink(&self) -> Option<ProgressSink> {
        self.progress.clone()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .registry
                .as_ref()
                .is_some_and(|r| r.is_cancelled(&self.session_id))
    }

    /// UI context to send to a downstream worker, credentials merged back in.
    pub fn forwarded_ui_context(&self) -> UiContext {
        let mut ui = self.ui.clone();
        ui.auth_token = self.auth_token.as_ref().map(|t| t.expose_secret().to_string());
        ui.db_credentials = self.db_credentials.clone();
        ui
    }

    /// Run `fut` with this context as the current one.
    pub fn scope<F: Future>(self, fut: F) -> TaskLocalFuture<Arc<RequestContext>, F> {
        CURRENT.scope(Arc::new(self), fut)
    }
}

/// The context of the request currently executing, if any.
pub fn current() -> Option<Arc<RequestContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Send `message` to the current progress sink. Returns false when there is
/// no request or the request has no sink.
pub fn report_progress(message: &str) -> bool {
    match current().and_then(|ctx| ctx.progress_sink()) {
        Some(sink) => {
            sink.report(message);
            true
        }
        None => {
            tracing::debug!(message, "no progress sink in scope");
            false
        }
    }
}

pub fn is_cancelled() -> bool {
    current().is_some_and(|ctx| ctx.is_cancelled())
}

/// Cooperative cancellation point for long-running loops.
pub fn check_cancelled() -> Result<(), Cancelled> {
    if is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// Spawn `fut` on a new task that sees the same request context as the caller.
pub fn spawn_in_scope<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(ctx) => tokio::spawn(CURRENT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn sink(&self) -> ProgressSink {
            let inner = Arc::clone(&self.0);
            ProgressSink::new(move |m| inner.lock().unwrap().push(m.to_string()))
        }

        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn nested_reader() -> Option<String> {
        current().map(|c| c.session_id().to_string())
    }

    #[tokio::test]
    async fn no_context_outside_scope() {
        assert!(current().is_none());
        assert!(!report_progress("ignored"));
        assert!(check_cancelled().is_ok());
    }

    #[tokio::test]
    async fn nested_code_sees_context() {
        let ctx = RequestContext::new(SessionId::from_raw("s1"));
        let seen = ctx.scope(async { nested_reader().await }).await;
        assert_eq!(seen.as_deref(), Some("s1"));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn inner_scope_restores_outer() {
        let outer = RequestContext::new(SessionId::from_raw("outer"));
        outer
            .scope(async {
                let inner = RequestContext::new(SessionId::from_raw("inner"));
                let seen = inner.scope(nested_reader()).await;
                assert_eq!(seen.as_deref(), Some("inner"));
                assert_eq!(nested_reader().await.as_deref(), Some("outer"));
            })
            .await;
    }

    #[tokio::test]
    async fn spawn_in_scope_carries_context() {
        let ctx = RequestContext::new(SessionId::from_raw("carried"));
        let (plain, carried) = ctx
            .scope(async {
                let plain = tokio::spawn(nested_reader()).await.unwrap();
                let carried = spawn_in_scope(nested_reader()).await.unwrap();
                (plain, carried)
            })
            .await;
        assert_eq!(plain, None);
        assert_eq!(carried.as_deref(), Some("carried"));
    }

    #[tokio::test]
    async fn progress_from_os_thread_reaches_sink() {
        let recorder = Recorder::default();
        let ctx = RequestContext::new(SessionId::new()).with_progress(recorder.sink());
        ctx.scope(async {
            assert!(report_progress("on task"));
            let sink = current().and_then(|c| c.progress_sink()).unwrap();
            std::thread::spawn(move || sink.report("on thread")).join().unwrap();
        })
        .await;
        assert_eq!(recorder.messages(), vec!["on task", "on thread"]);
    }

    #[tokio::test]
    async fn cancellation_visible_through_flag_and_registry() {
        let registry = Arc::new(CancellationRegistry::new());
        let flag = CancelFlag::new();
        let session = SessionId::from_raw("c1");
        let ctx = RequestContext::new(session.clone())
            .with_cancel_flag(flag.clone())
            .with_registry(Arc::clone(&registry));

        ctx.clone().scope(async { assert!(check_cancelled().is_ok()) }).await;
        registry.cancel(&session);
        ctx.clone().scope(async { assert_eq!(check_cancelled(), Err(Cancelled)) }).await;

        registry.release(&session);
        assert!(!ctx.is_cancelled());
        flag.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn ui_context_accepts_json_string() {
        let raw = json!(r#"{"endpoint":"prod","owner":"HR","objectType":"TABLE","theme":"dark"}"#);
        let ui = UiContext::from_value(raw);
        assert_eq!(ui.endpoint.as_deref(), Some("prod"));
        assert_eq!(ui.owner.as_deref(), Some("HR"));
        assert_eq!(ui.object_type.as_deref(), Some("TABLE"));
        assert_eq!(ui.extras["theme"], "dark");
    }

    #[test]
    fn ui_context_ignores_garbage() {
        assert!(UiContext::from_value(json!("not json")).is_empty());
        assert!(UiContext::from_value(json!(42)).is_empty());
        assert!(UiContext::from_value(Value::Null).is_empty());
    }

    #[test]
    fn mistyped_fields_do_not_discard_the_rest() {
        let ui = UiContext::from_value(json!({
            "endpoint": "prod",
            "owner": "HR",
            "authToken": "tok",
            "dbCredentials": {"user": "hr"},
            "objectList": null,
            "objectName": null,
        }));
        assert_eq!(ui.endpoint.as_deref(), Some("prod"));
        assert_eq!(ui.owner.as_deref(), Some("HR"));
        assert_eq!(ui.auth_token.as_deref(), Some("tok"));
        assert_eq!(ui.db_credentials, Some(json!({"user": "hr"})));
        assert!(ui.object_list.is_empty());
        assert!(ui.object_name.is_none());

        let ui = UiContext::from_value(json!({"endpoint": 1521, "owner": ["HR"], "objectList": {"a": 1}}));
        assert_eq!(ui.endpoint.as_deref(), Some("1521"));
        assert!(ui.owner.is_none());
        assert!(ui.object_list.is_empty());
    }

    #[test]
    fn db_credentials_take_priority() {
        let ui = UiContext::from_value(json!({
            "authToken": "tok",
            "dbCredentials": {"user": "hr", "password": "pw"},
        }));
        let ctx = RequestContext::from_ui_context(SessionId::new(), ui);
        assert!(ctx.ui_context().auth_token.is_none());
        assert!(matches!(ctx.credentials(), Some(Credentials::Database(v)) if v["user"] == "hr"));

        let ctx = RequestContext::new(SessionId::new()).with_auth_token("tok");
        match ctx.credentials() {
            Some(Credentials::Token(t)) => assert_eq!(t.expose_secret(), "tok"),
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[test]
    fn forwarded_context_merges_credentials() {
        let ui = UiContext {
            endpoint: Some("dev".into()),
            ..Default::default()
        };
        let ctx = RequestContext::from_ui_context(SessionId::new(), ui)
            .with_auth_token("tok")
            .with_db_credentials(json!({"user": "scott"}));
        let fwd = serde_json::to_value(ctx.forwarded_ui_context()).unwrap();
        assert_eq!(fwd, json!({"endpoint": "dev", "authToken": "tok", "dbCredentials": {"user": "scott"}}));
    }

    #[test]
    fn debug_masks_secrets() {
        let ctx = RequestContext::new(SessionId::from_raw("s"))
            .with_auth_token("super-secret")
            .with_db_credentials(json!({"password": "hunter2"}));
        let dbg = format!("{ctx:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(!dbg.contains("hunter2"));
    }
}
