//! Static name-to-script registry and the dispatch boundary that turns any
//! script outcome into an envelope.

pub mod schema;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::codes::ErrorCode;
use crate::context::{BridgeContext, ScriptContext};
use crate::envelope::{normalize_result, Envelope, Meta, ScriptOutput};
use crate::error::ScriptError;
use crate::transport::{CommandExecutor, CommandFile, JobEvents};

pub use schema::{Field, FieldIssue, FieldType, ParamSchema};

/// Execution cap for scripts that are expected to return promptly.
pub const DEFAULT_EXECUTION_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Read-only, returns immediately.
    Query,
    /// Mutates editor or debugger state, returns immediately.
    Action,
    /// Blocks until an asynchronous condition holds or its own timeout passes.
    Waitable,
}

#[async_trait]
pub trait Script: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ScriptKind;

    fn description(&self) -> &'static str;

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
    }

    /// `params` has already been validated against [`Script::params`].
    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError>;
}

/// Deserialize validated params into a typed struct.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ScriptError> {
    serde_json::from_value(params)
        .map_err(|e| ScriptError::new(ErrorCode::InvalidParams, format!("Invalid parameters: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptInfo {
    pub name: String,
    pub kind: ScriptKind,
    pub description: String,
    pub params: Value,
}

#[derive(Default)]
pub struct Registry {
    scripts: BTreeMap<&'static str, Arc<dyn Script>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every script that runs without host-specific state.
    pub fn with_builtin_scripts() -> Self {
        let mut registry = Self::new();
        for script in crate::scripts::builtin() {
            if let Err(e) = registry.register(script) {
                tracing::error!("Builtin script dropped: {}", e.message);
                debug_assert!(false, "duplicate builtin script: {}", e.message);
            }
        }
        registry
    }

    pub fn register(&mut self, script: Arc<dyn Script>) -> Result<(), ScriptError> {
        let name = script.name();
        if self.scripts.contains_key(name) {
            return Err(ScriptError::new(
                ErrorCode::Internal,
                format!("Script '{name}' is already registered"),
            ));
        }
        self.scripts.insert(name, script);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Every script, sorted by name.
    pub fn describe(&self) -> Vec<ScriptInfo> {
        self.scripts
            .values()
            .map(|s| ScriptInfo {
                name: s.name().to_string(),
                kind: s.kind(),
                description: s.description().to_string(),
                params: s.params().to_json(),
            })
            .collect()
    }

    /// Look up, validate, and run one script on its own task.
    pub async fn dispatch(
        self: &Arc<Self>,
        bridge: Arc<BridgeContext>,
        request_id: &str,
        name: &str,
        params: Value,
        cancel: CancellationToken,
        events: JobEvents,
    ) -> Result<ScriptOutput, ScriptError> {
        let script = self.get(name).ok_or_else(|| {
            ScriptError::new(ErrorCode::ScriptNotFound, format!("Script not found: {name}"))
                .with_details(json!({ "alias": name }))
        })?;
        let params = script.params().validate(params)?;
        let kind = script.kind();

        let ctx = ScriptContext {
            bridge,
            registry: Arc::clone(self),
            request_id: request_id.to_string(),
            cancel: cancel.clone(),
            events,
        };
        let mut task = tokio::spawn(async move { script.run(ctx, params).await });

        let cap = match kind {
            ScriptKind::Query | ScriptKind::Action => Some(DEFAULT_EXECUTION_CAP),
            ScriptKind::Waitable => None,
        };
        let capped = async {
            match cap {
                Some(cap) => tokio::time::sleep(cap).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                Err(ScriptError::from_code(ErrorCode::Cancelled))
            }
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!("Script panicked: script={}, request={}", name, request_id);
                    Err(ScriptError::new(ErrorCode::Internal, format!("Script '{name}' panicked")))
                }
                Err(e) => Err(ScriptError::new(ErrorCode::Internal, format!("Script task failed: {e}"))),
            },
            _ = capped => {
                task.abort();
                Err(ScriptError::new(
                    ErrorCode::Timeout,
                    format!("Script '{name}' exceeded {}ms", DEFAULT_EXECUTION_CAP.as_millis()),
                ))
            }
        }
    }
}

/// Host-side executor: every job goes through the registry and comes back as
/// one normalized envelope.
pub struct Dispatcher {
    registry: Arc<Registry>,
    bridge: Arc<BridgeContext>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, bridge: Arc<BridgeContext>) -> Self {
        Self { registry, bridge }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn run(
        &self,
        request_id: &str,
        script_name: &str,
        params: Value,
        cancel: CancellationToken,
        events: JobEvents,
    ) -> Envelope {
        let started = Instant::now();
        let result = self
            .registry
            .dispatch(
                Arc::clone(&self.bridge),
                request_id,
                script_name,
                params,
                cancel,
                events,
            )
            .await;
        if let Err(e) = &result {
            tracing::debug!("Script failed: script={}, error={}", script_name, e);
        }
        let meta = Meta::new(
            request_id,
            Some(script_name),
            started.elapsed().as_millis() as u64,
        );
        normalize_result(result, meta)
    }
}

#[async_trait]
impl CommandExecutor for Dispatcher {
    async fn execute(
        &self,
        command: CommandFile,
        cancel: CancellationToken,
        events: JobEvents,
    ) -> Envelope {
        self.run(&command.id, &command.script_name, command.params, cancel, events)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureStore;
    use crate::debug::NoSessions;

    struct Echo;

    #[async_trait]
    impl Script for Echo {
        fn name(&self) -> &'static str {
            "test.echo"
        }
        fn kind(&self) -> ScriptKind {
            ScriptKind::Query
        }
        fn description(&self) -> &'static str {
            "Echo params"
        }
        fn params(&self) -> ParamSchema {
            ParamSchema::new().field(Field::integer("n").required().min(1.0))
        }
        async fn run(&self, _ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
            Ok(ScriptOutput::classify(json!({ "success": true, "n": params["n"] })))
        }
    }

    struct Panics;

    #[async_trait]
    impl Script for Panics {
        fn name(&self) -> &'static str {
            "test.panic"
        }
        fn kind(&self) -> ScriptKind {
            ScriptKind::Action
        }
        fn description(&self) -> &'static str {
            "Always panics"
        }
        async fn run(&self, _ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
            panic!("boom");
        }
    }

    struct Blocks;

    #[async_trait]
    impl Script for Blocks {
        fn name(&self) -> &'static str {
            "test.block"
        }
        fn kind(&self) -> ScriptKind {
            ScriptKind::Waitable
        }
        fn description(&self) -> &'static str {
            "Waits for cancellation"
        }
        async fn run(&self, ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
            ctx.cancel.cancelled().await;
            Ok(ScriptOutput::Value(Value::Null))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = Registry::new();
        for script in [Arc::new(Echo) as Arc<dyn Script>, Arc::new(Panics), Arc::new(Blocks)] {
            registry.register(script).expect("register");
        }
        let bridge = BridgeContext::new("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        Dispatcher::new(Arc::new(registry), Arc::new(bridge))
    }

    async fn run(dispatcher: &Dispatcher, name: &str, params: Value) -> Envelope {
        dispatcher
            .run("job-1", name, params, CancellationToken::new(), JobEvents::disabled())
            .await
    }

    #[tokio::test]
    async fn test_dispatch_normalizes_and_sets_meta() {
        let envelope = run(&dispatcher(), "test.echo", json!({"n": "4"})).await;
        assert!(envelope.ok, "unexpected envelope: {envelope:?}");
        assert_eq!(envelope.data, Some(json!({"n": 4})));
        let meta = envelope.meta.expect("meta");
        assert_eq!(meta.request_id, "job-1");
        assert_eq!(meta.script_name.as_deref(), Some("test.echo"));
    }

    #[tokio::test]
    async fn test_unknown_script() {
        let envelope = run(&dispatcher(), "nope", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_SCRIPT_NOT_FOUND"));
        let error = envelope.error.expect("error");
        assert_eq!(error.details, Some(json!({"alias": "nope"})));
    }

    #[tokio::test]
    async fn test_validation_runs_before_handler() {
        let envelope = run(&dispatcher(), "test.echo", json!({"n": 0})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
        let error = envelope.error.expect("error");
        assert!(error.message.contains("n:"), "unexpected message: {}", error.message);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal() {
        let envelope = run(&dispatcher(), "test.panic", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_INTERNAL"));
    }

    #[tokio::test]
    async fn test_cancellation_reaches_waitable() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let envelope = dispatcher
            .run("job-2", "test.block", json!({}), cancel, JobEvents::disabled())
            .await;
        assert_eq!(envelope.error_code(), Some("E_CANCELLED"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Echo)).expect("first");
        assert!(registry.register(Arc::new(Echo)).is_err());
        assert_eq!(registry.len(), 1);
        let described = registry.describe();
        assert_eq!(described[0].params["required"], json!(["n"]));
    }

    #[test]
    fn test_builtin_scripts_are_registered() {
        let registry = Registry::with_builtin_scripts();
        for name in ["breakpoint.set", "debug.wait-for-hit", "debug.list-variables", "dap.compare", "script.list"] {
            assert!(registry.get(name).is_some(), "missing script: {name}");
        }
        assert_eq!(registry.len(), crate::scripts::builtin().len(), "a builtin name is duplicated");
    }
}
