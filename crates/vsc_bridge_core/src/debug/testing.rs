//! Scriptable in-memory debug sessions for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::debug::adapter::{DebugSession, SessionProvider};
use crate::error::DapError;

type Handler = Arc<dyn Fn(&Value) -> Result<Value, DapError> + Send + Sync>;

pub struct MockSession {
    id: String,
    session_type: String,
    handlers: HashMap<String, Handler>,
    log: Mutex<Vec<(String, Value)>>,
}

impl MockSession {
    pub fn new(id: &str, session_type: &str) -> Self {
        Self {
            id: id.to_string(),
            session_type: session_type.to_string(),
            handlers: HashMap::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn on(
        mut self,
        command: &str,
        handler: impl Fn(&Value) -> Result<Value, DapError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(command.to_string(), Arc::new(handler));
        self
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.log.lock().expect("log lock").clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.requests().iter().filter(|(c, _)| c == command).count()
    }
}

#[async_trait]
impl DebugSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn session_type(&self) -> &str {
        &self.session_type
    }

    fn name(&self) -> &str {
        "Mock"
    }

    async fn request(&self, command: &str, args: Value) -> Result<Value, DapError> {
        self.log
            .lock()
            .expect("log lock")
            .push((command.to_string(), args.clone()));
        match self.handlers.get(command) {
            Some(handler) => handler(&args),
            None => Err(DapError::request(command, "Unsupported in mock")),
        }
    }
}

/// A provider whose active session tests can swap at any time.
#[derive(Default)]
pub struct StaticSessions {
    active: Mutex<Option<Arc<dyn DebugSession>>>,
}

impl StaticSessions {
    pub fn with(session: Arc<dyn DebugSession>) -> Self {
        Self {
            active: Mutex::new(Some(session)),
        }
    }

    pub fn set(&self, session: Option<Arc<dyn DebugSession>>) {
        *self.active.lock().expect("sessions lock") = session;
    }
}

impl SessionProvider for StaticSessions {
    fn active_session(&self) -> Option<Arc<dyn DebugSession>> {
        self.active.lock().expect("sessions lock").clone()
    }
}
