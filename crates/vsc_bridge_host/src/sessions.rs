use std::sync::{Arc, PoisonError, RwLock};

use vsc_bridge_core::debug::{DebugSession, SessionProvider};

use crate::dap::DapSession;

/// The one debug session this host drives at a time.
#[derive(Default)]
pub struct SessionManager {
    active: RwLock<Option<Arc<DapSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session` active, handing back the one it replaces.
    pub fn set(&self, session: Arc<DapSession>) -> Option<Arc<DapSession>> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session)
    }

    pub fn take(&self) -> Option<Arc<DapSession>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// The live session. One that has ended is retired here: the slot is
    /// cleared and its adapter stopped.
    pub fn current(&self) -> Option<Arc<DapSession>> {
        let session = self.active.read().unwrap_or_else(PoisonError::into_inner).clone()?;
        if !session.is_ended() {
            return Some(session);
        }
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
            active.take();
            tracing::info!("Retiring ended debug session: id={}", session.id());
            session.shutdown();
        }
        None
    }
}

impl SessionProvider for SessionManager {
    fn active_session(&self) -> Option<Arc<dyn DebugSession>> {
        self.current().map(|s| s as Arc<dyn DebugSession>)
    }
}
