//! Registry of live relay sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Backend service a session relays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Vnc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ssh => f.write_str("ssh"),
            Protocol::Vnc => f.write_str("vnc"),
        }
    }
}

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub vm_id: String,
    pub protocol: Protocol,
    /// Backend `host:port`.
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

struct SessionEntry {
    info: SessionInfo,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Sessions keyed by id. One lock guards every registration, lookup and removal.
///
/// Cloning shares the same underlying map; the registry is owned by whoever builds the
/// [`TunnelService`](crate::TunnelService) rather than being process-global.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, info: SessionInfo, shutdown: oneshot::Sender<()>) {
        tracing::info!(
            session_id = %info.session_id,
            vm_id = %info.vm_id,
            protocol = %info.protocol,
            target = %info.target,
            "Registered tunnel session"
        );
        self.lock().insert(
            info.session_id,
            SessionEntry {
                info,
                shutdown: Some(shutdown),
            },
        );
    }

    /// Remove a session; returns whether it was present.
    pub(crate) fn deregister(&self, session_id: Uuid) -> bool {
        let removed = self.lock().remove(&session_id);
        if let Some(entry) = &removed {
            tracing::info!(
                session_id = %session_id,
                vm_id = %entry.info.vm_id,
                "Deregistered tunnel session"
            );
        }
        removed.is_some()
    }

    /// Snapshot of the sessions open against a VM, oldest first.
    pub fn active_sessions_for(&self, vm_id: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .lock()
            .values()
            .filter(|entry| entry.info.vm_id == vm_id)
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.opened_at);
        sessions
    }

    /// Signal every session of a VM to shut down; returns how many were signalled.
    ///
    /// Each session deregisters itself once its relay has stopped and both streams are closed.
    pub fn close_sessions_for(&self, vm_id: &str) -> usize {
        self.signal(|info| info.vm_id == vm_id)
    }

    /// Signal every session to shut down.
    pub fn close_all(&self) -> usize {
        self.signal(|_| true)
    }

    fn signal(&self, matches: impl Fn(&SessionInfo) -> bool) -> usize {
        let mut sessions = self.lock();
        let mut signalled = 0;
        for entry in sessions.values_mut().filter(|entry| matches(&entry.info)) {
            if let Some(shutdown) = entry.shutdown.take() {
                let _ = shutdown.send(());
                signalled += 1;
            }
        }
        if signalled > 0 {
            tracing::info!(sessions = signalled, "Closing tunnel sessions");
        }
        signalled
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vm_id: &str, protocol: Protocol) -> SessionInfo {
        SessionInfo {
            session_id: Uuid::new_v4(),
            vm_id: vm_id.to_string(),
            protocol,
            target: "127.0.0.1:22".to_string(),
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_lookup_by_vm() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        registry.register(info("vm-a", Protocol::Ssh), tx1);
        registry.register(info("vm-a", Protocol::Vnc), tx2);
        registry.register(info("vm-b", Protocol::Ssh), tx3);

        let sessions = registry.active_sessions_for("vm-a");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().any(|s| s.protocol == Protocol::Vnc));
        assert_eq!(registry.active_sessions_for("vm-c").len(), 0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_close_signals_once() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        let session = info("vm-a", Protocol::Ssh);
        let id = session.session_id;
        registry.register(session, tx);

        assert_eq!(registry.close_sessions_for("vm-a"), 1);
        assert!(rx.try_recv().is_ok());
        // Already signalled; still registered until the relay deregisters it.
        assert_eq!(registry.close_sessions_for("vm-a"), 0);
        assert_eq!(registry.len(), 1);

        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        assert!(registry.is_empty());
    }
}
