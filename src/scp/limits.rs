// ── Admission control – per-host connection & session slots ──────────────────

use crate::scp::types::ScpError;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ── Permits ──────────────────────────────────────────────────────────────────

/// Holds one connection slot for a destination host. Dropping it returns the
/// slot; a client keeps its permit alive for its whole lifetime.
pub struct ConnectionPermit {
    host: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        debug!("connection slot for '{}' released", self.host);
    }
}

/// Holds one session slot for a destination host. The slot means "actively
/// transmitting": the transfer path drops it as soon as the sink stream is
/// fully written, before the remote receiver confirms completion.
pub struct SessionPermit {
    host: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        debug!("session slot for '{}' released", self.host);
    }
}

// ── Per-host limits ──────────────────────────────────────────────────────────

/// The pair of counting slots bounding one destination host. Capacities are
/// fixed at registration and never resized.
#[derive(Debug)]
pub struct HostLimits {
    host: String,
    connections: Arc<Semaphore>,
    sessions: Arc<Semaphore>,
    connection_limit: usize,
    session_limit: usize,
}

impl HostLimits {
    fn new(host: &str, connection_limit: usize, session_limit: usize) -> Arc<Self> {
        Arc::new(HostLimits {
            host: host.to_string(),
            connections: Arc::new(Semaphore::new(connection_limit)),
            sessions: Arc::new(Semaphore::new(session_limit)),
            connection_limit,
            session_limit,
        })
    }

    /// Block until a connection slot is free, then reserve it.
    pub async fn acquire_connection(&self) -> ConnectionPermit {
        let permit = self
            .connections
            .clone()
            .acquire_owned()
            .await
            .expect("connection semaphore is never closed");
        debug!("connection slot for '{}' acquired", self.host);
        ConnectionPermit {
            host: self.host.clone(),
            _permit: permit,
        }
    }

    /// Block until a session slot is free, then reserve it.
    pub async fn acquire_session(&self) -> SessionPermit {
        let permit = self
            .sessions
            .clone()
            .acquire_owned()
            .await
            .expect("session semaphore is never closed");
        debug!("session slot for '{}' acquired", self.host);
        SessionPermit {
            host: self.host.clone(),
            _permit: permit,
        }
    }

    pub fn connection_limit(&self) -> usize {
        self.connection_limit
    }

    pub fn session_limit(&self) -> usize {
        self.session_limit
    }

    /// Currently free connection slots.
    pub fn available_connections(&self) -> usize {
        self.connections.available_permits()
    }

    /// Currently free session slots.
    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Explicit registry of per-host limits, shared by whatever owns the client
/// lifecycles. Hosts must be registered before the first connect.
#[derive(Default)]
pub struct LimiterRegistry {
    hosts: RwLock<HashMap<String, Arc<HostLimits>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the limits for `host`. Replacing invalidates slots
    /// issued against the old pair, so it must not race active transfers for
    /// that host.
    pub fn register(&self, host: &str, connection_limit: usize, session_limit: usize) {
        debug!(
            "registering '{}' with {} connection / {} session slots",
            host, connection_limit, session_limit
        );
        if let Ok(mut map) = self.hosts.write() {
            map.insert(
                host.to_string(),
                HostLimits::new(host, connection_limit, session_limit),
            );
        }
    }

    /// Look up the limits for `host`.
    pub fn limits(&self, host: &str) -> Result<Arc<HostLimits>, ScpError> {
        if let Ok(map) = self.hosts.read() {
            if let Some(limits) = map.get(host) {
                return Ok(limits.clone());
            }
        }
        Err(ScpError::HostNotRegistered(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unregistered_host_is_an_error() {
        let registry = LimiterRegistry::new();
        let err = registry.limits("nowhere").unwrap_err();
        assert!(matches!(err, ScpError::HostNotRegistered(_)));
    }

    #[test]
    fn test_register_then_lookup() {
        let registry = LimiterRegistry::new();
        registry.register("build1", 2, 4);
        let limits = registry.limits("build1").unwrap();
        assert_eq!(limits.connection_limit(), 2);
        assert_eq!(limits.session_limit(), 4);
        assert_eq!(limits.available_connections(), 2);
        assert_eq!(limits.available_sessions(), 4);
    }

    #[test]
    fn test_reregister_replaces_capacities() {
        let registry = LimiterRegistry::new();
        registry.register("build1", 1, 1);
        registry.register("build1", 3, 5);
        let limits = registry.limits("build1").unwrap();
        assert_eq!(limits.connection_limit(), 3);
        assert_eq!(limits.session_limit(), 5);
    }

    #[tokio::test]
    async fn test_permit_drop_returns_slot() {
        let registry = LimiterRegistry::new();
        registry.register("build1", 1, 1);
        let limits = registry.limits("build1").unwrap();

        let permit = limits.acquire_connection().await;
        assert_eq!(limits.available_connections(), 0);
        drop(permit);
        assert_eq!(limits.available_connections(), 1);
    }

    #[tokio::test]
    async fn test_session_and_connection_slots_are_independent() {
        let registry = LimiterRegistry::new();
        registry.register("build1", 1, 2);
        let limits = registry.limits("build1").unwrap();

        let _conn = limits.acquire_connection().await;
        let _s1 = limits.acquire_session().await;
        let _s2 = limits.acquire_session().await;
        assert_eq!(limits.available_connections(), 0);
        assert_eq!(limits.available_sessions(), 0);
    }

    #[tokio::test]
    async fn test_third_session_waits_for_a_release() {
        let registry = LimiterRegistry::new();
        registry.register("build1", 1, 2);
        let limits = registry.limits("build1").unwrap();

        let first = limits.acquire_session().await;
        let _second = limits.acquire_session().await;
        assert_eq!(limits.available_sessions(), 0);

        let waiting = tokio::spawn({
            let limits = limits.clone();
            async move { limits.acquire_session().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(first);
        let third = waiting.await.unwrap();
        assert_eq!(limits.available_sessions(), 0);
        drop(third);
        assert_eq!(limits.available_sessions(), 1);
    }
}
