//! Read-only status snapshot over the registry.

use std::path::PathBuf;

use serde::Serialize;

use super::lock;
use super::registry::ProxyContext;
use super::types::{BackendState, TransportKind};

/// One backend as seen at snapshot time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub kind: TransportKind,
    pub state: BackendState,
    pub endpoint: PathBuf,
    /// Whether the endpoint socket is currently bound.
    pub listening: bool,
    /// `None` for in-process backends.
    pub subprocess_alive: Option<bool>,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub in_flight: usize,
    pub orphaned_responses: u64,
    pub connections: usize,
    pub policy: String,
    /// RFC 3339 time of the last state change.
    pub since: String,
}

/// Snapshot of the whole proxy, backends in registration order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub name: String,
    pub socket_dir: PathBuf,
    pub backends: Vec<BackendStatus>,
}

impl ProxyStatus {
    pub fn backend(&self, name: &str) -> Option<&BackendStatus> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn running_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.state == BackendState::Running)
            .count()
    }

    /// Backends a client can connect to right now.
    pub fn listening(&self) -> impl Iterator<Item = &BackendStatus> {
        self.backends.iter().filter(|b| b.listening)
    }
}

impl ProxyContext {
    /// Snapshot every backend. Never blocks on a lifecycle operation.
    pub fn status(&self) -> ProxyStatus {
        let backends = self
            .entries()
            .iter()
            .map(|entry| {
                let connections = lock(&entry.listener)
                    .as_ref()
                    .map(|listener| listener.connection_count());
                let supervisor = entry.supervisor.as_ref();
                BackendStatus {
                    name: entry.name.clone(),
                    kind: entry.kind,
                    state: entry.state.get(),
                    endpoint: entry.endpoint.clone(),
                    listening: connections.is_some(),
                    subprocess_alive: supervisor.map(|s| s.is_alive()),
                    pid: supervisor.and_then(|s| s.pid()),
                    restarts: supervisor.map_or(0, |s| s.restarts()),
                    in_flight: entry.context.router.in_flight(),
                    orphaned_responses: entry.context.router.orphaned(),
                    connections: connections.unwrap_or(0),
                    policy: entry.context.policy.summary(),
                    since: entry.state.since().to_rfc3339(),
                }
            })
            .collect();

        ProxyStatus {
            name: self.settings().name.clone(),
            socket_dir: self.socket_dir().to_path_buf(),
            backends,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::proxy::registry::ProxySettings;
    use crate::proxy::test_support::{echo_backend, Calculator};
    use crate::proxy::types::BackendSpec;

    fn context() -> (ProxyContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProxySettings {
            name: "status-test".into(),
            socket_dir: Some(dir.path().to_path_buf()),
            startup_probe_ms: 100,
            stop_grace_ms: 500,
            drain_grace_ms: 500,
            ..ProxySettings::default()
        };
        (ProxyContext::new(settings).unwrap(), dir)
    }

    #[test]
    fn test_status_of_registered_backends() {
        let (proxy, dir) = context();
        proxy
            .register(BackendSpec::external("echo", echo_backend()).blacklist(["rm"]))
            .unwrap();
        proxy
            .register(BackendSpec::in_process(Arc::new(Calculator)))
            .unwrap();

        let status = proxy.status();
        assert_eq!(status.name, "status-test");
        assert_eq!(status.socket_dir, dir.path());
        let names: Vec<&str> = status.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "calc"]);

        let echo = status.backend("echo").unwrap();
        assert_eq!(echo.state, BackendState::Registered);
        assert_eq!(echo.kind, TransportKind::External);
        assert_eq!(echo.subprocess_alive, Some(false));
        assert_eq!(echo.policy, "blacklist [rm]");
        assert_eq!(echo.endpoint, dir.path().join("echo.sock"));
        assert!(!echo.listening);

        let calc = status.backend("calc").unwrap();
        assert_eq!(calc.subprocess_alive, None);
        assert_eq!(calc.policy, "unrestricted");
        assert_eq!(status.running_count(), 0);
        assert_eq!(status.listening().count(), 0);
    }

    #[tokio::test]
    async fn test_status_tracks_running_backends() {
        let (proxy, _dir) = context();
        let id = proxy.register(BackendSpec::external("echo", echo_backend())).unwrap();
        proxy
            .register(BackendSpec::in_process(Arc::new(Calculator)).auto_start(false))
            .unwrap();
        assert!(proxy.start_all().await.is_empty());

        let status = proxy.status();
        let echo = status.backend("echo").unwrap();
        assert_eq!(echo.state, BackendState::Running);
        assert_eq!(echo.subprocess_alive, Some(true));
        assert!(echo.pid.is_some());
        assert!(echo.listening);
        assert_eq!(status.backend("calc").unwrap().state, BackendState::Registered);
        assert_eq!(status.running_count(), 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["backends"][0]["subprocessAlive"], true);
        assert_eq!(json["backends"][0]["state"], "running");
        assert!(chrono::DateTime::parse_from_rfc3339(json["backends"][0]["since"].as_str().unwrap()).is_ok());

        proxy.stop(id).await.unwrap();
        let echo = proxy.status().backend("echo").cloned().unwrap();
        assert_eq!(echo.state, BackendState::Stopped);
        assert_eq!(echo.subprocess_alive, Some(false));
        assert!(!echo.listening);
        proxy.shutdown().await;
    }
}
