//! Backend registry and lifecycle manager.
//!
//! [`ProxyContext`] owns every backend, in registration order. Registration
//! validates everything up front and never leaves a half-registered backend
//! behind. Starting a backend binds its endpoint and launches its upstream;
//! stopping drains connections, stops the process and releases the endpoint.
//! Shutdown applies the same steps to all backends, phase by phase.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::watch;

use super::access::AccessPolicy;
use super::codec::DEFAULT_MAX_FRAME_BYTES;
use super::connection::{BackendContext, Upstream};
use super::errors::ProxyError;
use super::host::ToolHost;
use super::listener::SocketListener;
use super::lock;
use super::router::Router;
use super::supervisor::{resolve_executable, ProcessSupervisor, SupervisorSettings};
use super::types::{BackendId, BackendSpec, BackendState, StateCell, TransportKind, TransportSpec};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Proxy-wide settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Proxy name; prefixes the temporary socket directory.
    pub name: String,
    /// Where endpoints live. A fresh temporary directory when unset.
    pub socket_dir: Option<PathBuf>,
    pub call_timeout_ms: u64,
    /// SIGTERM-to-SIGKILL window when stopping a process.
    pub stop_grace_ms: u64,
    /// How long in-flight calls may finish when a listener stops.
    pub drain_grace_ms: u64,
    /// A process exiting within this window failed to launch.
    pub startup_probe_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            name: "mcp-proxy".to_string(),
            socket_dir: None,
            call_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
            drain_grace_ms: 10_000,
            startup_probe_ms: 500,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ProxySettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }
}

// ─── Entries ─────────────────────────────────────────────────────────────────

enum SocketDir {
    Temporary(TempDir),
    Configured(PathBuf),
}

impl SocketDir {
    fn path(&self) -> &Path {
        match self {
            Self::Temporary(dir) => dir.path(),
            Self::Configured(path) => path,
        }
    }
}

/// One registered backend.
pub(crate) struct BackendEntry {
    pub id: BackendId,
    pub name: String,
    pub kind: TransportKind,
    pub auto_start: bool,
    pub state: StateCell,
    pub endpoint: PathBuf,
    pub context: Arc<BackendContext>,
    pub supervisor: Option<Arc<ProcessSupervisor>>,
    pub listener: Mutex<Option<SocketListener>>,
    /// Serialises start/stop of this backend.
    lifecycle: tokio::sync::Mutex<()>,
}

// ─── ProxyContext ────────────────────────────────────────────────────────────

pub struct ProxyContext {
    settings: ProxySettings,
    socket_dir: SocketDir,
    backends: RwLock<Vec<Arc<BackendEntry>>>,
    next_id: AtomicU64,
}

impl ProxyContext {
    /// Create an empty registry and its socket directory.
    pub fn new(settings: ProxySettings) -> Result<Self, ProxyError> {
        let socket_dir = match &settings.socket_dir {
            Some(path) => {
                std::fs::create_dir_all(path).map_err(|e| ProxyError::ConfigError {
                    reason: format!("cannot create socket dir {}: {e}", path.display()),
                })?;
                SocketDir::Configured(path.clone())
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(&format!("{}_", settings.name))
                    .tempdir()
                    .map_err(|e| ProxyError::ConfigError {
                        reason: format!("cannot create temporary socket dir: {e}"),
                    })?;
                SocketDir::Temporary(dir)
            }
        };
        tracing::debug!(socket_dir = %socket_dir.path().display(), "proxy context created");

        Ok(Self {
            settings,
            socket_dir,
            backends: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn socket_dir(&self) -> &Path {
        self.socket_dir.path()
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Register a backend in state `Registered`.
    ///
    /// Validates the name, the access policy, and the upstream: an external
    /// command must resolve to an executable, an in-process handler must
    /// yield a valid tool list.
    pub fn register(&self, spec: BackendSpec) -> Result<BackendId, ProxyError> {
        validate_name(&spec.name)?;
        if self.find(&spec.name).is_some() {
            return Err(ProxyError::DuplicateBackend { name: spec.name });
        }
        let policy = AccessPolicy::resolve(
            &spec.name,
            spec.whitelist.as_deref(),
            spec.blacklist.as_deref(),
        )?;

        let id = BackendId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let router = Arc::new(Router::new(id, &spec.name));
        let state = StateCell::new(&spec.name);
        let kind = spec.transport.kind();
        let intercepted = !spec.interceptors.is_empty();

        let (upstream, supervisor) = match spec.transport {
            TransportSpec::External(command) => {
                if resolve_executable(&command).is_none() {
                    return Err(ProxyError::LaunchError {
                        backend: spec.name,
                        reason: format!("executable '{}' not found", command.command),
                    });
                }
                let supervisor = ProcessSupervisor::new(
                    &spec.name,
                    command,
                    Arc::clone(&router),
                    state.clone(),
                    SupervisorSettings {
                        startup_probe: self.settings.startup_probe(),
                        max_frame_bytes: self.settings.max_frame_bytes,
                    },
                );
                (Upstream::Process(Arc::clone(&supervisor)), Some(supervisor))
            }
            TransportSpec::InProcess(handler) => {
                let host = ToolHost::register(handler)?;
                (Upstream::InProcess(Arc::new(host)), None)
            }
        };

        let context = Arc::new(BackendContext {
            id,
            name: spec.name.clone(),
            policy,
            interceptors: spec.interceptors,
            router,
            upstream,
            call_timeout: spec.call_timeout.unwrap_or_else(|| self.settings.call_timeout()),
            max_frame_bytes: self.settings.max_frame_bytes,
        });
        let entry = Arc::new(BackendEntry {
            id,
            name: spec.name.clone(),
            kind,
            auto_start: spec.auto_start,
            state,
            endpoint: self.socket_dir.path().join(format!("{}.sock", spec.name)),
            context,
            supervisor,
            listener: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        });

        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        if backends.iter().any(|b| b.name == entry.name) {
            return Err(ProxyError::DuplicateBackend { name: spec.name });
        }
        backends.push(entry);
        drop(backends);

        tracing::info!(
            backend = %spec.name,
            id = %id,
            kind = ?kind,
            auto_start = spec.auto_start,
            intercepted,
            "backend registered"
        );
        Ok(id)
    }

    pub fn backend_id(&self, name: &str) -> Option<BackendId> {
        self.find(name).map(|entry| entry.id)
    }

    pub fn state(&self, id: BackendId) -> Option<BackendState> {
        self.entry(id).ok().map(|entry| entry.state.get())
    }

    /// Watch a backend's state transitions.
    pub fn subscribe(&self, id: BackendId) -> Option<watch::Receiver<(BackendState, DateTime<Utc>)>> {
        self.entry(id).ok().map(|entry| entry.state.subscribe())
    }

    /// Endpoint path of every backend, in registration order.
    ///
    /// Paths are fixed at registration, so they are valid before a backend
    /// is started.
    pub fn endpoints(&self) -> Vec<(String, PathBuf)> {
        self.read()
            .iter()
            .map(|entry| (entry.name.clone(), entry.endpoint.clone()))
            .collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Bind the endpoint and launch the upstream.
    ///
    /// A bind failure leaves nothing running. A launch failure closes the
    /// endpoint again and puts the backend back where it was.
    pub async fn start(&self, id: BackendId) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let _guard = entry.lifecycle.lock().await;

        let previous = entry.state.get();
        if previous == BackendState::Running {
            tracing::debug!(backend = %entry.name, "backend already running");
            return Ok(());
        }
        let settled = match previous {
            BackendState::Degraded | BackendState::Starting => BackendState::Degraded,
            other => other,
        };
        entry.state.set(BackendState::Starting);

        let bound_here = {
            let mut listener = lock(&entry.listener);
            if listener.is_none() {
                match SocketListener::bind(Arc::clone(&entry.context), &entry.endpoint) {
                    Ok(bound) => *listener = Some(bound),
                    Err(e) => {
                        tracing::error!(backend = %entry.name, error = %e, "cannot bind endpoint");
                        entry.state.set(settled);
                        return Err(e);
                    }
                }
                true
            } else {
                false
            }
        };

        let Some(supervisor) = &entry.supervisor else {
            entry.state.set(BackendState::Running);
            return Ok(());
        };

        if settled == BackendState::Degraded {
            // Cancel any pending restart before launching afresh.
            supervisor.stop(self.settings.stop_grace()).await;
        }
        if let Err(e) = supervisor.start().await {
            tracing::error!(backend = %entry.name, error = %e, "backend failed to start");
            if bound_here {
                let listener = lock(&entry.listener).take();
                if let Some(listener) = listener {
                    listener.shutdown(Duration::ZERO).await;
                }
            }
            entry.state.set(settled);
            return Err(e);
        }
        Ok(())
    }

    /// Stop accepting, drain, stop the process, release the endpoint.
    pub async fn stop(&self, id: BackendId) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let _guard = entry.lifecycle.lock().await;

        if matches!(entry.state.get(), BackendState::Registered | BackendState::Stopped) {
            return Ok(());
        }
        let listener = lock(&entry.listener).take();
        if let Some(mut listener) = listener {
            listener.drain(self.settings.drain_grace()).await;
            if let Some(supervisor) = &entry.supervisor {
                supervisor.stop(self.settings.stop_grace()).await;
            }
            listener.release();
        } else if let Some(supervisor) = &entry.supervisor {
            supervisor.stop(self.settings.stop_grace()).await;
        }
        entry.context.router.fail_all("backend stopped");
        entry.state.set(BackendState::Stopped);
        Ok(())
    }

    /// Start every backend registered with `auto_start`, concurrently.
    ///
    /// Returns the backends that failed (partial startup is acceptable).
    pub async fn start_all(&self) -> Vec<(String, ProxyError)> {
        let entries: Vec<Arc<BackendEntry>> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.auto_start)
            .collect();

        let results = join_all(entries.iter().map(|entry| async move {
            (entry.name.clone(), self.start(entry.id).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    /// Stop everything: all listeners stop accepting, connections drain,
    /// every process is stopped, endpoints are released, the socket
    /// directory is removed if the proxy created it.
    pub async fn shutdown(self) {
        let entries = self.entries();
        tracing::info!(backends = entries.len(), "shutting down proxy");
        let _guards = join_all(entries.iter().map(|entry| entry.lifecycle.lock())).await;

        let mut listeners: Vec<SocketListener> = entries
            .iter()
            .filter_map(|entry| lock(&entry.listener).take())
            .collect();
        for listener in &listeners {
            listener.stop_accepting();
        }

        let drain_grace = self.settings.drain_grace();
        join_all(listeners.iter_mut().map(|listener| listener.drain(drain_grace))).await;

        let stop_grace = self.settings.stop_grace();
        join_all(
            entries
                .iter()
                .filter_map(|entry| entry.supervisor.as_ref())
                .map(|supervisor| supervisor.stop(stop_grace)),
        )
        .await;

        for listener in &listeners {
            listener.release();
        }
        for entry in &entries {
            entry.context.router.fail_all("proxy shutting down");
            if entry.state.get() != BackendState::Registered {
                entry.state.set(BackendState::Stopped);
            }
        }
        tracing::info!("proxy shut down");
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<BackendEntry>>> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn entries(&self) -> Vec<Arc<BackendEntry>> {
        self.read().clone()
    }

    fn find(&self, name: &str) -> Option<Arc<BackendEntry>> {
        self.read().iter().find(|entry| entry.name == name).cloned()
    }

    fn entry(&self, id: BackendId) -> Result<Arc<BackendEntry>, ProxyError> {
        self.read()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownBackend(id.to_string()))
    }
}

/// Backend names become socket file names.
fn validate_name(name: &str) -> Result<(), ProxyError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::ConfigError {
            reason: format!(
                "invalid backend name '{name}': use 1-64 letters, digits, '-', '_' or '.'"
            ),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
