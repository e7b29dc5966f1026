//! Client-facing Unix socket endpoint of one backend.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{serve_connection, BackendContext};
use super::errors::ProxyError;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct SocketListener {
    backend: String,
    endpoint: PathBuf,
    drain: CancellationToken,
    force: CancellationToken,
    connections: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
}

impl SocketListener {
    /// Bind `endpoint` (owner-only permissions) and start accepting.
    ///
    /// A stale socket file left by a dead process is replaced; a live one,
    /// or any other kind of file, is a `BindError`.
    pub(crate) fn bind(ctx: Arc<BackendContext>, endpoint: &Path) -> Result<Self, ProxyError> {
        let bind_error = |reason: String| ProxyError::BindError {
            backend: ctx.name.clone(),
            endpoint: endpoint.to_path_buf(),
            reason,
        };

        remove_stale_socket(endpoint).map_err(|e| bind_error(e.to_string()))?;
        let listener = bind_private(endpoint).map_err(|e| bind_error(e.to_string()))?;

        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&ctx),
            listener,
            drain.clone(),
            force.clone(),
            connections.clone(),
        ));

        tracing::info!(backend = %ctx.name, endpoint = %endpoint.display(), "listening");
        Ok(Self {
            backend: ctx.name.clone(),
            endpoint: endpoint.to_path_buf(),
            drain,
            force,
            connections,
            accept_task: Some(accept_task),
        })
    }

    /// Connections currently being served.
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Refuse new connections and ask existing ones to finish their calls.
    pub(crate) fn stop_accepting(&self) {
        self.drain.cancel();
        self.connections.close();
    }

    /// Wait up to `grace` for connections to drain, then force them closed.
    pub(crate) async fn drain(&mut self, grace: Duration) {
        self.stop_accepting();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if tokio::time::timeout(grace, self.connections.wait()).await.is_err() {
            tracing::warn!(
                backend = %self.backend,
                remaining = self.connections.len(),
                "connections did not drain in time, closing them"
            );
            self.force.cancel();
            self.connections.wait().await;
        }
    }

    /// Remove the socket file.
    pub(crate) fn release(&self) {
        match std::fs::remove_file(&self.endpoint) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    backend = %self.backend,
                    endpoint = %self.endpoint.display(),
                    error = %e,
                    "failed to remove socket file"
                );
            }
        }
    }

    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.drain(grace).await;
        self.release();
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.force.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Bind inside a fresh owner-only directory next to `endpoint`, restrict the
/// socket to mode 0600, then link it into place. The socket is unreachable
/// until it has its final mode, and an `endpoint` that appeared in the
/// meantime is never replaced.
fn bind_private(endpoint: &Path) -> io::Result<UnixListener> {
    let file_name = endpoint
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no file name"))?;
    let parent = endpoint
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let staging = tempfile::Builder::new().prefix(".bind-").tempdir_in(parent)?;
    let staged = staging.path().join(file_name);
    let listener = UnixListener::bind(&staged)?;
    std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))?;
    std::fs::hard_link(&staged, endpoint)?;
    Ok(listener)
}

fn remove_stale_socket(endpoint: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(endpoint) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }
    if std::os::unix::net::UnixStream::connect(endpoint).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "another process is listening on this socket",
        ));
    }
    tracing::debug!(endpoint = %endpoint.display(), "removing stale socket");
    std::fs::remove_file(endpoint)
}

async fn accept_loop(
    ctx: Arc<BackendContext>,
    listener: UnixListener,
    drain: CancellationToken,
    force: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = drain.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    connections.spawn(serve_connection(
                        Arc::clone(&ctx),
                        stream,
                        drain.clone(),
                        force.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(backend = %ctx.name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!(backend = %ctx.name, "stopped accepting connections");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_private_sets_mode_and_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("files.sock");

        let listener = bind_private(&endpoint).unwrap();
        let meta = std::fs::symlink_metadata(&endpoint).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("files.sock")]);

        // The linked path reaches the listener.
        let (connected, accepted) = tokio::join!(
            tokio::net::UnixStream::connect(&endpoint),
            listener.accept()
        );
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_bind_private_never_replaces_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("taken.sock");
        std::fs::write(&endpoint, "not a socket").unwrap();

        assert!(bind_private(&endpoint).is_err());
        assert_eq!(std::fs::read_to_string(&endpoint).unwrap(), "not a socket");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
