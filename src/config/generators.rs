//! Client configuration generation.
//!
//! Each backend becomes one `mcpServers` entry that runs `socat` to bridge
//! the client's stdio to the backend's socket.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::proxy::supervisor::resolve_executable;
use crate::proxy::types::CommandSpec;
use crate::proxy::{ProxyContext, ProxyError, ProxyStatus};

/// MCP client whose configuration format to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Gemini,
    Claude,
}

impl ClientKind {
    pub fn config_file_name(self) -> &'static str {
        match self {
            Self::Gemini => "settings.json",
            Self::Claude => "claude_config.json",
        }
    }
}

impl FromStr for ClientKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "claude" => Ok(Self::Claude),
            other => Err(ProxyError::ConfigError {
                reason: format!("unknown client '{other}': expected 'gemini' or 'claude'"),
            }),
        }
    }
}

/// A backend as a client should see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub name: String,
    pub endpoint: PathBuf,
}

impl ClientEntry {
    /// Entries for every backend whose endpoint is bound.
    pub fn from_status(status: &ProxyStatus) -> Vec<Self> {
        status
            .listening()
            .map(|backend| Self {
                name: backend.name.clone(),
                endpoint: backend.endpoint.clone(),
            })
            .collect()
    }
}

/// Build the client configuration document.
pub fn generate_client_config(kind: ClientKind, entries: &[ClientEntry]) -> Value {
    let socat = resolve_executable(&CommandSpec::new("socat"))
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "socat".to_string());

    let mut servers = Map::new();
    for entry in entries {
        let mut stanza = json!({
            "command": socat,
            "args": ["STDIO", format!("UNIX-CONNECT:{}", entry.endpoint.display())],
        });
        if kind == ClientKind::Claude {
            stanza["type"] = json!("stdio");
        }
        servers.insert(entry.name.clone(), stanza);
    }
    json!({ "mcpServers": servers })
}

/// Client configuration for the proxy's currently bound backends.
pub fn client_config_for(proxy: &ProxyContext, kind: ClientKind) -> Value {
    generate_client_config(kind, &ClientEntry::from_status(&proxy.status()))
}

/// Atomically write `config` into `dir` under the client's file name.
///
/// The file is created with owner-only permissions. A symlinked `dir` is
/// refused.
pub fn write_client_config(kind: ClientKind, config: &Value, dir: &Path) -> Result<PathBuf, ProxyError> {
    let config_error = |reason: String| ProxyError::ConfigError { reason };

    if std::fs::symlink_metadata(dir).is_ok_and(|meta| meta.file_type().is_symlink()) {
        return Err(config_error(format!(
            "refusing to write client config into symlinked directory {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| config_error(format!("cannot create {}: {e}", dir.display())))?;

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| config_error(format!("cannot serialise client config: {e}")))?;

    // Write to a temp file in the same directory, then rename into place.
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| config_error(format!("cannot create temp file in {}: {e}", dir.display())))?;
    tmp.write_all(content.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| config_error(format!("cannot write client config: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| config_error(format!("cannot restrict client config permissions: {e}")))?;
    }

    let path = dir.join(kind.config_file_name());
    tmp.persist(&path)
        .map_err(|e| config_error(format!("cannot write {}: {}", path.display(), e.error)))?;

    tracing::info!(client = ?kind, path = %path.display(), "wrote client configuration");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ClientEntry> {
        vec![
            ClientEntry {
                name: "files".into(),
                endpoint: PathBuf::from("/tmp/proxy_x/files.sock"),
            },
            ClientEntry {
                name: "web".into(),
                endpoint: PathBuf::from("/tmp/proxy_x/web.sock"),
            },
        ]
    }

    #[test]
    fn test_client_kind_parsing() {
        assert_eq!("gemini".parse::<ClientKind>().unwrap(), ClientKind::Gemini);
        assert_eq!(" Claude ".parse::<ClientKind>().unwrap(), ClientKind::Claude);
        assert!("cursor".parse::<ClientKind>().is_err());
        assert_eq!(ClientKind::Gemini.config_file_name(), "settings.json");
    }

    #[test]
    fn test_gemini_config_has_one_stanza_per_backend() {
        let config = generate_client_config(ClientKind::Gemini, &entries());
        let servers = config["mcpServers"].as_object().unwrap();
        assert_eq!(servers.len(), 2);
        let files = &servers["files"];
        assert!(files["command"].as_str().unwrap().ends_with("socat"));
        assert_eq!(
            files["args"],
            json!(["STDIO", "UNIX-CONNECT:/tmp/proxy_x/files.sock"])
        );
        assert!(files.get("type").is_none());
    }

    #[test]
    fn test_claude_config_marks_stdio_type() {
        let config = generate_client_config(ClientKind::Claude, &entries());
        assert_eq!(config["mcpServers"]["web"]["type"], "stdio");
        assert_eq!(
            generate_client_config(ClientKind::Claude, &[]),
            json!({"mcpServers": {}})
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_config_lists_only_bound_backends() {
        use crate::proxy::test_support::Calculator;
        use crate::proxy::{BackendSpec, ProxySettings};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let proxy = ProxyContext::new(ProxySettings {
            socket_dir: Some(dir.path().to_path_buf()),
            ..ProxySettings::default()
        })
        .unwrap();
        let id = proxy.register(BackendSpec::in_process(Arc::new(Calculator))).unwrap();
        assert_eq!(client_config_for(&proxy, ClientKind::Gemini), json!({"mcpServers": {}}));

        proxy.start(id).await.unwrap();
        let config = client_config_for(&proxy, ClientKind::Gemini);
        let endpoint = format!("UNIX-CONNECT:{}", dir.path().join("calc.sock").display());
        assert_eq!(config["mcpServers"]["calc"]["args"][1], json!(endpoint));
        proxy.shutdown().await;
    }

    #[cfg(unix)]
    #[test]
    fn test_write_client_config_is_private_and_atomic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let config = generate_client_config(ClientKind::Gemini, &entries());
        let path = write_client_config(ClientKind::Gemini, &config, &target).unwrap();

        assert_eq!(path, target.join("settings.json"));
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, config);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        // Only the final file remains.
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);

        // Overwrites in place.
        let path = write_client_config(ClientKind::Gemini, &json!({"mcpServers": {}}), &target).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("mcpServers"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_client_config_refuses_symlinked_dir() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = write_client_config(ClientKind::Claude, &json!({}), &link).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError { .. }));
        assert_eq!(std::fs::read_dir(&real).unwrap().count(), 0);
    }
}
