//! Server file loading.
//!
//! Reads a YAML or JSON file with an optional `settings` table and an
//! `mcpServers` map, and resolves environment variables written as
//! `${VAR_NAME}` or `${VAR_NAME:-default}` before parsing.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::proxy::codec::Framing;
use crate::proxy::registry::ProxySettings;
use crate::proxy::types::{BackendSpec, CommandSpec, RestartPolicy};
use crate::proxy::ProxyError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A parsed server file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub settings: ProxySettings,
    /// Backends by name; registered in name order.
    #[serde(default, rename = "mcpServers")]
    pub servers: BTreeMap<String, ServerEntry>,
}

/// One backend entry under `mcpServers`.
///
/// The command is given either as a single `start` string, split like a
/// shell would, or as `command` plus `args`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub inherit_env: bool,
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub blacklist: Option<Vec<String>>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Framing spoken on the process's stdio (default `content_length`).
    #[serde(default)]
    pub framing: Option<Framing>,
    /// Relaunch on unexpected exit. Disabled when absent.
    #[serde(default)]
    pub restart: Option<RestartEntry>,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RestartEntry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_auto_start() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    RestartPolicy::default().max_attempts
}
fn default_base_delay_ms() -> u64 {
    RestartPolicy::default().base_delay.as_millis() as u64
}
fn default_max_delay_ms() -> u64 {
    RestartPolicy::default().max_delay.as_millis() as u64
}

impl From<RestartEntry> for RestartPolicy {
    fn from(entry: RestartEntry) -> Self {
        Self {
            max_attempts: entry.max_attempts,
            base_delay: Duration::from_millis(entry.base_delay_ms),
            max_delay: Duration::from_millis(entry.max_delay_ms),
        }
    }
}

impl ServerEntry {
    /// Entry for a bare command line.
    pub fn from_start(start: &str) -> Self {
        Self {
            start: Some(start.to_string()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: false,
            whitelist: None,
            blacklist: None,
            auto_start: true,
            framing: None,
            restart: None,
            call_timeout_ms: None,
        }
    }

    /// Convert into a registrable backend spec named `name`.
    pub fn to_backend_spec(&self, name: &str) -> Result<BackendSpec, ProxyError> {
        let invalid = |reason: String| ProxyError::ConfigError {
            reason: format!("server '{name}': {reason}"),
        };

        let (command, args) = match (&self.start, &self.command) {
            (Some(_), Some(_)) => {
                return Err(invalid("give either 'start' or 'command', not both".into()))
            }
            (Some(start), None) => {
                let mut words = shell_words::split(start)
                    .map_err(|e| invalid(format!("cannot split start command: {e}")))?;
                if words.is_empty() {
                    return Err(invalid("empty start command".into()));
                }
                let command = words.remove(0);
                words.extend(self.args.iter().cloned());
                (command, words)
            }
            (None, Some(command)) if !command.trim().is_empty() => {
                (command.clone(), self.args.clone())
            }
            _ => return Err(invalid("missing 'start' or 'command'".into())),
        };

        let mut spec = CommandSpec::new(&command);
        spec.args = args;
        spec.env = self.env.clone();
        spec.cwd = self.cwd.as_deref().map(expand_tilde);
        spec.inherit_env = self.inherit_env;
        if let Some(framing) = self.framing {
            spec.framing = framing;
        }
        spec.restart = self.restart.map(RestartPolicy::from);

        let mut backend = BackendSpec::external(name, spec).auto_start(self.auto_start);
        backend.whitelist = self.whitelist.clone();
        backend.blacklist = self.blacklist.clone();
        if let Some(ms) = self.call_timeout_ms {
            backend = backend.call_timeout(Duration::from_millis(ms));
        }
        Ok(backend)
    }
}

impl ProxyConfig {
    /// Backend specs for every entry, in name order.
    pub fn backend_specs(&self) -> Result<Vec<BackendSpec>, ProxyError> {
        self.servers
            .iter()
            .map(|(name, entry)| entry.to_backend_spec(name))
            .collect()
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse a server file.
pub fn load_proxy_config(path: &Path) -> Result<ProxyConfig, ProxyError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ProxyError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = parse_proxy_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded server configuration"
    );
    Ok(config)
}

/// Parse server file text. YAML and JSON are both accepted.
pub fn parse_proxy_config(raw: &str) -> Result<ProxyConfig, ProxyError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: ProxyConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ProxyError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    if let Some(dir) = &config.settings.socket_dir {
        config.settings.socket_dir = Some(expand_tilde(&dir.to_string_lossy()));
    }
    Ok(config)
}

/// Parse a `name:command args…` spec from the command line.
///
/// Command-line backends inherit the proxy's environment and speak
/// `framing` on their stdio.
pub fn parse_server_spec(spec: &str, framing: Framing) -> Result<BackendSpec, ProxyError> {
    let Some((name, command)) = spec.split_once(':') else {
        return Err(ProxyError::ConfigError {
            reason: format!("invalid server spec '{spec}': expected 'name:command args'"),
        });
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(ProxyError::ConfigError {
            reason: format!("invalid server spec '{spec}': empty name"),
        });
    }
    let mut entry = ServerEntry::from_start(command.trim());
    entry.inherit_env = true;
    entry.framing = Some(framing);
    entry.to_backend_spec(name)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` references.
///
/// A reference without its closing brace is kept as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let Some(end) = reference.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&lookup_var(&reference[..end]));
        rest = &reference[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Value of `VAR`, or of `VAR:-default` where an unset or empty variable
/// takes the default (with `~` expanded).
fn lookup_var(expr: &str) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };
    match std::env::var(name.trim()) {
        Ok(value) if !value.is_empty() || default.is_none() => value,
        _ => default
            .map(|d| expand_tilde(d).to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Expand `~` or a leading `~/` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (Path::new(path).strip_prefix("~"), home) {
        (Ok(rest), Some(home)) if rest.as_os_str().is_empty() => home,
        (Ok(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::TransportSpec;

    fn command_of(spec: &BackendSpec) -> &CommandSpec {
        match &spec.transport {
            TransportSpec::External(command) => command,
            TransportSpec::InProcess(_) => panic!("expected an external backend"),
        }
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TEST_PROXY_UNSET_VAR__");
        let result = interpolate_env_vars("${__TEST_PROXY_UNSET_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_PROXY_TOKEN__", "s3cret");
        let result = interpolate_env_vars("token: ${__TEST_PROXY_TOKEN__}");
        assert_eq!(result, "token: s3cret");
        std::env::remove_var("__TEST_PROXY_TOKEN__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain: text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_interpolate_empty_var_takes_default_and_unterminated_is_kept() {
        std::env::set_var("__TEST_PROXY_EMPTY__", "");
        assert_eq!(interpolate_env_vars("a=${__TEST_PROXY_EMPTY__:-x}"), "a=x");
        assert_eq!(interpolate_env_vars("a=${__TEST_PROXY_EMPTY__}!"), "a=!");
        std::env::remove_var("__TEST_PROXY_EMPTY__");

        assert_eq!(interpolate_env_vars("keep ${UNCLOSED"), "keep ${UNCLOSED");
    }

    #[test]
    fn test_expand_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_tilde("~/work"), home.join("work"));
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~alice/work"), PathBuf::from("~alice/work"));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
settings:
  name: dev-proxy
  call_timeout_ms: 5000
mcpServers:
  playwright:
    start: "npx @playwright/mcp@latest --headless"
    whitelist: [browser_navigate, browser_snapshot]
    framing: line
  files:
    command: python3
    args: ["-m", "files_server"]
    env:
      ROOT: /srv
    auto_start: false
    restart:
      max_attempts: 5
      base_delay_ms: 200
    call_timeout_ms: 1000
"#;
        let config = parse_proxy_config(yaml).unwrap();
        assert_eq!(config.settings.name, "dev-proxy");
        assert_eq!(config.settings.call_timeout_ms, 5000);
        assert_eq!(config.settings.stop_grace_ms, 5000);

        let specs = config.backend_specs().unwrap();
        assert_eq!(specs.len(), 2);
        // Name order.
        assert_eq!(specs[0].name, "files");
        assert_eq!(specs[1].name, "playwright");

        let files = &specs[0];
        assert!(!files.auto_start);
        assert_eq!(files.call_timeout, Some(Duration::from_secs(1)));
        let command = command_of(files);
        assert_eq!(command.command, "python3");
        assert_eq!(command.args, vec!["-m", "files_server"]);
        assert_eq!(command.env.get("ROOT").map(String::as_str), Some("/srv"));
        assert_eq!(command.framing, Framing::ContentLength);
        let restart = command.restart.unwrap();
        assert_eq!(restart.max_attempts, 5);
        assert_eq!(restart.base_delay, Duration::from_millis(200));
        assert_eq!(restart.max_delay, Duration::from_secs(30));

        let playwright = &specs[1];
        assert!(playwright.auto_start);
        assert_eq!(
            playwright.whitelist.as_deref(),
            Some(&["browser_navigate".to_string(), "browser_snapshot".to_string()][..])
        );
        let command = command_of(playwright);
        assert_eq!(command.command, "npx");
        assert_eq!(command.args, vec!["@playwright/mcp@latest", "--headless"]);
        assert_eq!(command.framing, Framing::Line);
        assert!(command.restart.is_none());
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{"mcpServers": {"echo": {"start": "cat", "blacklist": ["rm"]}}}"#;
        let config = parse_proxy_config(json).unwrap();
        assert_eq!(config.settings, ProxySettings::default());
        let specs = config.backend_specs().unwrap();
        assert_eq!(specs[0].blacklist.as_deref(), Some(&["rm".to_string()][..]));
    }

    #[test]
    fn test_malformed_entries_name_the_server() {
        let config = parse_proxy_config("mcpServers:\n  broken:\n    env: {A: b}\n").unwrap();
        let err = config.backend_specs().unwrap_err().to_string();
        assert!(err.contains("broken"), "{err}");

        let both = parse_proxy_config("mcpServers:\n  twice:\n    start: cat\n    command: cat\n")
            .unwrap();
        assert!(both.backend_specs().is_err());

        let unbalanced = ServerEntry::from_start("cat 'unterminated");
        assert!(unbalanced.to_backend_spec("quotes").is_err());

        assert!(parse_proxy_config("mcpServers: [1, 2").is_err());
    }

    #[test]
    fn test_load_proxy_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.yaml");
        std::fs::write(&path, "mcpServers:\n  echo:\n    start: cat\n").unwrap();
        let config = load_proxy_config(&path).unwrap();
        assert!(config.servers.contains_key("echo"));

        assert!(load_proxy_config(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_parse_server_spec() {
        let spec = parse_server_spec("playwright:npx @playwright/mcp@latest", Framing::Line).unwrap();
        assert_eq!(spec.name, "playwright");
        let command = command_of(&spec);
        assert_eq!(command.command, "npx");
        assert_eq!(command.args, vec!["@playwright/mcp@latest"]);
        assert_eq!(command.framing, Framing::Line);
        assert!(command.inherit_env);

        let quoted = parse_server_spec(" tool : sh -c 'echo hi' ", Framing::ContentLength).unwrap();
        assert_eq!(quoted.name, "tool");
        assert_eq!(command_of(&quoted).args, vec!["-c", "echo hi"]);
        assert_eq!(command_of(&quoted).framing, Framing::ContentLength);

        assert!(parse_server_spec("no-colon", Framing::Line).is_err());
        assert!(parse_server_spec(":cmd", Framing::Line).is_err());
        assert!(parse_server_spec("name:", Framing::Line).is_err());
    }
}
