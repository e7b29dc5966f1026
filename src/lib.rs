//! MCP Proxy — per-backend socket multiplexer for MCP tool servers.
//!
//! Each registered backend (an external stdio process or an in-process
//! [`ToolHandler`]) gets its own Unix socket. Clients connect to the socket;
//! the proxy applies access control and interceptors to every tool call and
//! correlates responses back to the right client.

pub mod config;
pub mod proxy;

pub use proxy::{
    AccessPolicy, BackendSpec, BackendState, CommandSpec, ProxyContext, ProxyError,
    ProxySettings, ProxyStatus, ToolHandler,
};

/// Return the platform-standard data directory for the proxy.
///
/// - macOS: `~/Library/Application Support/mcp-proxy/`
/// - Linux: `$XDG_DATA_HOME/mcp-proxy/` (fallback `~/.local/share/mcp-proxy/`)
///
/// Falls back to `~/.mcp-proxy/` when neither can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-proxy");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-proxy")
}

/// How the binary wants its logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Default to `debug` for this crate instead of `info`.
    pub verbose: bool,
    /// One JSON object per event.
    pub json: bool,
    /// Write to `proxy.log` in the data directory instead of stderr.
    pub log_file: bool,
}

/// Initialise the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. With `log_file`, earlier logs are
/// shifted to `proxy.log.1` through `proxy.log.3` and a fresh `proxy.log` is
/// opened.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let default_filter = if options.verbose {
        "mcp_proxy=debug,info"
    } else {
        "mcp_proxy=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (writer, log_path) = if options.log_file {
        let path = data_dir().join(LOG_FILE_NAME);
        let sink = LogFile::open_rotated(&path, LOG_GENERATIONS)?;
        (BoxMakeWriter::new(sink), Some(path))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.is_none() && !options.json)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-proxy starting ==="
    );
    Ok(())
}

const LOG_FILE_NAME: &str = "proxy.log";

/// Older logs kept next to the current one.
const LOG_GENERATIONS: u32 = 3;

/// Log file shared by every thread.
///
/// Each event holds the lock for all of its writes, so lines from concurrent
/// tasks never interleave. `File` is unbuffered, so a finished event is
/// already with the OS.
struct LogFile(std::sync::Mutex<std::fs::File>);

impl LogFile {
    fn open_rotated(path: &std::path::Path, keep: u32) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        shift_generations(path, keep);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self(std::sync::Mutex::new(file)))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFile {
    type Writer = LogEvent<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogEvent(proxy::lock(&self.0))
    }
}

/// Writer for one event; the file stays locked until it is dropped.
struct LogEvent<'a>(std::sync::MutexGuard<'a, std::fs::File>);

impl std::io::Write for LogEvent<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::Write::write(&mut *self.0, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.0)
    }
}

/// Move `path` to `path.1`, `path.1` to `path.2` and so on, dropping
/// whatever would land past `path.{keep}`.
fn shift_generations(path: &std::path::Path, keep: u32) {
    let generation = |n: u32| {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        std::path::PathBuf::from(name)
    };

    if keep == 0 {
        let _ = std::fs::remove_file(path);
        return;
    }
    // Oldest first, so no rename lands on a file that has not moved yet.
    let _ = std::fs::remove_file(generation(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(generation(n), generation(n + 1));
    }
    let _ = std::fs::rename(path, generation(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn test_shift_generations_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("proxy.log");
        let named = |suffix: &str| dir.path().join(format!("proxy.log{suffix}"));
        for (suffix, content) in [("", "current"), (".1", "one"), (".2", "two"), (".3", "three")] {
            std::fs::write(named(suffix), content).unwrap();
        }

        shift_generations(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| std::fs::read_to_string(named(suffix)).unwrap();
        assert_eq!(read(".1"), "current");
        assert_eq!(read(".2"), "one");
        assert_eq!(read(".3"), "two");
        assert!(!named(".4").exists());
    }

    #[test]
    fn test_shift_generations_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("proxy.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("proxy.log.2"), "two").unwrap();

        shift_generations(&base, 3);

        assert_eq!(std::fs::read_to_string(dir.path().join("proxy.log.1")).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(dir.path().join("proxy.log.3")).unwrap(), "two");
    }

    #[test]
    fn test_log_file_appends_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("proxy.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "previous run\n").unwrap();

        let sink = LogFile::open_rotated(&path, 3).unwrap();
        sink.make_writer().write_all(b"line one\n").unwrap();
        sink.make_writer().write_all(b"line two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
        let rotated = dir.path().join("logs").join("proxy.log.1");
        assert_eq!(std::fs::read_to_string(rotated).unwrap(), "previous run\n");
    }

    #[test]
    fn test_data_dir_is_named_for_the_crate() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name == "mcp-proxy" || name == ".mcp-proxy");
    }
}
