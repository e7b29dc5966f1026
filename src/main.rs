//! `mcp-proxy` command-line entry point.
//!
//! ```bash
//! mcp-proxy --client gemini --servers "playwright:npx @playwright/mcp@latest"
//! mcp-proxy --servers "legacy:./server --stdio" --servers-framing content-length
//! mcp-proxy --client claude --config-file servers.yaml --config-path ~/.config/claude
//! mcp-proxy --config-file servers.yaml --status
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mcp_proxy::config::{
    client_config_for, load_proxy_config, parse_server_spec, write_client_config, ClientKind,
    ProxyConfig,
};
use mcp_proxy::proxy::codec::Framing;
use mcp_proxy::{LogOptions, ProxyContext};

#[derive(Debug, Parser)]
#[command(name = "mcp-proxy")]
#[command(about = "Per-backend socket proxy for MCP servers, with access control and interceptors")]
#[command(version)]
struct Cli {
    /// Client to generate configuration for (gemini or claude)
    #[arg(short, long, default_value = "gemini")]
    client: ClientKind,

    /// Server file (YAML or JSON) with `settings` and `mcpServers`
    #[arg(long, env = "MCP_PROXY_CONFIG")]
    config_file: Option<PathBuf>,

    /// Backend given as 'name:command args' (repeatable)
    #[arg(short, long = "servers", num_args = 1..)]
    servers: Vec<String>,

    /// Framing spoken by --servers backends: line, content-length or auto
    #[arg(long, default_value = "line")]
    servers_framing: Framing,

    /// Directory for the client configuration (default: the socket directory)
    #[arg(short = 'p', long)]
    config_path: Option<PathBuf>,

    /// Proxy name, used as the socket directory prefix
    #[arg(short, long)]
    name: Option<String>,

    /// Register backends without starting them
    #[arg(long)]
    no_auto_start: bool,

    /// Print the status as JSON after startup, then shut down
    #[arg(long)]
    status: bool,

    /// Debug-level logging for the proxy
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log to proxy.log in the data directory instead of stderr
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mcp_proxy::init_tracing(&LogOptions {
        verbose: cli.verbose,
        json: cli.json_logs,
        log_file: cli.log_file,
    })?;

    let mut config = match &cli.config_file {
        Some(path) => load_proxy_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(name) = &cli.name {
        config.settings.name = name.clone();
    }

    let mut specs = config.backend_specs()?;
    for spec in &cli.servers {
        specs.push(parse_server_spec(spec, cli.servers_framing)?);
    }
    if specs.is_empty() {
        anyhow::bail!("no backends configured: pass --servers or --config-file");
    }
    if cli.no_auto_start {
        for spec in &mut specs {
            spec.auto_start = false;
        }
    }

    let proxy = ProxyContext::new(config.settings.clone())?;
    for spec in specs {
        let name = spec.name.clone();
        proxy
            .register(spec)
            .with_context(|| format!("failed to register backend '{name}'"))?;
    }

    for (name, e) in proxy.start_all().await {
        tracing::error!(backend = %name, error = %e, "backend did not start");
    }

    let status = proxy.status();
    if cli.status {
        println!("{}", serde_json::to_string_pretty(&status)?);
        proxy.shutdown().await;
        return Ok(());
    }

    if status.listening().next().is_none() {
        proxy.shutdown().await;
        anyhow::bail!("no backend is listening");
    }
    let client_config = client_config_for(&proxy, cli.client);
    let dir = cli
        .config_path
        .clone()
        .unwrap_or_else(|| proxy.socket_dir().to_path_buf());
    let path = match write_client_config(cli.client, &client_config, &dir) {
        Ok(path) => path,
        Err(e) => {
            proxy.shutdown().await;
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&client_config)?);
    println!("client configuration: {}", path.display());
    println!(
        "{} of {} backends running; press Ctrl+C to stop",
        status.running_count(),
        status.backends.len()
    );

    wait_for_shutdown_signal().await;
    proxy.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}
