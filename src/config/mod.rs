//! Configuration layer.
//!
//! - `loader` reads server files (YAML or JSON) and `--servers` specs into
//!   backend specs.
//! - `generators` emits client configuration that points each MCP client
//!   entry at a backend's socket.

pub mod generators;
pub mod loader;

pub use generators::{
    client_config_for, generate_client_config, write_client_config, ClientEntry, ClientKind,
};
pub use loader::{load_proxy_config, parse_proxy_config, parse_server_spec, ProxyConfig, ServerEntry};
