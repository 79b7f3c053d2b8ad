//! MCP client fabric.
//!
//! A supervised pool of connections to heterogeneous external tool
//! servers: configuration loading, transport clients, connection
//! management with retry and health checks, per-server circuit breaking,
//! tool discovery, and the invocation bridge that routes calls from an
//! agent layer to the correct server.
//!
//! This crate has no UI, no webhook, and no LLM client of its own — those
//! are external collaborators with documented interfaces (see
//! `SPEC_FULL.md`). The `mcp_probe` binary under `src/bin/` exercises the
//! fabric against a real server by hand.

pub mod mcp;

pub use mcp::{FabricError, McpFabric};

/// Initializes the `tracing` subscriber the same way the diagnostic binary
/// and the test suite do: an env-filter defaulting to `info` when
/// `RUST_LOG` is unset. Safe to call more than once — later calls are
/// ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
