//! Diagnostic binary for exercising the MCP fabric against real servers.
//!
//! Loads an optional `.env` file, then a config file (defaulting to
//! `./mcp.json`), connects every enabled descriptor, runs discovery, prints
//! the merged tool catalog, and optionally invokes one tool by its
//! namespaced name. No host framework required — this is a hand-rolled
//! arg-parsing loop, not a `clap` app, matching how the rest of this crate's
//! binaries stay dependency-light.
//!
//! Usage:
//!   mcp_probe [--config=PATH] [--call=server.tool] [--args='{"k":"v"}']

use std::collections::HashMap;
use std::path::PathBuf;

use mcp_fabric::mcp::config::Loader;
use mcp_fabric::McpFabric;

struct Args {
    config: PathBuf,
    call: Option<String>,
    call_args: serde_json::Value,
}

fn parse_args() -> Args {
    let mut config = PathBuf::from("mcp.json");
    let mut call = None;
    let mut call_args = serde_json::json!({});

    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--config=") {
            config = PathBuf::from(value);
        } else if let Some(value) = arg.strip_prefix("--call=") {
            call = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--args=") {
            call_args = serde_json::from_str(value).unwrap_or_else(|e| {
                eprintln!("warning: --args is not valid JSON ({e}), ignoring");
                serde_json::json!({})
            });
        } else {
            eprintln!("warning: unrecognized argument `{arg}`");
        }
    }

    Args {
        config,
        call,
        call_args,
    }
}

#[tokio::main]
async fn main() {
    mcp_fabric::init_tracing();

    // The library itself never touches `.env` files; only this binary does,
    // before handing a plain process-env snapshot to the loader.
    let _ = dotenvy::dotenv();

    let args = parse_args();

    let env: HashMap<String, String> = std::env::vars().collect();
    let config_path = args.config.exists().then_some(args.config.as_path());
    let document = match Loader::load(config_path, &env) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    println!("loaded {} server descriptor(s)", document.len());

    let fabric = match McpFabric::start_from_document(document).await {
        Ok(fabric) => fabric,
        Err(e) => {
            eprintln!("failed to start fabric: {e}");
            std::process::exit(1);
        }
    };

    let tools = fabric.available_tools();
    println!("discovered {} tool(s):", tools.len());
    for tool in &tools {
        println!("  {} — {}", tool.name, tool.description);
    }

    let health = fabric.health_status().await;
    for status in &health {
        println!(
            "  [{}] connected={} breaker={}",
            status.server_name, status.connected, status.breaker_state
        );
    }

    if let Some(full_name) = args.call {
        println!("\ncalling `{full_name}` with {}", args.call_args);
        match fabric.execute(&full_name, args.call_args).await {
            Ok(result) => println!("result: {result}"),
            Err(e) => eprintln!("invocation failed: {e}"),
        }
    }

    fabric.shutdown().await;
}
