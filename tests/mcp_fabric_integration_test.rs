//! End-to-end integration tests driving the fabric through real stdio child
//! processes (small Python fixture scripts), exercising the full
//! Loader -> Manager -> Discovery -> Registry -> Bridge path described in
//! `spec.md` §2's data flow.
//!
//! These tests shell out to `python3`; if it is not available in the build
//! environment the test skips rather than failing, mirroring the pattern
//! used by the transport-level unit test in `src/mcp/transport.rs`.

use std::collections::HashMap;

use mcp_fabric::mcp::config::{ConfigurationDocument, ServerDescriptor, TransportKind};
use pretty_assertions::assert_eq;

/// A minimal MCP server over stdio: answers `tools/list` with one tool
/// named `short_name` and `tools/call` by echoing its arguments back
/// wrapped in `{"received": ...}`.
fn write_fixture_server(dir: &std::path::Path, file_name: &str, short_name: &str) -> std::path::PathBuf {
    let path = dir.join(file_name);
    let script = format!(
        r#"
import sys, json

TOOL = {{
    "name": "{short_name}",
    "description": "echoes its arguments",
    "inputSchema": {{"type": "object", "properties": {{"value": {{"type": "string"}}}}}},
}}

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    method = req.get("method")
    if method == "tools/list":
        result = {{"tools": [TOOL]}}
    elif method == "tools/call":
        params = req.get("params", {{}})
        result = {{"received": params.get("arguments")}}
    else:
        result = {{}}
    resp = {{"jsonrpc": "2.0", "id": req["id"], "result": result}}
    print(json.dumps(resp))
    sys.stdout.flush()
"#,
    );
    std::fs::write(&path, script).unwrap();
    path
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok()
}

fn descriptor(name: &str, script: &std::path::Path) -> ServerDescriptor {
    ServerDescriptor {
        name: name.to_string(),
        command: "python3".to_string(),
        args: vec![script.display().to_string()],
        env: HashMap::new(),
        transport: TransportKind::Stdio,
        enabled: true,
        description: None,
    }
}

#[tokio::test]
async fn discovery_and_namespaced_invocation_across_two_servers() {
    if !python3_available() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let fs_script = write_fixture_server(dir.path(), "fs_server.py", "read_file");
    let cloud_script = write_fixture_server(dir.path(), "cloud_server.py", "read_file");

    let document = ConfigurationDocument::from_descriptors(vec![
        descriptor("fs", &fs_script),
        descriptor("cloud", &cloud_script),
    ]);

    let fabric = mcp_fabric::McpFabric::start_from_document(document)
        .await
        .unwrap();

    let mut names: Vec<String> = fabric.available_tools().into_iter().map(|t| t.name).collect();
    names.sort();
    assert_eq!(names, vec!["cloud.read_file", "fs.read_file"]);

    let result = fabric
        .execute("cloud.read_file", serde_json::json!({"path": "/x"}))
        .await
        .unwrap();
    assert_eq!(result["received"]["path"], "/x");

    let result = fabric
        .execute("fs.read_file", serde_json::json!({"path": "/y"}))
        .await
        .unwrap();
    assert_eq!(result["received"]["path"], "/y");

    fabric.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_and_sibling_server_failure_do_not_affect_each_other() {
    if !python3_available() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let good_script = write_fixture_server(dir.path(), "good_server.py", "ping");

    let document = ConfigurationDocument::from_descriptors(vec![
        descriptor("good", &good_script),
        ServerDescriptor {
            name: "bad".to_string(),
            command: "definitely-not-a-real-binary-xyz".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            enabled: true,
            description: None,
        },
    ]);

    let fabric = mcp_fabric::McpFabric::start_from_document(document)
        .await
        .unwrap();

    let names: Vec<String> = fabric.available_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["good.ping".to_string()]);

    let result = fabric.execute("bad.anything", serde_json::json!({})).await;
    assert!(result.is_err());

    fabric.shutdown().await;
}

#[tokio::test]
async fn config_file_plus_env_overlay_merge_end_to_end() {
    if !python3_available() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let script = write_fixture_server(dir.path(), "fs_server.py", "read_file");

    let config_path = dir.path().join("mcp.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "mcpServers": {
                "filesystem": {
                    "command": "python3",
                    "args": ["/default-path-unused"],
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let mut env = HashMap::new();
    env.insert("MCP_SERVER_1_NAME".to_string(), "filesystem".to_string());
    env.insert("MCP_SERVER_1_COMMAND".to_string(), "python3".to_string());
    env.insert(
        "MCP_SERVER_1_ARGS".to_string(),
        serde_json::json!([script.display().to_string()]).to_string(),
    );

    let document = mcp_fabric::mcp::config::Loader::load(Some(&config_path), &env).unwrap();
    assert_eq!(document.len(), 1);
    assert_eq!(
        document.get("filesystem").unwrap().args,
        vec![script.display().to_string()]
    );

    let fabric = mcp_fabric::McpFabric::start_from_document(document)
        .await
        .unwrap();
    let names: Vec<String> = fabric.available_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["filesystem.read_file".to_string()]);

    fabric.shutdown().await;
}
