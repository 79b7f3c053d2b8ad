//! Discovery: asks a connected server for its tools and normalizes the
//! response into `ToolDescriptor`s the Registry can hold.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::connection::{ConnectionError, ConnectionManager, ConnectionState};
use super::events::{EventSink, FabricEvent};
use super::registry::ToolDescriptor;
use super::transport::RpcOutcome;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("server unavailable: {0}")]
    ServerUnavailable(#[from] ConnectionError),
    #[error("server reported an rpc error {code}: {message}")]
    RpcError { code: i64, message: String },
    #[error("malformed tools/list response: {0}")]
    MalformedResponse(String),
}

/// Issues `tools/list` against `server_name` through `manager` and returns
/// the normalized descriptors. A malformed response aborts discovery for
/// this server only.
pub async fn discover(
    manager: &ConnectionManager,
    server_name: &str,
) -> Result<Vec<ToolDescriptor>, DiscoveryError> {
    let outcome = manager
        .send(server_name, "tools/list", serde_json::json!({}), DISCOVERY_TIMEOUT)
        .await?;

    let result = match outcome {
        RpcOutcome::Result(v) => v,
        RpcOutcome::Error(e) => {
            return Err(DiscoveryError::RpcError {
                code: e.code,
                message: e.message,
            })
        }
    };

    let tools = result
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or_else(|| DiscoveryError::MalformedResponse("`result.tools` is not an array".to_string()))?;

    let mut descriptors = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DiscoveryError::MalformedResponse("tool entry missing `name`".to_string()))?;
        let description = tool
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let schema = tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));

        descriptors.push(ToolDescriptor::new(server_name, name, description, schema));
    }

    Ok(descriptors)
}

/// Runs [`discover`] on every `Connected` server concurrently.
pub async fn discover_all(
    manager: &ConnectionManager,
) -> HashMap<String, Result<Vec<ToolDescriptor>, DiscoveryError>> {
    discover_all_with_sink(manager, None).await
}

/// Same as [`discover_all`] but emits a [`FabricEvent`] at the start,
/// completion, and failure of each server's discovery.
pub async fn discover_all_with_sink(
    manager: &ConnectionManager,
    sink: Option<EventSink>,
) -> HashMap<String, Result<Vec<ToolDescriptor>, DiscoveryError>> {
    let mut names = Vec::new();
    for name in manager.names() {
        if manager.get_health(&name).await == Some(ConnectionState::Connected) {
            names.push(name);
        }
    }

    let tasks = names.into_iter().map(|name| {
        let sink = sink.clone();
        async move {
            info!(server = %name, "discovering tools");
            if let Some(sink) = &sink {
                sink(FabricEvent::DiscoveryStarted {
                    server_name: name.clone(),
                });
            }
            let result = discover(manager, &name).await;
            match &result {
                Ok(tools) => {
                    if let Some(sink) = &sink {
                        sink(FabricEvent::DiscoveryCompleted {
                            server_name: name.clone(),
                            tool_count: tools.len(),
                        });
                    }
                }
                Err(e) => {
                    warn!(server = %name, "discovery failed: {}", e);
                    if let Some(sink) = &sink {
                        sink(FabricEvent::DiscoveryFailed {
                            server_name: name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            (name, result)
        }
    });

    futures::future::join_all(tasks).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::breaker::BreakerConfig;

    #[tokio::test]
    async fn discovery_against_an_unknown_server_is_unavailable() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        let result = discover(&manager, "missing").await;
        assert!(matches!(result, Err(DiscoveryError::ServerUnavailable(_))));
    }
}
