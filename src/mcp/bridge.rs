//! Invocation Bridge: the agent-facing surface. Translates the Registry's
//! tool catalog into the agent's function-calling shape and routes
//! `tools/call` through the Manager and its Breaker.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::connection::{ConnectionError, ConnectionManager};
use super::events::{EventSink, FabricEvent};
use super::registry::{RegistryError, ToolRegistry};
use super::transport::RpcOutcome;

const INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("no tool registered as `{0}`")]
    UnknownTool(String),
    #[error("server `{0}` is unavailable")]
    ServerUnavailable(String),
    #[error("tool call failed with rpc error {code}: {message}")]
    RpcError { code: i64, message: String },
}

impl From<RegistryError> for InvocationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => InvocationError::UnknownTool(name),
        }
    }
}

impl From<ConnectionError> for InvocationError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ServerUnavailable(name) => InvocationError::ServerUnavailable(name),
            ConnectionError::CircuitOpen(name) => InvocationError::ServerUnavailable(name),
            ConnectionError::ManagerClosed => {
                InvocationError::ServerUnavailable("<manager closed>".to_string())
            }
            ConnectionError::Transport(_) | ConnectionError::ConnectFailed { .. } => {
                InvocationError::ServerUnavailable("<transport failure>".to_string())
            }
        }
    }
}

/// A tool shaped for an LLM's function-calling surface. Intentionally has
/// no dependency on any specific LLM SDK's request type — the caller
/// adapts this structural record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct InvocationBridge {
    manager: std::sync::Arc<ConnectionManager>,
    registry: std::sync::Arc<ToolRegistry>,
    sink: Option<EventSink>,
}

impl InvocationBridge {
    pub fn new(manager: std::sync::Arc<ConnectionManager>, registry: std::sync::Arc<ToolRegistry>) -> Self {
        Self::with_sink(manager, registry, None)
    }

    /// Same as [`InvocationBridge::new`] but emits a [`FabricEvent`] at the
    /// start, successful completion, and failure of every `execute` call.
    pub fn with_sink(
        manager: std::sync::Arc<ConnectionManager>,
        registry: std::sync::Arc<ToolRegistry>,
        sink: Option<EventSink>,
    ) -> Self {
        Self {
            manager,
            registry,
            sink,
        }
    }

    fn emit(&self, event: FabricEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Looks up `full_name`, resolves its server's Connection, and routes
    /// the call through the Manager's Breaker.
    pub async fn execute(&self, full_name: &str, arguments: Value) -> Result<Value, InvocationError> {
        self.emit(FabricEvent::ToolCallStarted {
            full_name: full_name.to_string(),
        });
        let started = std::time::Instant::now();

        let result = self.execute_inner(full_name, arguments).await;

        match &result {
            Ok(_) => self.emit(FabricEvent::ToolCallCompleted {
                full_name: full_name.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(e) => self.emit(FabricEvent::ToolCallFailed {
                full_name: full_name.to_string(),
                reason: e.to_string(),
            }),
        }

        result
    }

    async fn execute_inner(&self, full_name: &str, arguments: Value) -> Result<Value, InvocationError> {
        let descriptor = self.registry.get(full_name)?;

        let outcome = self
            .manager
            .send(
                &descriptor.server_name,
                "tools/call",
                serde_json::json!({ "name": descriptor.short_name, "arguments": arguments }),
                INVOCATION_TIMEOUT,
            )
            .await?;

        match outcome {
            RpcOutcome::Result(v) => Ok(v),
            RpcOutcome::Error(e) => Err(InvocationError::RpcError {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// Produces the merged catalog shaped for the agent's function-calling
    /// surface. Nested schemas, arrays, enums, and defaults pass through
    /// structurally unchanged.
    pub fn available_tools(&self) -> Vec<AgentTool> {
        self.registry
            .list(None)
            .into_iter()
            .map(|d| AgentTool {
                name: d.full_name,
                description: d.description,
                parameters: d.parameter_schema,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::breaker::BreakerConfig;

    #[tokio::test]
    async fn execute_against_unknown_tool_is_rejected() {
        let manager = std::sync::Arc::new(ConnectionManager::new(BreakerConfig::default()));
        let registry = std::sync::Arc::new(ToolRegistry::new());
        let bridge = InvocationBridge::new(manager, registry);

        let result = bridge.execute("fs.read_file", serde_json::json!({})).await;
        assert!(matches!(result, Err(InvocationError::UnknownTool(_))));
    }

    #[test]
    fn available_tools_mirrors_the_registry_catalog() {
        let manager = std::sync::Arc::new(ConnectionManager::new(BreakerConfig::default()));
        let registry = std::sync::Arc::new(ToolRegistry::new());
        registry.register(
            "fs",
            crate::mcp::registry::ToolDescriptor::new(
                "fs",
                "read_file",
                "reads a file",
                serde_json::json!({"type": "object"}),
            ),
        );
        let bridge = InvocationBridge::new(manager, registry);

        let tools = bridge.available_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "fs.read_file");
    }
}
