//! MCP (Model Context Protocol) client fabric.
//!
//! A supervised pool of connections to heterogeneous external tool servers:
//! a configuration subsystem assembles the fabric from a JSON document and
//! an environment overlay, the Connection Manager owns transports and
//! retry/health policy, Discovery normalizes each server's declared tools
//! into the Registry's namespaced catalog, and the Invocation Bridge routes
//! tool calls from the agent layer to the correct server.

pub mod breaker;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod registry;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use breaker::BreakerConfig;
pub use bridge::{AgentTool, InvocationBridge, InvocationError};
use config::{ConfigurationDocument, Loader};
pub use config::{LoadError, ServerDescriptor, TransportKind};
use connection::ConnectionManager;
pub use connection::{ConnectionError, ConnectionState};
use discovery::discover_all_with_sink;
pub use discovery::DiscoveryError;
pub use events::{EventSink, FabricEvent, HealthStatus};
use registry::ToolRegistry;
pub use registry::{RegistryError, ToolDescriptor};

/// Crate-level error aggregating every component's error taxonomy so `?`
/// composes across module boundaries.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

/// Top-level handle wiring Loader -> Manager -> Discovery -> Registry ->
/// Bridge. Owns the Manager and Registry for the lifetime of the host.
pub struct McpFabric {
    manager: Arc<ConnectionManager>,
    registry: Arc<ToolRegistry>,
    bridge: InvocationBridge,
    sink: Option<EventSink>,
}

impl McpFabric {
    /// Loads configuration, connects every enabled descriptor, discovers
    /// each connected server's tools, and publishes the merged catalog.
    /// Per-descriptor connect/discovery failures are logged and recorded;
    /// they never abort startup for a sibling descriptor.
    pub async fn start(path: Option<&Path>, env: &std::collections::HashMap<String, String>) -> Result<Self, FabricError> {
        let document: ConfigurationDocument = Loader::load(path, env)?;
        Self::start_from_document(document).await
    }

    pub async fn start_from_document(document: ConfigurationDocument) -> Result<Self, FabricError> {
        Self::start_from_document_with_sink(document, None).await
    }

    /// Same as [`McpFabric::start_from_document`] but every component emits
    /// its [`FabricEvent`]s through `sink` as it runs, so an embedder can
    /// forward operational events to its own telemetry or UI layer.
    pub async fn start_from_document_with_sink(
        document: ConfigurationDocument,
        sink: Option<EventSink>,
    ) -> Result<Self, FabricError> {
        let manager = Arc::new(ConnectionManager::with_sink(BreakerConfig::default(), sink.clone()));
        let registry = Arc::new(ToolRegistry::new());

        let descriptors: Vec<ServerDescriptor> = document.enabled().cloned().collect();
        let connect_results = manager.connect_all(&descriptors).await;
        for (name, result) in &connect_results {
            if let Err(e) = result {
                info!(server = %name, "connect failed: {}", e);
            }
        }

        let discovery_results = discover_all_with_sink(&manager, sink.clone()).await;
        for (server_name, result) in discovery_results {
            match result {
                Ok(tools) => {
                    let count = tools.len();
                    for tool in tools {
                        registry.register(&server_name, tool);
                    }
                    info!(server = %server_name, tool_count = count, "discovery completed");
                }
                Err(e) => info!(server = %server_name, "discovery failed: {}", e),
            }
        }

        let bridge = InvocationBridge::with_sink(Arc::clone(&manager), Arc::clone(&registry), sink.clone());

        Ok(Self {
            manager,
            registry,
            bridge,
            sink,
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn execute(&self, full_name: &str, arguments: Value) -> Result<Value, InvocationError> {
        self.bridge.execute(full_name, arguments).await
    }

    pub fn available_tools(&self) -> Vec<AgentTool> {
        self.bridge.available_tools()
    }

    /// Runs the Manager's health sweep and returns one `HealthStatus` per
    /// known connection.
    pub async fn health_status(&self) -> Vec<HealthStatus> {
        let sweep = self.manager.health_sweep().await;
        let mut out = Vec::with_capacity(sweep.len());
        for (server_name, connected) in sweep {
            let breaker_state = self
                .manager
                .breaker_state(&server_name)
                .await
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push(HealthStatus {
                server_name,
                connected,
                breaker_state,
                checked_at: chrono::Utc::now(),
            });
        }
        out
    }

    /// Operator hook: tears down and reconnects one named server, then
    /// re-runs discovery for it so the Registry stays in sync.
    pub async fn reconnect(&self, server_name: &str) -> Result<(), FabricError> {
        self.manager.reconnect(server_name).await?;
        self.registry.remove_server(server_name);
        if let Some(sink) = &self.sink {
            sink(FabricEvent::DiscoveryStarted {
                server_name: server_name.to_string(),
            });
        }
        match discovery::discover(&self.manager, server_name).await {
            Ok(tools) => {
                let count = tools.len();
                for tool in tools {
                    self.registry.register(server_name, tool);
                }
                if let Some(sink) = &self.sink {
                    sink(FabricEvent::DiscoveryCompleted {
                        server_name: server_name.to_string(),
                        tool_count: count,
                    });
                }
                Ok(())
            }
            Err(e) => {
                if let Some(sink) = &self.sink {
                    sink(FabricEvent::DiscoveryFailed {
                        server_name: server_name.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(FabricError::Discovery(e))
            }
        }
    }

    /// Operator hook: forces the named server's Breaker back to `Closed`,
    /// per §4.3's `Reset()` contract. Intended for operator tooling, not
    /// for any automatic recovery path within the fabric itself.
    pub async fn reset_breaker(&self, server_name: &str) -> Result<(), FabricError> {
        self.manager.reset_breaker(server_name).await?;
        Ok(())
    }

    /// Closes every connection. After this, every further call against the
    /// Manager returns `ManagerClosed`.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_document_starts_clean() {
        let document = ConfigurationDocument::default();
        let fabric = McpFabric::start_from_document(document).await.unwrap();
        assert!(fabric.available_tools().is_empty());
        fabric.shutdown().await;
    }

    #[tokio::test]
    async fn failed_invocation_emits_started_and_failed_events() {
        let events: Arc<std::sync::Mutex<Vec<FabricEvent>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |event| sink_events.lock().unwrap().push(event));

        let document = ConfigurationDocument::default();
        let fabric = McpFabric::start_from_document_with_sink(document, Some(sink))
            .await
            .unwrap();

        let result = fabric.execute("fs.read_file", serde_json::json!({})).await;
        assert!(result.is_err());

        let recorded = events.lock().unwrap();
        assert!(recorded
            .iter()
            .any(|e| matches!(e, FabricEvent::ToolCallStarted { .. })));
        assert!(recorded
            .iter()
            .any(|e| matches!(e, FabricEvent::ToolCallFailed { .. })));

        fabric.shutdown().await;
    }
}
