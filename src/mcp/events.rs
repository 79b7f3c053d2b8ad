//! Fabric event types for transparency and monitoring.
//!
//! These events are emitted at connect, discovery, and tool-call boundaries
//! through an injectable sink, mirroring how the teacher reports
//! operational events to its host application.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted by the fabric during operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum FabricEvent {
    ServerConnected { server_name: String },
    ServerDisconnected { server_name: String, reason: String },
    ServerConnectFailed { server_name: String, reason: String },

    DiscoveryStarted { server_name: String },
    DiscoveryCompleted { server_name: String, tool_count: usize },
    DiscoveryFailed { server_name: String, reason: String },

    ToolCallStarted { full_name: String },
    ToolCallCompleted { full_name: String, duration_ms: u64 },
    ToolCallFailed { full_name: String, reason: String },

    BreakerOpened { server_name: String },
    BreakerHalfOpened { server_name: String },
    BreakerClosed { server_name: String },
}

impl FabricEvent {
    /// Coarse grouping, used for log filtering and dashboards.
    pub fn category(&self) -> &'static str {
        match self {
            FabricEvent::ServerConnected { .. }
            | FabricEvent::ServerDisconnected { .. }
            | FabricEvent::ServerConnectFailed { .. } => "server",
            FabricEvent::DiscoveryStarted { .. }
            | FabricEvent::DiscoveryCompleted { .. }
            | FabricEvent::DiscoveryFailed { .. } => "discovery",
            FabricEvent::ToolCallStarted { .. }
            | FabricEvent::ToolCallCompleted { .. }
            | FabricEvent::ToolCallFailed { .. } => "tool_call",
            FabricEvent::BreakerOpened { .. }
            | FabricEvent::BreakerHalfOpened { .. }
            | FabricEvent::BreakerClosed { .. } => "breaker",
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            FabricEvent::ServerConnected { .. } => "server_connected",
            FabricEvent::ServerDisconnected { .. } => "server_disconnected",
            FabricEvent::ServerConnectFailed { .. } => "server_connect_failed",
            FabricEvent::DiscoveryStarted { .. } => "discovery_started",
            FabricEvent::DiscoveryCompleted { .. } => "discovery_completed",
            FabricEvent::DiscoveryFailed { .. } => "discovery_failed",
            FabricEvent::ToolCallStarted { .. } => "tool_call_started",
            FabricEvent::ToolCallCompleted { .. } => "tool_call_completed",
            FabricEvent::ToolCallFailed { .. } => "tool_call_failed",
            FabricEvent::BreakerOpened { .. } => "breaker_opened",
            FabricEvent::BreakerHalfOpened { .. } => "breaker_half_opened",
            FabricEvent::BreakerClosed { .. } => "breaker_closed",
        }
    }

    /// A JSON payload suitable for handing to an external telemetry sink,
    /// with a wall-clock timestamp attached.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "category": self.category(),
            "event_type": self.event_type(),
            "timestamp": Utc::now().to_rfc3339(),
            "data": serde_json::to_value(self).unwrap_or(Value::Null),
        })
    }
}

/// An injectable sink an embedder can wire up to forward events to its own
/// telemetry or UI layer. The fabric never assumes a specific sink.
pub type EventSink = Arc<dyn Fn(FabricEvent) + Send + Sync>;

/// A snapshot of one connection's health, as returned by the Manager's
/// health sweep and exposed to the agent layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub server_name: String,
    pub connected: bool,
    pub breaker_state: String,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_and_event_type_agree_with_the_variant() {
        let event = FabricEvent::BreakerOpened {
            server_name: "fs".to_string(),
        };
        assert_eq!(event.category(), "breaker");
        assert_eq!(event.event_type(), "breaker_opened");
    }

    #[test]
    fn to_payload_embeds_a_timestamp() {
        let event = FabricEvent::ServerConnected {
            server_name: "fs".to_string(),
        };
        let payload = event.to_payload();
        assert!(payload["timestamp"].is_string());
        assert_eq!(payload["event_type"], "server_connected");
    }
}
