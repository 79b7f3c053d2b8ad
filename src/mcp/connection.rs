//! Connection Manager: owns one `Connection` per descriptor, applies
//! retry-with-backoff on connect, runs the health sweep, and guarantees
//! orderly shutdown. Every transport access from the Bridge goes through
//! here so the Breaker and retry policy are never bypassed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{error, info, warn};

use super::breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
use super::config::{ServerDescriptor, TransportKind};
use super::events::{EventSink, FabricEvent};
use super::transport::{backoff_delay, McpTransport, RpcOutcome, SseTransport, StdioTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unhealthy,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to `{name}` after retries: {reason}")]
    ConnectFailed { name: String, reason: String },
    #[error("the manager has been shut down")]
    ManagerClosed,
    #[error("server `{0}` is unavailable")]
    ServerUnavailable(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("circuit open for server `{0}`")]
    CircuitOpen(String),
}

/// Number of retries attempted after the initial connect failure, before a
/// descriptor is abandoned for the current connect-all pass. Total attempts
/// = 1 initial + `MAX_RETRIES` retries (four calls), producing three backoff
/// delays — matching spec.md §8 scenario 5's worked example ("fails
/// `Connect` three times with backoffs roughly `1, 2, 4` s" before the
/// final `ConnectFailed`).
const MAX_RETRIES: u32 = 3;

/// One Connection owns at most one Transport, present only while
/// `Connected`/`Unhealthy`; it is `None` while `Disconnected`/`Connecting`/
/// `Closed`. Also owns the Breaker that gates every `send` routed through
/// it.
pub struct Connection {
    pub descriptor: ServerDescriptor,
    transport: tokio::sync::RwLock<Option<Arc<dyn McpTransport>>>,
    breaker: CircuitBreaker,
    state: tokio::sync::RwLock<ConnectionState>,
}

impl Connection {
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }
}

fn build_transport(descriptor: &ServerDescriptor) -> Result<Arc<dyn McpTransport>, TransportError> {
    match descriptor.transport {
        TransportKind::Stdio => Ok(Arc::new(StdioTransport::new(
            descriptor.command.clone(),
            descriptor.args.clone(),
            descriptor.env.clone(),
        ))),
        TransportKind::Sse => Ok(Arc::new(SseTransport::new(
            descriptor.command.clone(),
            descriptor.env.clone(),
        )?)),
    }
}

/// Owns every Connection for the lifetime of the host process.
pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
    closed: AtomicBool,
    breaker_config: BreakerConfig,
    sink: Option<EventSink>,
}

impl ConnectionManager {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self::with_sink(breaker_config, None)
    }

    /// Same as [`ConnectionManager::new`] but forwards `sink` into every
    /// connection's Breaker and emits server lifecycle events through it.
    pub fn with_sink(breaker_config: BreakerConfig, sink: Option<EventSink>) -> Self {
        Self {
            connections: DashMap::new(),
            closed: AtomicBool::new(false),
            breaker_config,
            sink,
        }
    }

    fn emit(&self, event: FabricEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Runs the per-descriptor connect procedure for every enabled
    /// descriptor concurrently, collecting per-name outcomes. One
    /// descriptor's failure never blocks another's progress.
    pub async fn connect_all(
        &self,
        descriptors: &[ServerDescriptor],
    ) -> HashMap<String, Result<(), ConnectionError>> {
        let tasks = descriptors.iter().map(|descriptor| async move {
            let result = self.connect_one(descriptor.clone()).await;
            (descriptor.name.clone(), result)
        });

        futures::future::join_all(tasks).await.into_iter().collect()
    }

    fn new_breaker(&self, name: &str) -> CircuitBreaker {
        CircuitBreaker::with_sink(self.breaker_config, name.to_string(), self.sink.clone())
    }

    /// Connect procedure for one descriptor (spec §4.4). A `Connection`
    /// record is inserted immediately in `Disconnected` (disabled
    /// descriptor) or `Connecting` (attempt in progress) state so every
    /// state in the spec's five-state model is observable through
    /// `get_health`, not just the terminal ones.
    pub async fn connect_one(&self, descriptor: ServerDescriptor) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ManagerClosed);
        }

        if !descriptor.enabled {
            info!(server = %descriptor.name, "descriptor disabled, not connecting");
            let breaker = self.new_breaker(&descriptor.name);
            let connection = Arc::new(Connection {
                descriptor: descriptor.clone(),
                transport: tokio::sync::RwLock::new(None),
                breaker,
                state: tokio::sync::RwLock::new(ConnectionState::Disconnected),
            });
            self.connections.insert(descriptor.name.clone(), connection);
            return Ok(());
        }

        let breaker = self.new_breaker(&descriptor.name);
        let connection = Arc::new(Connection {
            descriptor: descriptor.clone(),
            transport: tokio::sync::RwLock::new(None),
            breaker,
            state: tokio::sync::RwLock::new(ConnectionState::Connecting),
        });
        self.connections.insert(descriptor.name.clone(), Arc::clone(&connection));

        let transport = build_transport(&descriptor)?;

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            match transport.connect().await {
                Ok(()) => {
                    *connection.transport.write().await = Some(Arc::clone(&transport));
                    connection.set_state(ConnectionState::Connected).await;
                    info!(server = %descriptor.name, "connected");
                    self.emit(FabricEvent::ServerConnected {
                        server_name: descriptor.name.clone(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        server = %descriptor.name,
                        attempt = attempt + 1,
                        "connect attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        connection.set_state(ConnectionState::Disconnected).await;
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(
            server = %descriptor.name,
            "connect failed after {} attempts: {}",
            MAX_RETRIES + 1,
            reason
        );
        self.emit(FabricEvent::ServerConnectFailed {
            server_name: descriptor.name.clone(),
            reason: reason.clone(),
        });
        Err(ConnectionError::ConnectFailed {
            name: descriptor.name,
            reason,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Sends a request through the named connection's Breaker. RPC errors
    /// count as breaker successes; transport faults and timeouts count as
    /// breaker failures.
    pub async fn send(
        &self,
        name: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcOutcome, ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ManagerClosed);
        }

        let connection = self
            .get(name)
            .ok_or_else(|| ConnectionError::ServerUnavailable(name.to_string()))?;

        if connection.state().await != ConnectionState::Connected {
            return Err(ConnectionError::ServerUnavailable(name.to_string()));
        }

        let transport = connection
            .transport
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectionError::ServerUnavailable(name.to_string()))?;
        let method = method.to_string();

        let result = connection
            .breaker
            .call(|| async move { transport.send(&method, params, timeout).await })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(BreakerError::Open) => Err(ConnectionError::CircuitOpen(name.to_string())),
            Err(BreakerError::Inner(e)) => Err(ConnectionError::Transport(e)),
        }
    }

    /// Invokes `Healthy()` on every `Connected` connection, transitioning
    /// failures to `Unhealthy`. Does not auto-reconnect.
    pub async fn health_sweep(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for entry in self.connections.iter() {
            let connection = Arc::clone(entry.value());
            let current = connection.state().await;
            if current != ConnectionState::Connected && current != ConnectionState::Unhealthy {
                continue;
            }
            let healthy = match connection.transport.read().await.as_ref() {
                Some(transport) => transport.healthy().await,
                None => false,
            };
            connection
                .set_state(if healthy {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Unhealthy
                })
                .await;
            results.insert(entry.key().clone(), healthy);
        }
        results
    }

    pub async fn get_health(&self, name: &str) -> Option<ConnectionState> {
        match self.get(name) {
            Some(c) => Some(c.state().await),
            None => None,
        }
    }

    pub async fn breaker_state(&self, name: &str) -> Option<BreakerState> {
        match self.get(name) {
            Some(c) => Some(c.breaker.state().await),
            None => None,
        }
    }

    /// Forces the named server's Breaker to `Closed` and zeroes its
    /// counters, per §4.3's `Reset()` contract. Operator tooling only,
    /// mirroring [`ConnectionManager::reconnect`] — neither is invoked
    /// automatically by the fabric itself.
    pub async fn reset_breaker(&self, name: &str) -> Result<(), ConnectionError> {
        let connection = self
            .get(name)
            .ok_or_else(|| ConnectionError::ServerUnavailable(name.to_string()))?;
        connection.breaker.reset().await;
        Ok(())
    }

    /// Tears down the connection for `name`, if any, and re-runs the
    /// connect procedure for its descriptor. The operator hook the spec's
    /// Open Questions defer to in lieu of automatic reconnection.
    pub async fn reconnect(&self, name: &str) -> Result<(), ConnectionError> {
        if let Some((_, connection)) = self.connections.remove(name) {
            if let Some(transport) = connection.transport.read().await.clone() {
                let _ = transport.close().await;
            }
            self.connect_one(connection.descriptor.clone()).await
        } else {
            Err(ConnectionError::ServerUnavailable(name.to_string()))
        }
    }

    /// Closes every connection concurrently; a `Close` failure is logged,
    /// never raised. Returns once every close has completed. After this,
    /// every further call returns `ManagerClosed`.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();

        let closes = connections.iter().map(|connection| async move {
            let transport = connection.transport.read().await.clone();
            let reason = match transport {
                Some(t) => match t.close().await {
                    Ok(()) => "shutdown".to_string(),
                    Err(e) => {
                        warn!(server = %connection.descriptor.name, "close failed: {}", e);
                        e.to_string()
                    }
                },
                None => "shutdown".to_string(),
            };
            connection.set_state(ConnectionState::Closed).await;
            self.emit(FabricEvent::ServerDisconnected {
                server_name: connection.descriptor.name.clone(),
                reason,
            });
        });

        futures::future::join_all(closes).await;
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, command: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            enabled: true,
            description: None,
        }
    }

    #[tokio::test]
    async fn disabled_descriptor_is_recorded_disconnected_not_connected() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        let mut d = descriptor("skip", "does-not-exist");
        d.enabled = false;
        manager.connect_one(d).await.unwrap();
        assert_eq!(manager.get_health("skip").await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn failed_connect_leaves_the_connection_disconnected_and_observable() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        let d = descriptor("bad", "definitely-not-a-real-binary-xyz");
        assert!(manager.connect_one(d).await.is_err());
        assert_eq!(manager.get_health("bad").await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn reset_breaker_forces_closed() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        let d = descriptor("bad", "definitely-not-a-real-binary-xyz");
        let _ = manager.connect_one(d).await;
        // reset_breaker only acts on the breaker state itself; it does not
        // require the connection to be Connected.
        manager.reset_breaker("bad").await.unwrap();
        assert_eq!(manager.breaker_state("bad").await, Some(BreakerState::Closed));
        assert!(matches!(
            manager.reset_breaker("missing").await,
            Err(ConnectionError::ServerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn one_bad_descriptor_does_not_block_a_sibling() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        let descriptors = vec![
            descriptor("bad", "definitely-not-a-real-binary-xyz"),
            descriptor("also-bad", "still-not-real-xyz"),
        ];
        let results = manager.connect_all(&descriptors).await;
        assert!(results["bad"].is_err());
        assert!(results["also-bad"].is_err());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_sends() {
        let manager = ConnectionManager::new(BreakerConfig::default());
        manager.shutdown().await;
        let result = manager
            .send("anything", "tools/list", serde_json::json!({}), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ConnectionError::ManagerClosed)));
    }
}
