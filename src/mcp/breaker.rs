//! Per-server circuit breaker: bounds cascading failure when one MCP server
//! misbehaves without touching the others.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use super::events::{EventSink, FabricEvent};

/// The breaker's current admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// The error a caller of [`CircuitBreaker::call`] sees: either the breaker
/// rejected the call outright, or the wrapped call itself failed.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: Instant,
}

/// A three-state circuit breaker, one per connected server.
///
/// `Closed` lets every call through; `Open` short-circuits without touching
/// the wrapped function; `HalfOpen` admits calls one at a time as a probe.
pub struct CircuitBreaker {
    config: BreakerConfig,
    server_name: String,
    sink: Option<EventSink>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, server_name: impl Into<String>) -> Self {
        Self::with_sink(config, server_name, None)
    }

    /// Same as [`CircuitBreaker::new`] but emits a [`FabricEvent`] on every
    /// state transition through `sink`, if supplied.
    pub fn with_sink(
        config: BreakerConfig,
        server_name: impl Into<String>,
        sink: Option<EventSink>,
    ) -> Self {
        Self {
            config,
            server_name: server_name.into(),
            sink,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    fn emit(&self, event: FabricEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Forces `Closed` and zeroes both counters. Intended for operator
    /// tooling only.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_transition = Instant::now();
    }

    /// Runs `f`, gated by the breaker's current state. A half-open probe
    /// holds the internal lock across the call so concurrent callers queue
    /// behind it rather than racing in as simultaneous probes.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut inner = self.inner.lock().await;

        match inner.state {
            BreakerState::Closed => {
                drop(inner);
                let result = f().await;
                self.record(result).await
            }
            BreakerState::Open => {
                if inner.last_transition.elapsed() >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition = Instant::now();
                    inner.consecutive_successes = 0;
                    self.emit(FabricEvent::BreakerHalfOpened {
                        server_name: self.server_name.clone(),
                    });
                    let result = f().await;
                    self.record_locked(&mut inner, result)
                } else {
                    Err(BreakerError::Open)
                }
            }
            BreakerState::HalfOpen => {
                let result = f().await;
                self.record_locked(&mut inner, result)
            }
        }
    }

    async fn record<T, E>(&self, result: Result<T, E>) -> Result<T, BreakerError<E>> {
        let mut inner = self.inner.lock().await;
        self.record_locked(&mut inner, result)
    }

    fn record_locked<T, E>(
        &self,
        inner: &mut Inner,
        result: Result<T, E>,
    ) -> Result<T, BreakerError<E>> {
        match result {
            Ok(value) => {
                inner.consecutive_failures = 0;
                match inner.state {
                    BreakerState::HalfOpen => {
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.config.success_threshold {
                            inner.state = BreakerState::Closed;
                            inner.consecutive_successes = 0;
                            inner.last_transition = Instant::now();
                            self.emit(FabricEvent::BreakerClosed {
                                server_name: self.server_name.clone(),
                            });
                        }
                    }
                    BreakerState::Closed | BreakerState::Open => {}
                }
                Ok(value)
            }
            Err(err) => {
                match inner.state {
                    BreakerState::HalfOpen => {
                        inner.state = BreakerState::Open;
                        inner.consecutive_successes = 0;
                        inner.last_transition = Instant::now();
                        warn!("circuit reopened after half-open probe failure");
                        self.emit(FabricEvent::BreakerOpened {
                            server_name: self.server_name.clone(),
                        });
                    }
                    BreakerState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold {
                            inner.state = BreakerState::Open;
                            inner.last_transition = Instant::now();
                            warn!(
                                "circuit opened after {} consecutive failures",
                                inner.consecutive_failures
                            );
                            self.emit(FabricEvent::BreakerOpened {
                                server_name: self.server_name.clone(),
                            });
                        }
                    }
                    BreakerState::Open => {}
                }
                Err(BreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() -> Result<(), &'static str> {
        Ok(())
    }

    async fn fail() -> Result<(), &'static str> {
        Err("boom")
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(50),
                success_threshold: 2,
            },
            "s",
        );

        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        let result = breaker.call(ok).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                success_threshold: 2,
            },
            "s",
        );

        let _ = breaker.call(fail).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = breaker.call(fail).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn recovers_after_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                success_threshold: 2,
            },
            "s",
        );

        let _ = breaker.call(fail).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker.call(ok).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        let _ = breaker.call(ok).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 2,
            },
            "s",
        );
        let _ = breaker.call(fail).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        breaker.reset().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }
}
