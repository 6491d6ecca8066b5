//! Fault-tolerant provider call wrapper
//!
//! Wraps a single gateway call with circuit-breaker consultation, a
//! hard per-attempt timeout (fresh budget per retry), error
//! classification, and bounded retry with exponential backoff + jitter.
//! The executor never raises past its boundary: every call resolves to
//! a typed [`CallOutcome`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use bpd_common::backoff::BackoffPolicy;
use bpd_common::types::ErrorKind;

use super::circuit_breaker::{CallPermit, CircuitBreakerRegistry};
use super::classify::classify;
use super::gateway::ProviderGateway;

/// Retries after the initial attempt
pub const MAX_RETRIES: u32 = 2;

/// Typed outcome of one fault-tolerant call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success { payload: String, attempts: u32 },
    Failure { kind: ErrorKind, attempts: u32 },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            CallOutcome::Success { attempts, .. } | CallOutcome::Failure { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Fault-tolerant executor over the provider gateway
pub struct FaultTolerantExecutor {
    gateway: Arc<dyn ProviderGateway>,
    breakers: Arc<CircuitBreakerRegistry>,
    backoff: BackoffPolicy,
    max_retries: u32,
}

impl FaultTolerantExecutor {
    pub fn new(gateway: Arc<dyn ProviderGateway>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            gateway,
            breakers,
            backoff: BackoffPolicy::retry_default(),
            max_retries: MAX_RETRIES,
        }
    }

    /// Override retry pacing (tests use a near-zero backoff)
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Execute one provider call with full fault handling.
    ///
    /// `timeout` is the hard per-attempt budget; each retry gets a
    /// fresh one.
    pub async fn execute(&self, provider: &str, prompt: &str, timeout: Duration) -> CallOutcome {
        let mut attempts: u32 = 0;

        loop {
            let permit = self.breakers.check(provider);
            if permit == CallPermit::Rejected {
                debug!(provider, "Circuit open, failing fast without network I/O");
                return CallOutcome::Failure {
                    kind: ErrorKind::CircuitOpen,
                    attempts,
                };
            }

            attempts += 1;

            let kind = match tokio::time::timeout(
                timeout,
                self.gateway.call(provider, prompt, timeout),
            )
            .await
            {
                Ok(Ok(payload)) => {
                    self.breakers.record_success(provider);
                    return CallOutcome::Success { payload, attempts };
                }
                Ok(Err(gateway_error)) => {
                    let kind = classify(&gateway_error);
                    warn!(
                        provider,
                        attempt = attempts,
                        kind = %kind,
                        error = %gateway_error,
                        "Provider call failed"
                    );
                    kind
                }
                Err(_) => {
                    warn!(
                        provider,
                        attempt = attempts,
                        "Provider call exceeded per-attempt timeout"
                    );
                    ErrorKind::Timeout
                }
            };

            // A failed probe re-opens the circuit immediately; retrying
            // through a fresh permit would just race other callers.
            let exhausted = attempts > self.max_retries;
            if permit == CallPermit::Probe || !kind.is_retryable() || exhausted {
                self.breakers.record_failure(provider, kind);
                return CallOutcome::Failure { kind, attempts };
            }

            let delay = self.backoff.delay(attempts);
            debug!(provider, attempt = attempts, ?delay, "Retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::GatewayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gateway scripted to fail a fixed number of times, then succeed
    struct FlakyGateway {
        failures_before_success: usize,
        calls: AtomicUsize,
        error: GatewayError,
    }

    impl FlakyGateway {
        fn new(failures_before_success: usize, error: GatewayError) -> Self {
            Self {
                failures_before_success,
                calls: AtomicUsize::new(0),
                error,
            }
        }
    }

    #[async_trait]
    impl ProviderGateway for FlakyGateway {
        async fn call(
            &self,
            _provider: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok("answer".to_string())
            }
        }
    }

    fn executor(gateway: Arc<dyn ProviderGateway>) -> FaultTolerantExecutor {
        FaultTolerantExecutor::new(gateway, Arc::new(CircuitBreakerRegistry::new()))
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                0.0,
            ))
    }

    #[tokio::test]
    async fn test_retryable_failure_then_success() {
        let gateway = Arc::new(FlakyGateway::new(
            2,
            GatewayError::new(Some(503), "Service Unavailable"),
        ));
        let exec = executor(gateway.clone());

        let outcome = exec
            .execute("openai", "prompt", Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Success {
                payload: "answer".to_string(),
                attempts: 3
            }
        );
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let gateway = Arc::new(FlakyGateway::new(
            100,
            GatewayError::new(Some(500), "Internal Server Error"),
        ));
        let exec = executor(gateway.clone());

        let outcome = exec
            .execute("openai", "prompt", Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Failure {
                kind: ErrorKind::ServerError,
                attempts: 1 + MAX_RETRIES
            }
        );
        // Initial attempt + 2 retries, no more
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let gateway = Arc::new(FlakyGateway::new(
            100,
            GatewayError::new(Some(401), "Incorrect API key provided"),
        ));
        let exec = executor(gateway.clone());

        let outcome = exec
            .execute("openai", "prompt", Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Failure {
                kind: ErrorKind::InvalidCredentials,
                attempts: 1
            }
        );
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_classified() {
        struct HangingGateway;

        #[async_trait]
        impl ProviderGateway for HangingGateway {
            async fn call(
                &self,
                _provider: &str,
                _prompt: &str,
                _timeout: Duration,
            ) -> Result<String, GatewayError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::new(None, "unreachable"))
            }
        }

        let exec = executor(Arc::new(HangingGateway));
        let outcome = exec
            .execute("openai", "prompt", Duration::from_millis(100))
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Failure {
                kind: ErrorKind::Timeout,
                attempts: 1 + MAX_RETRIES
            }
        );
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_without_io() {
        let gateway = Arc::new(FlakyGateway::new(
            100,
            GatewayError::new(Some(401), "Incorrect API key provided"),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let exec = FaultTolerantExecutor::new(gateway.clone(), breakers.clone())
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(1),
                0.0,
            ));

        // Five terminal failures trip the breaker
        for _ in 0..5 {
            let outcome = exec
                .execute("openai", "prompt", Duration::from_secs(5))
                .await;
            assert!(!outcome.is_success());
        }
        let calls_before = gateway.calls.load(Ordering::SeqCst);

        let outcome = exec
            .execute("openai", "prompt", Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Failure {
                kind: ErrorKind::CircuitOpen,
                attempts: 0
            }
        );
        // No network I/O happened
        assert_eq!(gateway.calls.load(Ordering::SeqCst), calls_before);
    }
}
