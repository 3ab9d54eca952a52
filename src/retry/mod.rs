//! Retry policy and error recovery
//!
//! Classifies failures via the error taxonomy and re-attempts transient
//! ones with exponential backoff (base doubled per attempt, ±20% jitter).
//! Every attempt's outcome and latency feed the health monitor under the
//! caller's operation label. Exhausted transient errors come back as
//! `Terminal` for the executor to route to the DLQ.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AcsError, AcsResult};
use crate::health::HealthMonitor;

/// Backoff and deadline knobs for one operation class
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a transient error becomes terminal
    pub max_attempts: u32,
    /// First backoff delay; doubled per subsequent attempt
    pub base_delay: Duration,
    /// Per-call deadline; overruns count as transient failures
    pub op_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            op_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given 1-based retry, jittered ±20%
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base = self.base_delay.as_millis() as u64 * (1u64 << exponent);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    /// Run an operation under this policy
    ///
    /// `deadline`, when set, bounds the whole retry loop; once it passes no
    /// further attempt or backoff sleep is started (the shutdown drain uses
    /// this to keep the executor inside its drain window).
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        health: &HealthMonitor,
        deadline: Option<Instant>,
        mut op: F,
    ) -> AcsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AcsResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(AcsError::Transient(format!(
                    "{label} exceeded {}s deadline",
                    self.op_timeout.as_secs()
                ))),
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(value) => {
                    health.record(label, true, elapsed);
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    health.record(label, false, elapsed);
                    return Err(err);
                }
                Err(err) => {
                    health.record(label, false, elapsed);
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            label,
                            attempts = attempt,
                            %err,
                            "transient failure exhausted retries"
                        );
                        return Err(AcsError::Terminal {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            tracing::warn!(label, attempts = attempt, "drain deadline reached mid-retry");
                            return Err(AcsError::Terminal {
                                attempts: attempt,
                                message: format!("{err} (deadline reached before retry)"),
                            });
                        }
                    }
                    tracing::warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Convenience wrapper binding a policy to a monitor
#[derive(Clone)]
pub struct RetryRunner {
    policy: RetryPolicy,
    health: Arc<HealthMonitor>,
}

impl RetryRunner {
    /// Bind a policy to a health monitor
    pub fn new(policy: RetryPolicy, health: Arc<HealthMonitor>) -> Self {
        Self { policy, health }
    }

    /// The bound policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run an operation under the bound policy
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        deadline: Option<Instant>,
        op: F,
    ) -> AcsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AcsResult<T>>,
    {
        self.policy.run(label, &self.health, deadline, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            op_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_with_jitter_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            ..Default::default()
        };
        let first = policy.backoff_delay(1).as_millis() as f64;
        let second = policy.backoff_delay(2).as_millis() as f64;
        assert!((1600.0..=2400.0).contains(&first), "first = {first}");
        assert!((3200.0..=4800.0).contains(&second), "second = {second}");
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let health = Arc::new(HealthMonitor::new("t"));
        let calls = AtomicU32::new(0);

        let result = quick_policy()
            .run("database", &health, None, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AcsError::Transient("blip".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_terminal() {
        let health = Arc::new(HealthMonitor::new("t"));
        let calls = AtomicU32::new(0);

        let result: AcsResult<()> = quick_policy()
            .run("database", &health, None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcsError::Transient("down".into())) }
            })
            .await;
        assert!(matches!(result, Err(AcsError::Terminal { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let health = Arc::new(HealthMonitor::new("t"));
        let calls = AtomicU32::new(0);

        let result: AcsResult<()> = quick_policy()
            .run("database", &health, None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcsError::NotFound("row".into())) }
            })
            .await;
        assert!(matches!(result, Err(AcsError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
