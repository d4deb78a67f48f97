//! Bounded retry with exponential backoff

use baton_core::config::RecoveryConfig;
use baton_core::{BatonError, Result, TaskId, WorkerId};
use baton_events::{EventChannel, EventPayload, OperationOutcome, PerformanceMetric, ToolExecution};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMPONENT: &str = "recovery";

/// What is being executed, for logs and events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    /// Tool or operation name
    pub operation: String,
    pub task_id: TaskId,
    pub agent_id: WorkerId,
}

impl OperationContext {
    pub fn new(
        operation: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Validation errors describe bad input; retrying cannot help
fn is_permanent(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<BatonError>()
        .map_or(false, BatonError::is_validation)
}

/// Retries and primary/fallback execution for worker operations
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    events: EventChannel,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig, events: EventChannel) -> Self {
        Self { config, events }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn report(&self, ctx: &OperationContext, elapsed: Duration, error: Option<String>) {
        let execution_time = elapsed.as_millis() as u64;
        self.events.publish(
            COMPONENT,
            EventPayload::tool_execution(ToolExecution {
                tool_name: ctx.operation.clone(),
                task_id: ctx.task_id.clone(),
                agent_id: ctx.agent_id.clone(),
                success: error.is_none(),
                execution_time,
                error,
            }),
        );
        self.events.publish(
            COMPONENT,
            EventPayload::PerformanceMetric(PerformanceMetric {
                metric: format!("{}.duration", ctx.operation),
                value: execution_time as f64,
                unit: "ms".to_string(),
                task_id: Some(ctx.task_id.clone()),
                agent_id: Some(ctx.agent_id.clone()),
            }),
        );
    }

    /// Run `op` with the configured retry count and base delay
    pub async fn execute<F, Fut, T>(&self, ctx: &OperationContext, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with_retry(ctx, self.config.max_retries, self.config.base_delay(), op)
            .await
    }

    /// Run `op`, retrying up to `max_retries` extra times
    ///
    /// Waits `base_delay * 2^attempt` (capped at the configured maximum)
    /// between attempts. Validation errors are returned immediately. Emits one
    /// `tool.execution.*` event for the final outcome.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &OperationContext,
        max_retries: u32,
        base_delay: Duration,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let max_delay = self.config.max_delay();
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation = %ctx.operation, attempts = attempt + 1, "Succeeded after retry");
                    }
                    self.report(ctx, started.elapsed(), None);
                    return Ok(value);
                }
                Err(e) if is_permanent(&e) => {
                    warn!(operation = %ctx.operation, error = %e, "Permanent failure, not retrying");
                    self.report(ctx, started.elapsed(), Some(e.to_string()));
                    return Err(e
                        .downcast::<BatonError>()
                        .unwrap_or_else(|e| BatonError::Execution(e.to_string())));
                }
                Err(e) if attempt >= max_retries => {
                    let attempts = attempt + 1;
                    warn!(
                        operation = %ctx.operation,
                        attempts,
                        error = %e,
                        "Retries exhausted"
                    );
                    self.report(ctx, started.elapsed(), Some(format!("{:#}", e)));
                    return Err(BatonError::RetryExhausted {
                        operation: ctx.operation.clone(),
                        attempts,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = backoff_delay(base_delay, attempt, max_delay);
                    warn!(
                        operation = %ctx.operation,
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run `primary`; if it fails, run `fallback` instead
    ///
    /// Fails with `FallbackExhausted` carrying both causes when the fallback
    /// fails too.
    pub async fn execute_handoff_with_fallback<P, PFut, F, FFut, T>(
        &self,
        ctx: &OperationContext,
        primary: P,
        fallback: F,
    ) -> Result<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = anyhow::Result<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = anyhow::Result<T>>,
    {
        let outcome = |error: Option<String>| {
            let mut outcome = OperationOutcome::new(ctx.operation.clone())
                .with_task(ctx.task_id.clone())
                .with_agent(ctx.agent_id.clone());
            if let Some(error) = error {
                outcome = outcome.with_error(error);
            }
            EventPayload::agent_communication(outcome)
        };

        let primary_error = match primary().await {
            Ok(value) => {
                self.events.publish(COMPONENT, outcome(None));
                return Ok(value);
            }
            Err(e) => e,
        };

        warn!(operation = %ctx.operation, error = %primary_error, "Primary failed, using fallback");
        match fallback().await {
            Ok(value) => {
                debug!(operation = %ctx.operation, "Fallback succeeded");
                self.events.publish(COMPONENT, outcome(None));
                Ok(value)
            }
            Err(fallback_error) => {
                self.events
                    .publish(COMPONENT, outcome(Some(format!("{:#}", fallback_error))));
                Err(BatonError::FallbackExhausted {
                    category: ctx.operation.clone(),
                    primary: primary_error,
                    fallback: fallback_error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> ErrorRecoveryManager {
        ErrorRecoveryManager::new(RecoveryConfig::default(), EventChannel::default())
    }

    fn ctx() -> OperationContext {
        OperationContext::new("compile", "t-1", "w-1")
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 10, max), max);
        assert_eq!(backoff_delay(base, 40, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let value = manager()
            .execute_with_retry(&ctx(), 3, Duration::from_secs(1), || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        anyhow::bail!("transient failure {}", n);
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_carries_cause() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = manager()
            .execute_with_retry(&ctx(), 2, Duration::from_millis(100), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("disk full"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), Some(3));
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = manager()
            .execute_with_retry(&ctx(), 3, Duration::from_millis(100), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), anyhow::Error>(BatonError::UnknownWorker("w-9".into()).into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, BatonError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn test_fallback_after_single_primary_call() {
        let primary_calls = AtomicU32::new(0);

        let value = manager()
            .execute_handoff_with_fallback(
                &ctx(),
                || async {
                    primary_calls.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>(anyhow::anyhow!("target worker offline"))
                },
                || async { Ok("queued for later") },
            )
            .await
            .unwrap();

        assert_eq!(value, "queued for later");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_fail() {
        let err = manager()
            .execute_handoff_with_fallback(
                &ctx(),
                || async { Err::<(), _>(anyhow::anyhow!("primary down")) },
                || async { Err::<(), _>(anyhow::anyhow!("fallback down")) },
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("primary down"));
        assert!(message.contains("fallback down"));
    }
}
