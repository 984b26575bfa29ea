//! Connection establishment with retry
//!
//! The only place that retries: the initial connect. Each attempt is bounded
//! by a timeout and verified with a health check; attempts are separated by
//! a fixed delay. Everything after the connect fails fast.
//!
//! Closing the pool at the end of a command is bounded the same way and
//! stops waiting once the command is cancelled.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{connect_options, DatabasePool, DatabasePoolConfig, PostgresPool};
use crate::cancel::cancellable;
use crate::error::{MigrateError, MigrateResult};
use tidemark_core::{ConnectionConfig, DatabaseConfig};

/// Longest wait for the pool to close its connections
const POOL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How hard to try before giving up on the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.retry_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Single attempt, no delay
    pub fn once(connect_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            connect_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// Drive `attempt` until it succeeds, the policy is exhausted, or `cancel`
/// fires. `attempt` receives the 1-based attempt number.
pub async fn retry_connect<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> MigrateResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = MigrateResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for number in 1..=max_attempts {
        let pending = attempt(number);
        let timeout = policy.connect_timeout;
        let outcome = cancellable(cancel, async move {
            match tokio::time::timeout(timeout, pending).await {
                Ok(result) => result,
                Err(_) => Err(MigrateError::Connection(format!(
                    "attempt timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        })
        .await;

        match outcome {
            Ok(value) => {
                if number > 1 {
                    info!(target: "tidemark::migrate", attempt = number, "Connected after retry");
                }
                return Ok(value);
            }
            Err(MigrateError::Cancelled) => return Err(MigrateError::Cancelled),
            Err(err) => {
                warn!(
                    target: "tidemark::migrate",
                    attempt = number,
                    max_attempts,
                    error = %err,
                    "Database connection attempt failed"
                );
                last_error = Some(err);
            }
        }

        if number < max_attempts {
            cancellable(cancel, async {
                tokio::time::sleep(policy.delay).await;
                Ok(())
            })
            .await?;
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(MigrateError::Connection(format!(
        "giving up after {} attempt(s): {}",
        max_attempts, reason
    )))
}

/// Open a PostgreSQL pool for `config`, retrying per `policy`
pub async fn connect_with_retry(
    config: &DatabaseConfig,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> MigrateResult<PostgresPool> {
    let options = connect_options(config)?;
    let pool_config = DatabasePoolConfig::default();
    let target_db = config.display_target();
    info!(target: "tidemark::migrate", target_db = %target_db, "Connecting to database");

    retry_connect(policy, cancel, |attempt| {
        let options = options.clone();
        let pool_config = pool_config.clone();
        async move {
            debug!(target: "tidemark::migrate", attempt, "Opening connection pool");
            let pool = PostgresPool::connect(options, &pool_config).await?;
            let latency = pool.health_check().await?;
            let latency_ms = latency.as_millis() as u64;
            debug!(target: "tidemark::migrate", latency_ms, "Database health check passed");
            Ok(pool)
        }
    })
    .await
}

/// Close `pool`, giving up when `cancel` fires or the close stalls
pub async fn close_pool(pool: &dyn DatabasePool, cancel: &CancellationToken) {
    let closed = cancellable(cancel, async {
        tokio::time::timeout(POOL_CLOSE_TIMEOUT, pool.close())
            .await
            .map_err(|_| MigrateError::Connection("timed out closing the pool".to_string()))
    })
    .await;

    if let Err(err) = closed {
        warn!(target: "tidemark::migrate", error = %err, "Stopped waiting for the pool to close");
    }
}
