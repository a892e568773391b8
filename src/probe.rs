//! Readiness and queue probes against the backend

use crate::pool::ConnectionPool;
use crate::target::Target;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound for a single probe request
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A single "is the backend answering?" check
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, timeout: Duration) -> bool;
}

/// Health GET through the probe client of the connection pool
pub struct HttpProbe {
    pool: Arc<ConnectionPool>,
    authority: String,
    path: String,
}

impl HttpProbe {
    pub fn new(pool: Arc<ConnectionPool>, authority: String, path: String) -> Self {
        Self { pool, authority, path }
    }
}

#[async_trait]
impl ReadinessCheck for HttpProbe {
    async fn check(&self, timeout: Duration) -> bool {
        self.pool.check_backend(&self.authority, &self.path, timeout).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("not ready after {0:?}")]
    Timeout(Duration),
    #[error("target exited while waiting for readiness")]
    TargetExited,
}

/// Polls a [`ReadinessCheck`] at a fixed interval
pub struct Prober {
    check: Arc<dyn ReadinessCheck>,
    interval: Duration,
}

impl Prober {
    pub fn new(check: Arc<dyn ReadinessCheck>, interval: Duration) -> Self {
        Self { check, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn probe_once(&self) -> bool {
        self.check.check(PROBE_REQUEST_TIMEOUT).await
    }

    /// Poll until the check passes, the target dies, or `timeout` elapses.
    ///
    /// Returns how long readiness took. Never sleeps or probes past the deadline.
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        target: &dyn Target,
    ) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(attempts, "Readiness deadline reached");
                return Err(ProbeError::Timeout(timeout));
            }

            if !target.is_alive().await {
                return Err(ProbeError::TargetExited);
            }

            attempts += 1;
            let budget = PROBE_REQUEST_TIMEOUT.min(deadline - now);
            if self.check.check(budget).await {
                debug!(attempts, "Backend passed readiness probe");
                return Ok(started.elapsed());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProbeError::Timeout(timeout));
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

/// Jobs the backend reports in its queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub running: usize,
    pub pending: usize,
}

impl QueueStatus {
    /// Parse `{"queue_running": [...], "queue_pending": [...]}`. Counts are accepted
    /// in place of lists.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        fn count(v: Option<&serde_json::Value>) -> Option<usize> {
            match v? {
                serde_json::Value::Array(items) => Some(items.len()),
                serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
                _ => None,
            }
        }

        let running = count(value.get("queue_running"));
        let pending = count(value.get("queue_pending"));
        if running.is_none() && pending.is_none() {
            return None;
        }
        Some(Self {
            running: running.unwrap_or(0),
            pending: pending.unwrap_or(0),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.running > 0 || self.pending > 0
    }
}

/// Reports work queued inside the backend
#[async_trait]
pub trait QueueCheck: Send + Sync {
    /// `None` when the queue could not be read
    async fn queue(&self) -> Option<QueueStatus>;
}

pub struct HttpQueueProbe {
    pool: Arc<ConnectionPool>,
    authority: String,
    path: String,
}

impl HttpQueueProbe {
    pub fn new(pool: Arc<ConnectionPool>, authority: String, path: String) -> Self {
        Self { pool, authority, path }
    }
}

#[async_trait]
impl QueueCheck for HttpQueueProbe {
    async fn queue(&self) -> Option<QueueStatus> {
        let value = self
            .pool
            .get_json(&self.authority, &self.path, PROBE_REQUEST_TIMEOUT)
            .await?;
        QueueStatus::from_json(&value)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeCheck;
    use super::*;
    use crate::target::fake::FakeTarget;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_delay() {
        let check = FakeCheck::ready_after(Duration::from_secs(3));
        let prober = Prober::new(check.clone(), Duration::from_secs(1));
        let target = FakeTarget::running();

        let took = prober
            .wait_until_ready(Duration::from_secs(10), target.as_ref())
            .await
            .unwrap();
        assert_eq!(took, Duration::from_secs(3));
        assert_eq!(check.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let check = FakeCheck::never();
        let prober = Prober::new(check.clone(), Duration::from_secs(1));
        let target = FakeTarget::running();

        let started = Instant::now();
        let err = prober
            .wait_until_ready(Duration::from_secs(10), target.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_secs(10)));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(check.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_longer_than_deadline() {
        let check = FakeCheck::never();
        let prober = Prober::new(check.clone(), Duration::from_secs(30));
        let target = FakeTarget::running();

        let started = Instant::now();
        assert!(prober
            .wait_until_ready(Duration::from_secs(5), target.as_ref())
            .await
            .is_err());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_fast_when_target_exits() {
        let check = FakeCheck::never();
        let prober = Prober::new(check.clone(), Duration::from_secs(1));
        let target = FakeTarget::running();
        target.set_alive(false);

        let started = Instant::now();
        let err = prober
            .wait_until_ready(Duration::from_secs(10), target.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::TargetExited);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(check.calls(), 0);
    }

    #[test]
    fn test_queue_status_from_lists() {
        let value = serde_json::json!({
            "queue_running": [[1, "prompt-a", {}]],
            "queue_pending": [[2, "prompt-b", {}], [3, "prompt-c", {}]]
        });
        let status = QueueStatus::from_json(&value).unwrap();
        assert_eq!(status, QueueStatus { running: 1, pending: 2 });
        assert!(status.is_busy());
    }

    #[test]
    fn test_queue_status_from_counts_and_empty() {
        let value = serde_json::json!({ "queue_running": 0, "queue_pending": 0 });
        let status = QueueStatus::from_json(&value).unwrap();
        assert!(!status.is_busy());

        assert!(QueueStatus::from_json(&serde_json::json!({ "other": 1 })).is_none());
    }
}
