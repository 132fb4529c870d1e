use crate::ratelimit::error::CallError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// 以 tokio 单调时钟推算的 UTC 时间。
///
/// 窗口重置时间来自后端（UTC 秒），而所有挂起都跑在 tokio 时钟上；两者必须是同一个时间源。
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次分析（或一次逻辑调用）的整体截止时间。所有挂起点都要和它赛跑。
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn check(&self) -> Result<(), CallError> {
        if self.is_expired() {
            Err(CallError::Timeout)
        } else {
            Ok(())
        }
    }

    /// 可取消的挂起：等待时间超过剩余预算时，只睡到截止时间然后返回 `Timeout`。
    pub async fn sleep(&self, delay: Duration) -> Result<(), CallError> {
        if delay.is_zero() {
            return self.check();
        }
        let wake = Instant::now() + delay;
        if wake > self.at {
            tokio::time::sleep_until(self.at).await;
            return Err(CallError::Timeout);
        }
        tokio::time::sleep_until(wake).await;
        Ok(())
    }

    pub async fn sleep_until(&self, wake: Instant) -> Result<(), CallError> {
        self.sleep(wake.saturating_duration_since(Instant::now()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - before).num_seconds(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_within_budget_succeeds() {
        let d = Deadline::after(Duration::from_secs(10));
        assert!(d.sleep(Duration::from_secs(3)).await.is_ok());
        assert_eq!(d.remaining(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_beyond_budget_times_out_at_deadline() {
        let start = Instant::now();
        let d = Deadline::after(Duration::from_secs(5));
        let err = d.sleep(Duration::from_secs(900)).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
