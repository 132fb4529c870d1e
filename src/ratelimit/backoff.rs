use std::time::Duration;

/// 重试退避策略。纯函数，不持有任何状态。
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    /// 指数退避上限（非限流的临时错误）。
    pub max_delay: Duration,
    /// 服务端 retry-after 提示的上限，避免无界挂起。
    pub max_server_hint: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_server_hint: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` 从 1 开始：base, 2*base, 4*base ... 直到 `max_delay`。
    pub fn delay_for(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.max_server_hint);
        }
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
