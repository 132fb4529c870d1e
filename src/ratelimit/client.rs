use crate::config::Config;
use crate::ratelimit::backoff::BackoffPolicy;
use crate::ratelimit::deadline::{Clock, Deadline};
use crate::ratelimit::error::{CallError, OutcomeKind};
use crate::ratelimit::state::{RateLimitState, WindowDecision, WindowHeaders};
use crate::ratelimit::transport::{ApiRequest, ApiResponse, Transport};
use crate::ratelimit::usage::UsageTracker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub max_attempts: u32,
    pub min_request_interval: Duration,
    /// 单次尝试的超时；实际取它与整体截止时间剩余预算中的较小者。
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub monthly_cap: u32,
    pub monthly_safety_cutoff: u32,
}

impl ClientSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            min_request_interval: Duration::from_millis(cfg.min_request_interval_ms),
            call_timeout: Duration::from_millis(cfg.call_timeout_ms),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(cfg.backoff_base_ms),
                max_delay: Duration::from_millis(cfg.backoff_max_ms),
                max_server_hint: Duration::from_millis(cfg.retry_after_max_ms),
            },
            monthly_cap: cfg.monthly_cap,
            monthly_safety_cutoff: cfg.monthly_safety_cutoff,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_request_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            monthly_cap: 100,
            monthly_safety_cutoff: 95,
        }
    }
}

/// 用量快照（对外只读视图）。
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub monthly_count: u32,
    pub monthly_cap: u32,
    pub safety_cutoff: u32,
    pub usage_percentage: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub window_limit: Option<u32>,
    pub window_remaining: Option<u32>,
    pub window_reset_at: Option<DateTime<Utc>>,
}

/// 窗口状态与月度用量共用一把锁：检查与预留必须在同一个临界区内完成。
#[derive(Debug)]
struct Shared {
    window: RateLimitState,
    usage: UsageTracker,
    /// 最近一次（已预约的）请求发出时间，用于全进程的最小间隔。
    last_start: Option<Instant>,
}

/// 所有配额受限调用的唯一出口。
pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    shared: Mutex<Shared>,
    probe_done: Notify,
    clock: Clock,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        let clock = Clock::new();
        let usage = UsageTracker::new(
            settings.monthly_cap,
            settings.monthly_safety_cutoff,
            clock.now(),
        );
        Self {
            transport,
            settings,
            shared: Mutex::new(Shared {
                window: RateLimitState::new(),
                usage,
                last_start: None,
            }),
            probe_done: Notify::new(),
            clock,
        }
    }

    pub fn current_usage(&self) -> UsageSnapshot {
        let mut shared = self.shared.lock();
        shared.usage.reset_if_new_period(self.clock.now());
        UsageSnapshot {
            monthly_count: shared.usage.monthly_count(),
            monthly_cap: shared.usage.monthly_cap(),
            safety_cutoff: shared.usage.safety_cutoff(),
            usage_percentage: shared.usage.usage_percentage(),
            period_start: shared.usage.period_start(),
            period_end: shared.usage.period_end(),
            window_limit: shared.window.window_limit,
            window_remaining: shared.window.window_remaining,
            window_reset_at: shared.window.window_reset_at,
        }
    }

    /// 执行一次逻辑调用（内部最多 `max_attempts` 次尝试）。
    ///
    /// 月度计数只在成功路径上 +1；失败、重试与取消（future 被丢弃）都只会释放预留。
    pub async fn execute(
        &self,
        req: &ApiRequest,
        deadline: Deadline,
    ) -> Result<ApiResponse, CallError> {
        deadline.check()?;
        let reservation = self.reserve_usage()?;
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_err = CallError::Timeout;

        for attempt in 1..=max_attempts {
            let permit = self.acquire_window(attempt, deadline).await?;
            self.wait_for_slot(deadline).await?;

            let started = Instant::now();
            let budget = self.settings.call_timeout.min(deadline.remaining());
            let sent = tokio::time::timeout(budget, self.transport.send(req)).await;

            let (err, hint) = match sent {
                Err(_) => {
                    permit.consume();
                    if deadline.is_expired() {
                        tracing::warn!(
                            path = %req.path,
                            attempt,
                            outcome = OutcomeKind::Timeout.as_str(),
                            "请求超过截止时间，放弃"
                        );
                        return Err(CallError::Timeout);
                    }
                    let err = CallError::TransientError {
                        status: None,
                        detail: format!("单次请求超时（{}ms）", budget.as_millis()),
                        attempts: attempt,
                    };
                    (err, None)
                }
                Ok(Err(e)) => {
                    permit.release();
                    let err = CallError::TransientError {
                        status: None,
                        detail: e.to_string(),
                        attempts: attempt,
                    };
                    (err, None)
                }
                Ok(Ok(resp)) => {
                    let headers = WindowHeaders::parse(&resp.headers, self.clock.now());
                    let reset_at = permit.observe(&headers);

                    if resp.is_success() {
                        let count = reservation.commit();
                        tracing::info!(
                            path = %req.path,
                            attempt,
                            status = resp.status,
                            outcome = OutcomeKind::Success.as_str(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            window_remaining = ?headers.remaining,
                            monthly_count = count,
                            monthly_cap = self.settings.monthly_cap,
                            "后端调用成功"
                        );
                        return Ok(resp);
                    }

                    match resp.status {
                        429 => {
                            let err = CallError::RateLimited {
                                reset_at,
                                attempts: attempt,
                            };
                            (err, headers.retry_after)
                        }
                        400..=499 => {
                            let err = CallError::PermanentError {
                                status: resp.status,
                                message: resp.error_message(),
                            };
                            log_attempt(req, attempt, max_attempts, &err, started);
                            return Err(err);
                        }
                        status => {
                            let err = CallError::TransientError {
                                status: Some(status),
                                detail: resp.error_message(),
                                attempts: attempt,
                            };
                            (err, None)
                        }
                    }
                }
            };

            log_attempt(req, attempt, max_attempts, &err, started);
            last_err = err;
            if attempt == max_attempts {
                break;
            }

            let delay = self.settings.backoff.delay_for(attempt, hint);
            tracing::warn!(
                path = %req.path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                server_hint = hint.is_some(),
                "等待后重试"
            );
            deadline.sleep(delay).await?;
        }

        tracing::error!(path = %req.path, error = %last_err, "重试次数已用尽");
        Err(last_err)
    }

    fn reserve_usage(&self) -> Result<UsageReservation<'_>, CallError> {
        let mut shared = self.shared.lock();
        if shared.usage.reset_if_new_period(self.clock.now()) {
            tracing::info!(
                period_start = %shared.usage.period_start(),
                "进入新的计费周期，月度计数已清零"
            );
        }
        if !shared.usage.reserve() {
            let count = shared.usage.monthly_count();
            let cap = shared.usage.monthly_cap();
            tracing::warn!(
                monthly_count = count,
                reserved = shared.usage.reserved(),
                safety_cutoff = shared.usage.safety_cutoff(),
                "月度额度已达安全阈值，拒绝发起请求"
            );
            return Err(CallError::QuotaExhausted { count, cap });
        }
        Ok(UsageReservation {
            client: self,
            committed: false,
        })
    }

    async fn acquire_window(
        &self,
        attempt: u32,
        deadline: Deadline,
    ) -> Result<WindowPermit<'_>, CallError> {
        loop {
            let notified = self.probe_done.notified();
            tokio::pin!(notified);

            let decision = {
                let mut shared = self.shared.lock();
                let decision = shared.window.try_reserve(self.clock.now());
                if decision == WindowDecision::WaitForProbe {
                    // 在释放锁之前注册，避免错过探测请求结束的通知。
                    notified.as_mut().enable();
                }
                decision
            };

            match decision {
                WindowDecision::Reserved | WindowDecision::Probe => {
                    return Ok(WindowPermit {
                        client: self,
                        decision,
                        settled: false,
                    });
                }
                WindowDecision::WaitUntil(reset_at) => {
                    let wait = (reset_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    if wait > deadline.remaining() {
                        tracing::warn!(
                            reset_at = %reset_at,
                            wait_secs = wait.as_secs(),
                            outcome = OutcomeKind::RateLimited.as_str(),
                            "窗口已耗尽且重置时间超出截止时间"
                        );
                        return Err(CallError::RateLimited {
                            reset_at: Some(reset_at),
                            attempts: attempt - 1,
                        });
                    }
                    tracing::warn!(
                        reset_at = %reset_at,
                        wait_secs = wait.as_secs(),
                        "15 分钟窗口已耗尽，等待重置"
                    );
                    deadline.sleep(wait).await?;
                }
                WindowDecision::WaitForProbe => {
                    tracing::debug!("窗口状态未知，等待探测请求结束");
                    if tokio::time::timeout_at(deadline.instant(), notified)
                        .await
                        .is_err()
                    {
                        return Err(CallError::Timeout);
                    }
                }
            }
        }
    }

    /// 预约下一个发送时间点（锁内完成），然后在锁外等待。
    async fn wait_for_slot(&self, deadline: Deadline) -> Result<(), CallError> {
        let wake = {
            let mut shared = self.shared.lock();
            let now = Instant::now();
            let slot = match shared.last_start {
                Some(prev) => (prev + self.settings.min_request_interval).max(now),
                None => now,
            };
            shared.last_start = Some(slot);
            slot
        };
        deadline.sleep_until(wake).await
    }
}

fn log_attempt(
    req: &ApiRequest,
    attempt: u32,
    max_attempts: u32,
    err: &CallError,
    started: Instant,
) {
    let outcome: OutcomeKind = err.kind();
    tracing::warn!(
        path = %req.path,
        attempt,
        max_attempts,
        outcome = outcome.as_str(),
        status = ?err.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err,
        "后端调用失败"
    );
}

/// 月度用量预留：drop 时若未 commit 则归还。
struct UsageReservation<'a> {
    client: &'a RateLimitedClient,
    committed: bool,
}

impl UsageReservation<'_> {
    fn commit(mut self) -> u32 {
        let mut shared = self.client.shared.lock();
        shared.usage.record_success();
        self.committed = true;
        shared.usage.monthly_count()
    }
}

impl Drop for UsageReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.client.shared.lock().usage.release();
        }
    }
}

/// 窗口名额：拿到响应后用响应头结算；传输错误或取消（drop）时归还。
struct WindowPermit<'a> {
    client: &'a RateLimitedClient,
    decision: WindowDecision,
    settled: bool,
}

impl WindowPermit<'_> {
    /// 返回结算后已知的窗口重置时间。
    fn observe(mut self, headers: &WindowHeaders) -> Option<DateTime<Utc>> {
        let reset_at = {
            let mut shared = self.client.shared.lock();
            shared.window.observe(self.decision, headers);
            shared.window.window_reset_at
        };
        self.finish();
        reset_at
    }

    /// 单次超时：请求可能已被后端计数，名额按已用结算。
    fn consume(mut self) {
        self.client.shared.lock().window.consume(self.decision);
        self.finish();
    }

    fn release(mut self) {
        self.client.shared.lock().window.release(self.decision);
        self.finish();
    }

    fn finish(&mut self) {
        self.settled = true;
        if self.decision == WindowDecision::Probe {
            self.client.probe_done.notify_waiters();
        }
    }
}

impl Drop for WindowPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.client.shared.lock().window.release(self.decision);
        self.finish();
    }
}
