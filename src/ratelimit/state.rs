use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

pub const HEADER_LIMIT: &str = "x-rate-limit-limit";
pub const HEADER_REMAINING: &str = "x-rate-limit-remaining";
pub const HEADER_RESET: &str = "x-rate-limit-reset";

/// 后端通过响应头公布的窗口状态（被动记录，只由响应头刷新）。
///
/// `window_remaining == None` 表示“未知”：此时只允许一个探测请求在途，
/// 直到新的响应头确认窗口余量。
///
/// `window_remaining` 始终扣除已发出、尚未结算的请求：响应头里的 remaining
/// 不包含仍在途的请求。
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    pub window_limit: Option<u32>,
    pub window_remaining: Option<u32>,
    pub window_reset_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    in_flight: u32,
}

/// 单次响应中解析出的限流头。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

/// 预检结果：在锁内决定本次尝试能否发出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// 已预留一个窗口名额。
    Reserved,
    /// 窗口未知，本请求作为探测请求发出。
    Probe,
    /// 窗口已耗尽，需要等到 reset。
    WaitUntil(DateTime<Utc>),
    /// 另一个探测请求在途，等待其结果。
    WaitForProbe,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检查并预留窗口名额；调用方必须持有共享状态的锁。
    pub fn try_reserve(&mut self, now: DateTime<Utc>) -> WindowDecision {
        if self.window_remaining == Some(0) {
            match self.window_reset_at {
                Some(reset_at) if now < reset_at => return WindowDecision::WaitUntil(reset_at),
                // 已过 reset 时间（或从未给出）：窗口状态不可信，退回未知。
                _ => self.window_remaining = None,
            }
        }

        match self.window_remaining {
            Some(n) => {
                self.window_remaining = Some(n - 1);
                self.in_flight += 1;
                WindowDecision::Reserved
            }
            None if self.probe_in_flight => WindowDecision::WaitForProbe,
            None => {
                self.probe_in_flight = true;
                self.in_flight += 1;
                WindowDecision::Probe
            }
        }
    }

    /// 已发出且尚未结算的请求数。
    #[cfg(test)]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    fn settle(&mut self, decision: WindowDecision) {
        if matches!(decision, WindowDecision::Reserved | WindowDecision::Probe) {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        if decision == WindowDecision::Probe {
            self.probe_in_flight = false;
        }
    }

    /// 请求没有到达后端（传输错误）：归还预留，不改变已知状态。
    pub fn release(&mut self, decision: WindowDecision) {
        if decision == WindowDecision::Reserved
            && let Some(n) = self.window_remaining
        {
            let n = n.saturating_add(1);
            self.window_remaining = Some(match self.window_limit {
                Some(limit) => n.min(limit),
                None => n,
            });
        }
        self.settle(decision);
    }

    /// 请求可能已到达后端但没有拿到响应（单次超时）：名额按已用计，窗口状态不变。
    pub fn consume(&mut self, decision: WindowDecision) {
        self.settle(decision);
    }

    /// 用响应头刷新窗口状态（无论成功与否，响应头都是权威数据）。
    ///
    /// 响应没有 remaining 头时：探测请求结束，但窗口仍视为未知。
    pub fn observe(&mut self, decision: WindowDecision, headers: &WindowHeaders) {
        self.settle(decision);
        if let Some(limit) = headers.limit {
            self.window_limit = Some(limit);
        }
        if let Some(reset_at) = headers.reset_at {
            self.window_reset_at = Some(reset_at);
        }
        if let Some(remaining) = headers.remaining {
            self.window_remaining = Some(remaining.saturating_sub(self.in_flight));
        } else if decision == WindowDecision::Probe {
            self.window_remaining = None;
        }
    }
}

impl WindowHeaders {
    pub fn parse(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        Self {
            limit: header_u32(headers, HEADER_LIMIT),
            remaining: header_remaining(headers),
            reset_at: header_str(headers, HEADER_RESET)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            retry_after: header_str(headers, RETRY_AFTER.as_str())
                .and_then(|s| parse_retry_after(s, now)),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name)?.parse().ok()
}

/// 负数或无法解析的 remaining 视为缺失。
fn header_remaining(headers: &HeaderMap) -> Option<u32> {
    let raw: i64 = header_str(headers, HEADER_REMAINING)?.parse().ok()?;
    u32::try_from(raw).ok()
}

/// `retry-after` 支持秒数与 HTTP 日期两种格式。
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if !(secs.is_finite() && secs >= 0.0) {
            return None;
        }
        return Some(Duration::from_secs_f64(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn parse_reads_window_headers() {
        let now = Utc::now();
        let h = headers(&[
            (HEADER_LIMIT, "300"),
            (HEADER_REMAINING, "299"),
            (HEADER_RESET, "1700000000"),
            ("retry-after", "7"),
        ]);
        let parsed = WindowHeaders::parse(&h, now);
        assert_eq!(parsed.limit, Some(300));
        assert_eq!(parsed.remaining, Some(299));
        assert_eq!(parsed.reset_at.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn negative_remaining_is_unknown() {
        let parsed = WindowHeaders::parse(&headers(&[(HEADER_REMAINING, "-1")]), Utc::now());
        assert_eq!(parsed.remaining, None);
    }

    #[test]
    fn retry_after_http_date() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:28:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let d = parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now);
        assert_eq!(d, Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn unknown_window_allows_single_probe() {
        let now = Utc::now();
        let mut state = RateLimitState::new();
        assert_eq!(state.try_reserve(now), WindowDecision::Probe);
        assert_eq!(state.try_reserve(now), WindowDecision::WaitForProbe);

        let confirmed = WindowHeaders {
            remaining: Some(5),
            ..Default::default()
        };
        state.observe(WindowDecision::Probe, &confirmed);
        assert_eq!(state.try_reserve(now), WindowDecision::Reserved);
        assert_eq!(state.window_remaining, Some(4));
    }

    #[test]
    fn exhausted_window_waits_until_reset_then_turns_unknown() {
        let now = Utc::now();
        let reset_at = now + chrono::Duration::seconds(60);
        let mut state = RateLimitState {
            window_remaining: Some(0),
            window_reset_at: Some(reset_at),
            ..Default::default()
        };
        assert_eq!(state.try_reserve(now), WindowDecision::WaitUntil(reset_at));

        let later = reset_at + chrono::Duration::seconds(1);
        assert_eq!(state.try_reserve(later), WindowDecision::Probe);
        assert_eq!(state.window_remaining, None);
    }

    #[test]
    fn release_restores_reservation() {
        let now = Utc::now();
        let mut state = RateLimitState {
            window_limit: Some(10),
            window_remaining: Some(1),
            ..Default::default()
        };
        let d = state.try_reserve(now);
        assert_eq!(state.window_remaining, Some(0));
        state.release(d);
        assert_eq!(state.window_remaining, Some(1));
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn header_remaining_excludes_requests_still_in_flight() {
        let now = Utc::now();
        let reset_at = now + chrono::Duration::minutes(10);
        let mut state = RateLimitState {
            window_limit: Some(2),
            window_remaining: Some(2),
            window_reset_at: Some(reset_at),
            ..Default::default()
        };
        let a = state.try_reserve(now);
        let b = state.try_reserve(now);
        assert_eq!(state.in_flight(), 2);

        // a 的响应只算了 a 自己，b 仍在途。
        let after_a = WindowHeaders {
            remaining: Some(1),
            ..Default::default()
        };
        state.observe(a, &after_a);
        assert_eq!(state.window_remaining, Some(0));
        assert_eq!(state.try_reserve(now), WindowDecision::WaitUntil(reset_at));

        let after_b = WindowHeaders {
            remaining: Some(0),
            ..Default::default()
        };
        state.observe(b, &after_b);
        assert_eq!(state.window_remaining, Some(0));
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn consumed_slot_is_not_returned() {
        let now = Utc::now();
        let mut state = RateLimitState {
            window_limit: Some(10),
            window_remaining: Some(3),
            ..Default::default()
        };
        let d = state.try_reserve(now);
        state.consume(d);
        assert_eq!(state.window_remaining, Some(2));
        assert_eq!(state.in_flight(), 0);

        let mut unknown = RateLimitState::new();
        let probe = unknown.try_reserve(now);
        unknown.consume(probe);
        assert_eq!(unknown.window_remaining, None);
        assert_eq!(unknown.try_reserve(now), WindowDecision::Probe);
    }
}
