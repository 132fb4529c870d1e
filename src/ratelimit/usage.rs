use chrono::{DateTime, Datelike, TimeZone, Utc};

/// 进程级月度调用计数（重启即丢失）。
///
/// `monthly_count` 只在一次逻辑调用成功后 +1；`reserved` 记录已通过预检但尚未结束的调用，
/// 预检时一并计入，避免并发请求同时看到“还有余额”。
#[derive(Debug, Clone)]
pub struct UsageTracker {
    monthly_count: u32,
    monthly_cap: u32,
    safety_cutoff: u32,
    reserved: u32,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

impl UsageTracker {
    pub fn new(monthly_cap: u32, safety_cutoff: u32, now: DateTime<Utc>) -> Self {
        let (period_start, period_end) = month_bounds(now);
        Self {
            monthly_count: 0,
            monthly_cap,
            safety_cutoff: safety_cutoff.min(monthly_cap),
            reserved: 0,
            period_start,
            period_end,
        }
    }

    pub fn monthly_count(&self) -> u32 {
        self.monthly_count
    }

    pub fn monthly_cap(&self) -> u32 {
        self.monthly_cap
    }

    pub fn safety_cutoff(&self) -> u32 {
        self.safety_cutoff
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_end
    }

    pub fn is_exhausted(&self) -> bool {
        self.monthly_count.saturating_add(self.reserved) >= self.safety_cutoff
    }

    /// 预检通过后占位；调用结束时必须配对 `record_success` 或 `release`。
    pub fn reserve(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.reserved += 1;
        true
    }

    pub fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// 确认一次成功调用：占位转为正式计数。
    pub fn record_success(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
        self.monthly_count = self.monthly_count.saturating_add(1);
    }

    /// 到达周期末尾时清零并推进到 now 所在的自然月。返回是否发生了重置。
    pub fn reset_if_new_period(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.period_end {
            return false;
        }
        let (start, end) = month_bounds(now);
        self.period_start = start;
        self.period_end = end;
        self.monthly_count = 0;
        true
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.monthly_cap == 0 {
            return 100.0;
        }
        let pct = f64::from(self.monthly_count) / f64::from(self.monthly_cap) * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// UTC 自然月 [start, end)。
fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (y, m) = (now.year(), now.month());
    let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
    let start = Utc
        .with_ymd_and_hms(y, m, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = Utc
        .with_ymd_and_hms(ny, nm, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn period_covers_calendar_month() {
        let t = UsageTracker::new(100, 95, at("2024-12-15T10:00:00Z"));
        assert_eq!(t.period_start(), at("2024-12-01T00:00:00Z"));
        assert_eq!(t.period_end(), at("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn cutoff_counts_reservations() {
        let mut t = UsageTracker::new(3, 2, at("2024-05-01T00:00:00Z"));
        assert!(t.reserve());
        assert!(t.reserve());
        assert!(!t.reserve());
        assert!(t.is_exhausted());

        t.release();
        assert!(!t.is_exhausted());
        t.record_success();
        assert_eq!(t.monthly_count(), 1);
        assert_eq!(t.reserved(), 0);
    }

    #[test]
    fn cutoff_never_exceeds_cap() {
        let t = UsageTracker::new(10, 50, Utc::now());
        assert_eq!(t.safety_cutoff(), 10);
    }

    #[test]
    fn reset_rolls_to_next_period() {
        let mut t = UsageTracker::new(100, 95, at("2024-01-20T00:00:00Z"));
        assert!(t.reserve());
        t.record_success();
        assert!(!t.reset_if_new_period(at("2024-01-31T23:59:59Z")));
        assert_eq!(t.monthly_count(), 1);

        assert!(t.reset_if_new_period(at("2024-03-02T08:00:00Z")));
        assert_eq!(t.monthly_count(), 0);
        assert_eq!(t.period_start(), at("2024-03-01T00:00:00Z"));
        assert_eq!(t.period_end(), at("2024-04-01T00:00:00Z"));
    }

    #[test]
    fn usage_percentage_rounds_to_one_decimal() {
        let mut t = UsageTracker::new(3, 3, Utc::now());
        assert!(t.reserve());
        t.record_success();
        assert_eq!(t.usage_percentage(), 33.3);
    }
}
