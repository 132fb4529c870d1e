//! 对外 HTTP 接口。

pub mod cors;
pub mod handler;

use crate::analysis::AnalysisOrchestrator;
use crate::logging::LogLevel;
use crate::ratelimit::RateLimitedClient;
use crate::thread::ThreadFetcher;
use std::sync::Arc;
use std::time::Duration;

pub use cors::cors_layer;
pub use handler::{handle_analyze_thread, handle_extract_thread, handle_health, handle_usage_stats};

/// 用量百分比达到该值时 `/api/usage-stats` 报告 warning。
pub const USAGE_WARNING_PERCENT: f64 = 90.0;

pub struct AppState {
    pub client: Arc<RateLimitedClient>,
    pub fetcher: ThreadFetcher,
    pub orchestrator: AnalysisOrchestrator,
    /// 单独抓取（不分析）时的截止时间。
    pub extract_timeout: Duration,
    pub log_level: LogLevel,
}
