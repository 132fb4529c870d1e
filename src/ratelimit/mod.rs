//! 限流请求引擎。
//!
//! 所有对配额受限后端（推文查询 + 回复搜索）的调用都必须经过 [`RateLimitedClient`]：
//! 月度配额、15 分钟窗口、服务端限流头、最小请求间隔与重试退避均在这里集中处理，
//! 上层只会看到最终的 [`CallError`] 或成功响应。

pub mod backoff;
pub mod client;
pub mod deadline;
pub mod error;
pub mod state;
pub mod transport;
pub mod usage;

pub use client::{ClientSettings, RateLimitedClient, UsageSnapshot};
pub use deadline::Deadline;
pub use error::CallError;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport};
