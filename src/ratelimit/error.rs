use chrono::{DateTime, Utc};
use thiserror::Error;

/// 单次尝试的结果分类（用于日志与最终错误）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    RateLimited,
    TransientError,
    PermanentError,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::TransientError => "transient_error",
            Self::PermanentError => "permanent_error",
            Self::Timeout => "timeout",
        }
    }
}

/// 一次逻辑调用的终态错误。所有配额/退避决策都在客户端内部完成，只有这里的结果会跨越组件边界。
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("本月调用额度已达安全阈值（{count}/{cap}），请等待下个周期")]
    QuotaExhausted { count: u32, cap: u32 },

    #[error("{}", rate_limited_message(.reset_at))]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        attempts: u32,
    },

    #[error("后端返回 {status}: {message}")]
    PermanentError { status: u16, message: String },

    #[error("后端暂时不可用（{attempts} 次尝试）: {detail}")]
    TransientError {
        status: Option<u16>,
        detail: String,
        attempts: u32,
    },

    #[error("请求超过截止时间")]
    Timeout,

    #[error("无法解析后端响应: {0}")]
    InvalidResponse(String),
}

fn rate_limited_message(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(t) => format!("触发后端限流，请稍后重试（窗口重置时间 {}）", t.to_rfc3339()),
        None => "触发后端限流，请稍后重试".to_string(),
    }
}

impl CallError {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::RateLimited { .. } | Self::QuotaExhausted { .. } => OutcomeKind::RateLimited,
            Self::PermanentError { .. } | Self::InvalidResponse(_) => OutcomeKind::PermanentError,
            Self::TransientError { .. } => OutcomeKind::TransientError,
            Self::Timeout => OutcomeKind::Timeout,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::PermanentError { status, .. } => Some(*status),
            Self::TransientError { status, .. } => *status,
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
