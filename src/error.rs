use crate::analysis::{AnalysisError, AnalyzeError};
use crate::ratelimit::CallError;
use crate::thread::UrlError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error("会话内容不足（共 {0} 条），无法分析")]
    InsufficientContent(usize),

    #[error("分析超过截止时间")]
    Timeout,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::InsufficientContent(_) => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_content"),
            Self::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Self::Call(e) => match e {
                CallError::QuotaExhausted { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exhausted"),
                CallError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
                CallError::PermanentError { status: 404, .. } => (StatusCode::NOT_FOUND, "not_found"),
                CallError::PermanentError { status: 401, .. } => {
                    (StatusCode::UNAUTHORIZED, "unauthorized")
                }
                CallError::PermanentError { .. } => (StatusCode::BAD_GATEWAY, "upstream"),
                CallError::TransientError { .. } => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
                CallError::InvalidResponse(_) => (StatusCode::BAD_GATEWAY, "invalid_response"),
                CallError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            },
            Self::Analyze(e) => match e {
                AnalyzeError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "analysis_unavailable"),
                AnalyzeError::Request(_) | AnalyzeError::Upstream { .. } => {
                    (StatusCode::BAD_GATEWAY, "analysis_upstream")
                }
                AnalyzeError::Parse(_) => (StatusCode::BAD_GATEWAY, "analysis_parse"),
            },
        }
    }
}

impl From<UrlError> for AppError {
    fn from(e: UrlError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<AnalysisError> for AppError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Fetch(e) => Self::Call(e),
            AnalysisError::InsufficientContent { items } => Self::InsufficientContent(items),
            AnalysisError::Analyze(e) => Self::Analyze(e),
            AnalysisError::Timeout => Self::Timeout,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), kind = ty, error = %self, "请求处理失败");
        } else {
            tracing::warn!(status = status.as_u16(), kind = ty, error = %self, "请求处理失败");
        }

        let body = ErrorBody {
            success: false,
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty,
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: impl Into<AppError>) -> StatusCode {
        e.into().status_and_type().0
    }

    #[test]
    fn call_errors_map_to_http_statuses() {
        assert_eq!(
            status_of(CallError::QuotaExhausted { count: 95, cap: 100 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(CallError::RateLimited {
                reset_at: None,
                attempts: 3
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        let permanent = |status| CallError::PermanentError {
            status,
            message: String::new(),
        };
        assert_eq!(status_of(permanent(404)), StatusCode::NOT_FOUND);
        assert_eq!(status_of(permanent(401)), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(permanent(403)), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(CallError::InvalidResponse("x".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_of(CallError::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn analysis_errors_unwrap_into_app_errors() {
        assert_eq!(
            status_of(AnalysisError::InsufficientContent { items: 1 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(AnalysisError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_of(AnalysisError::Fetch(CallError::Timeout)),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(UrlError::Invalid("nope".to_string())),
            StatusCode::BAD_REQUEST
        );
    }
}
