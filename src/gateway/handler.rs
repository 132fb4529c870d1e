use crate::analysis::AnalysisReport;
use crate::error::AppError;
use crate::gateway::{AppState, USAGE_WARNING_PERCENT};
use crate::logging;
use crate::ratelimit::{Deadline, UsageSnapshot};
use crate::thread::{ThreadPayload, extract_thread_id};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::Method;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Deserialize)]
struct ThreadRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UsageStatsResponse {
    success: bool,
    status: &'static str,
    message: String,
    #[serde(flatten)]
    usage: UsageSnapshot,
}

impl UsageStatsResponse {
    fn from_snapshot(usage: UsageSnapshot) -> Self {
        Self {
            success: true,
            status: usage_status(usage.usage_percentage),
            message: format!("本月额度已使用 {:.1}%", usage.usage_percentage),
            usage,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CategoryCounts {
    author_chain: usize,
    quote_tweets: usize,
    replies: usize,
    other: usize,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    success: bool,
    data: ThreadPayload,
    categories: CategoryCounts,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    success: bool,
    #[serde(flatten)]
    report: AnalysisReport,
}

pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn handle_usage_stats(State(state): State<Arc<AppState>>) -> Json<UsageStatsResponse> {
    Json(UsageStatsResponse::from_snapshot(state.client.current_usage()))
}

pub async fn handle_extract_thread(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Json<ExtractResponse>, AppError> {
    let start = Instant::now();
    log_client_request(&state, &method, &uri, &body);

    let thread_id = parse_thread_id(&body)?;
    let request_id = uuid::Uuid::new_v4();
    tracing::info!(%request_id, thread_id = %thread_id, "收到会话抓取请求");

    let payload = state
        .fetcher
        .fetch_thread(&thread_id, Deadline::after(state.extract_timeout))
        .await?;
    tracing::info!(
        %request_id,
        items = payload.total_items(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "会话抓取请求完成"
    );
    let c = payload.categories();
    let categories = CategoryCounts {
        author_chain: c.author_chain.len(),
        quote_tweets: c.quote_tweets.len(),
        replies: c.replies.len(),
        other: c.other.len(),
    };

    let resp = ExtractResponse {
        success: true,
        data: payload,
        categories,
    };
    log_client_response(&state, &resp, start);
    Ok(Json(resp))
}

pub async fn handle_analyze_thread(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let start = Instant::now();
    log_client_request(&state, &method, &uri, &body);

    let thread_id = parse_thread_id(&body)?;
    let request_id = uuid::Uuid::new_v4();
    tracing::info!(%request_id, thread_id = %thread_id, "收到共识分析请求");

    let report = state.orchestrator.analyze_thread(&thread_id).await?;
    tracing::info!(
        %request_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "共识分析请求完成"
    );
    let resp = AnalyzeResponse {
        success: true,
        report,
    };
    log_client_response(&state, &resp, start);
    Ok(Json(resp))
}

fn usage_status(percentage: f64) -> &'static str {
    if percentage >= USAGE_WARNING_PERCENT {
        "warning"
    } else {
        "healthy"
    }
}

fn parse_thread_id(body: &[u8]) -> Result<String, AppError> {
    let req: ThreadRequest = sonic_rs::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("请求体不是合法 JSON: {e}")))?;
    Ok(extract_thread_id(&req.url)?)
}

fn log_client_request(state: &AppState, method: &Method, uri: &OriginalUri, body: &[u8]) {
    if state.log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), body);
    }
}

fn log_client_response<T: Serialize>(state: &AppState, resp: &T, start: Instant) {
    if !state.log_level.client_enabled() {
        return;
    }
    if let Ok(body) = sonic_rs::to_vec(resp) {
        logging::client_response(200, start.elapsed(), &body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_status_warns_near_cap() {
        assert_eq!(usage_status(0.0), "healthy");
        assert_eq!(usage_status(89.9), "healthy");
        assert_eq!(usage_status(90.0), "warning");
        assert_eq!(usage_status(100.0), "warning");
    }

    #[test]
    fn usage_stats_body_carries_success_message_and_snapshot() {
        let transport = std::sync::Arc::new(
            crate::ratelimit::transport::testing::ScriptedTransport::new(vec![]),
        );
        let client = crate::ratelimit::RateLimitedClient::new(
            transport,
            crate::ratelimit::ClientSettings::default(),
        );
        let body =
            serde_json::to_value(UsageStatsResponse::from_snapshot(client.current_usage()))
                .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["message"], "本月额度已使用 0.0%");
        assert_eq!(body["monthly_count"], 0);
        assert_eq!(body["monthly_cap"], 100);
        assert!(body["window_remaining"].is_null());
    }

    #[test]
    fn usage_stats_warn_when_near_cap() {
        let transport = std::sync::Arc::new(
            crate::ratelimit::transport::testing::ScriptedTransport::new(vec![]),
        );
        let client = crate::ratelimit::RateLimitedClient::new(
            transport,
            crate::ratelimit::ClientSettings::default(),
        );
        let usage = UsageSnapshot {
            monthly_count: 92,
            usage_percentage: 92.0,
            ..client.current_usage()
        };
        let resp = UsageStatsResponse::from_snapshot(usage);
        assert_eq!(resp.status, "warning");
        assert_eq!(resp.message, "本月额度已使用 92.0%");
    }

    #[test]
    fn thread_id_comes_from_request_url() {
        assert_eq!(
            parse_thread_id(br#"{"url": "https://x.com/jack/status/20"}"#).unwrap(),
            "20"
        );
        assert!(matches!(
            parse_thread_id(br#"{"url": "https://example.com/a"}"#),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse_thread_id(b"not json"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse_thread_id(b"{}"),
            Err(AppError::BadRequest(_))
        ));
    }
}
