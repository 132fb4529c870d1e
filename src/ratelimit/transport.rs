use crate::config::Config;
use crate::logging;
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use thiserror::Error;

/// 一次逻辑调用的描述：方法、路径（相对 base_url）与查询参数。
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 错误响应体的简短描述（用于日志与错误信息）。
    pub fn error_message(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrBody {
            #[serde(default)]
            title: String,
            #[serde(default)]
            detail: String,
        }

        if let Ok(b) = sonic_rs::from_slice::<ErrBody>(&self.body) {
            let msg = if b.detail.is_empty() { b.title } else { b.detail };
            if !msg.is_empty() {
                return msg;
            }
        }
        let text = String::from_utf8_lossy(&self.body);
        let text = text.trim();
        if text.is_empty() {
            return "Unknown error".to_string();
        }
        text.chars().take(500).collect()
    }
}

/// 请求没能拿到 HTTP 响应（连接失败、超时、读取中断等）。
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// 发送单次 HTTP 请求的接缝：生产用 reqwest，测试用脚本化实现。
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl ReqwestTransport {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90));

        // 单次尝试的超时由 RateLimitedClient 控制，这里只兜底连接阶段。
        builder = builder.connect_timeout(Duration::from_secs(10));

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.x_api_base_url.trim_end_matches('/').to_string(),
            bearer_token: cfg.x_bearer_token.clone(),
            user_agent: cfg.user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("threadpeace")),
        );
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        h
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url(&req.path);
        let headers = self.build_headers();
        if self.log_level.backend_enabled() {
            let target = format_target(&url, &req.query);
            if self.log_level.raw_enabled() {
                logging::backend_request_raw(req.method.as_str(), &target, &headers, &[]);
            } else {
                logging::backend_request(req.method.as_str(), &target, &headers, &[]);
            }
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .request(req.method.clone(), url)
            .headers(headers)
            .query(&req.query)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_response_raw(status, start.elapsed(), &headers, &body);
            } else {
                logging::backend_response(status, start.elapsed(), &headers, &body);
            }
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn format_target(url: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{url}?{}", qs.join("&"))
}
