use crate::analysis::types::{ConsensusResult, DEFAULT_CONFIDENCE, ViewpointSide};
use crate::config::Config;
use crate::logging;
use crate::thread::ThreadPayload;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

/// 送入提示词的最多条目数（根推文 + 回复）。
pub const MAX_PROMPT_ITEMS: usize = 50;

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 1500;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("未配置 XAI_API_KEY，分析功能不可用")]
    NotConfigured,

    #[error("分析服务请求失败: {0}")]
    Request(String),

    #[error("分析服务返回 {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("分析结果无法解析: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for AnalyzeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// 共识分析的接缝：输入完整提示词，输出结构化结果。
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    async fn analyze(&self, prompt: &str) -> Result<ConsensusResult, AnalyzeError>;
}

pub fn build_prompt(payload: &ThreadPayload) -> String {
    let mut items = String::new();
    for (i, tweet) in payload.items().take(MAX_PROMPT_ITEMS).enumerate() {
        let _ = writeln!(items, "{}. @{}: {}", i + 1, tweet.author_username, tweet.text);
    }

    format!(
        r#"You are reading a heated X/Twitter debate. Your job is to find genuine common ground between the opposing sides.

THREAD
Main post: {root}
Total posts: {total}

POSTS
{items}
TASK
1. Identify the two main opposing viewpoints.
2. Assign the posts to Side A or Side B by stance.
3. Extract the core arguments of each side.
4. Find concrete shared values, concerns or facts both sides accept, even where they disagree on solutions.

Reply with JSON only, in exactly this shape:
{{
  "sideA": {{"title": "neutral title", "points": ["argument", "argument"], "username": "most representative username without @"}},
  "sideB": {{"title": "neutral title", "points": ["argument", "argument"], "username": "most representative username without @"}},
  "consensus": ["shared point", "shared point"],
  "confidence_score": 0.0
}}

Avoid platitudes such as "both sides want the best". Be specific. Return nothing but the JSON object."#,
        root = payload.root_item.text,
        total = payload.total_items(),
    )
}

#[derive(Deserialize)]
struct RawConsensus {
    #[serde(rename = "sideA")]
    side_a: Option<ViewpointSide>,
    #[serde(rename = "sideB")]
    side_b: Option<ViewpointSide>,
    consensus: Option<Vec<String>>,
    confidence_score: Option<f64>,
}

/// 解析模型回复：去掉 ```json 围栏，取最外层 `{...}`，校验必需字段。
pub fn parse_consensus_response(content: &str) -> Result<ConsensusResult, AnalyzeError> {
    let mut text = content.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }

    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(AnalyzeError::Parse("回复中没有 JSON 对象".to_string()));
    };
    if end < start {
        return Err(AnalyzeError::Parse("回复中没有 JSON 对象".to_string()));
    }

    let raw: RawConsensus = sonic_rs::from_str(&text[start..=end])
        .map_err(|e| AnalyzeError::Parse(e.to_string()))?;

    let mut missing = Vec::new();
    if raw.side_a.is_none() {
        missing.push("sideA");
    }
    if raw.side_b.is_none() {
        missing.push("sideB");
    }
    if raw.consensus.is_none() {
        missing.push("consensus");
    }
    match (raw.side_a, raw.side_b, raw.consensus) {
        (Some(side_a), Some(side_b), Some(consensus)) => Ok(ConsensusResult {
            side_a,
            side_b,
            consensus,
            confidence_score: raw
                .confidence_score
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_CONFIDENCE),
        }),
        _ => Err(AnalyzeError::Parse(format!(
            "缺少必需字段: {}",
            missing.join(", ")
        ))),
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// xAI chat completions 实现。
#[derive(Debug, Clone)]
pub struct GrokAnalyzer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl GrokAnalyzer {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90));
        if cfg.analyzer_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.analyzer_timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.xai_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.xai_api_key.clone(),
            model: cfg.xai_model.clone(),
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
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }
}

#[async_trait]
impl Analyzer for GrokAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<ConsensusResult, AnalyzeError> {
        if self.api_key.is_empty() {
            return Err(AnalyzeError::NotConfigured);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };
        let body = sonic_rs::to_vec(&req).map_err(|e| AnalyzeError::Request(e.to_string()))?;
        let headers = self.build_headers();
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_request_raw("POST", &url, &headers, &body);
            } else {
                logging::backend_request("POST", &url, &headers, &body);
            }
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let resp_headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_response_raw(status, start.elapsed(), &resp_headers, &bytes);
            } else {
                logging::backend_response(status, start.elapsed(), &resp_headers, &bytes);
            }
        }

        if !(200..300).contains(&status) {
            let message: String = String::from_utf8_lossy(&bytes).chars().take(500).collect();
            tracing::warn!(status, model = %self.model, "分析服务返回错误");
            return Err(AnalyzeError::Upstream { status, message });
        }

        let parsed: ChatResponse =
            sonic_rs::from_slice(&bytes).map_err(|e| AnalyzeError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalyzeError::Parse("分析服务没有返回内容".to_string()))?;

        tracing::info!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = content.chars().count(),
            "分析服务返回结果"
        );
        parse_consensus_response(&content)
    }
}
