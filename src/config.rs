use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_USER_AGENT: &str = "threadpeace/0.1";
// 前端开发端口与线上部署域名；`*.` 前缀按子域名后缀匹配。
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:3001,https://*.vercel.app,https://x-consensus-builder.vercel.app";

pub const DEFAULT_X_API_BASE_URL: &str = "https://api.twitter.com/2";
pub const DEFAULT_XAI_BASE_URL: &str = "https://api.x.ai/v1";
pub const DEFAULT_XAI_MODEL: &str = "grok-3-mini";

// 免费档：每月 100 次，95 次即停止，留出余量避免超额。
const DEFAULT_MONTHLY_CAP: u32 = 100;
const DEFAULT_MONTHLY_SAFETY_CUTOFF: u32 = 95;

const DEFAULT_MIN_REQUEST_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_RETRY_AFTER_MAX_MS: u64 = 15 * 60 * 1_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ANALYSIS_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_ANALYZER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_REPLIES: u32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user_agent: String,
    pub proxy: String,
    pub cors_origins: Vec<String>,

    pub x_bearer_token: String,
    pub x_api_base_url: String,

    pub xai_api_key: String,
    pub xai_base_url: String,
    pub xai_model: String,
    pub analyzer_timeout_ms: u64,

    pub monthly_cap: u32,
    pub monthly_safety_cutoff: u32,
    pub min_request_interval_ms: u64,
    pub retry_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub retry_after_max_ms: u64,
    pub call_timeout_ms: u64,
    pub analysis_timeout_ms: u64,
    pub max_replies: u32,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,
    #[serde(alias = "USER_AGENT")]
    user_agent: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "CORS_ORIGINS")]
    cors_origins: Option<String>,

    #[serde(alias = "X_BEARER_TOKEN")]
    x_bearer_token: Option<String>,
    #[serde(alias = "X_API_BASE_URL")]
    x_api_base_url: Option<String>,

    #[serde(alias = "XAI_API_KEY")]
    xai_api_key: Option<String>,
    #[serde(alias = "XAI_BASE_URL")]
    xai_base_url: Option<String>,
    #[serde(alias = "XAI_MODEL")]
    xai_model: Option<String>,
    #[serde(alias = "ANALYZER_TIMEOUT_MS")]
    analyzer_timeout_ms: Option<u64>,

    #[serde(alias = "MONTHLY_CAP")]
    monthly_cap: Option<u32>,
    #[serde(alias = "MONTHLY_SAFETY_CUTOFF")]
    monthly_safety_cutoff: Option<u32>,
    #[serde(alias = "MIN_REQUEST_INTERVAL_MS")]
    min_request_interval_ms: Option<u64>,
    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,
    #[serde(alias = "BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,
    #[serde(alias = "BACKOFF_MAX_MS")]
    backoff_max_ms: Option<u64>,
    #[serde(alias = "RETRY_AFTER_MAX_MS")]
    retry_after_max_ms: Option<u64>,
    #[serde(alias = "CALL_TIMEOUT_MS")]
    call_timeout_ms: Option<u64>,
    #[serde(alias = "ANALYSIS_TIMEOUT_MS")]
    analysis_timeout_ms: Option<u64>,
    #[serde(alias = "MAX_REPLIES")]
    max_replies: Option<u32>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let monthly_cap = raw.monthly_cap.unwrap_or(DEFAULT_MONTHLY_CAP);
        let monthly_safety_cutoff = raw
            .monthly_safety_cutoff
            .unwrap_or(DEFAULT_MONTHLY_SAFETY_CUTOFF)
            .min(monthly_cap);

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            user_agent: raw
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            proxy: raw.proxy.unwrap_or_default(),
            cors_origins: parse_origins(
                raw.cors_origins.as_deref().unwrap_or(DEFAULT_CORS_ORIGINS),
            ),
            x_bearer_token: raw.x_bearer_token.unwrap_or_default().trim().to_string(),
            x_api_base_url: non_empty_or(raw.x_api_base_url, DEFAULT_X_API_BASE_URL),
            xai_api_key: raw.xai_api_key.unwrap_or_default().trim().to_string(),
            xai_base_url: non_empty_or(raw.xai_base_url, DEFAULT_XAI_BASE_URL),
            xai_model: non_empty_or(raw.xai_model, DEFAULT_XAI_MODEL),
            analyzer_timeout_ms: raw
                .analyzer_timeout_ms
                .unwrap_or(DEFAULT_ANALYZER_TIMEOUT_MS),
            monthly_cap,
            monthly_safety_cutoff,
            min_request_interval_ms: raw
                .min_request_interval_ms
                .unwrap_or(DEFAULT_MIN_REQUEST_INTERVAL_MS),
            retry_max_attempts: raw
                .retry_max_attempts
                .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS)
                .max(1),
            backoff_base_ms: raw.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: raw.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
            retry_after_max_ms: raw.retry_after_max_ms.unwrap_or(DEFAULT_RETRY_AFTER_MAX_MS),
            call_timeout_ms: raw.call_timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
            analysis_timeout_ms: raw
                .analysis_timeout_ms
                .unwrap_or(DEFAULT_ANALYSIS_TIMEOUT_MS),
            max_replies: raw.max_replies.unwrap_or(DEFAULT_MAX_REPLIES),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    /// 启动前校验必填项。XAI_API_KEY 缺失时服务仍可启动，只是分析接口不可用。
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.x_bearer_token.is_empty() {
            return Err(crate::error::AppError::config(
                "缺少必需的环境变量: X_BEARER_TOKEN",
            ));
        }
        Ok(())
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

/// 逗号分隔的来源列表，空项忽略。
fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已由真实环境变量提供的键不覆盖。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let raw = line[eq_idx + 1..].trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
