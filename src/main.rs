pub mod analysis;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod ratelimit;
pub mod thread;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    cfg.validate().context("配置校验失败")?;
    if cfg.xai_api_key.is_empty() {
        tracing::warn!("未配置 XAI_API_KEY，/api/analyze-thread 将不可用");
    }

    let transport = Arc::new(
        ratelimit::ReqwestTransport::new(&cfg).context("初始化 X API 客户端失败")?,
    );
    let settings = ratelimit::ClientSettings::from_config(&cfg);
    tracing::info!(
        monthly_cap = settings.monthly_cap,
        safety_cutoff = settings.monthly_safety_cutoff,
        min_interval_ms = settings.min_request_interval.as_millis() as u64,
        max_attempts = settings.max_attempts,
        "限流客户端已就绪"
    );
    let client = Arc::new(ratelimit::RateLimitedClient::new(transport, settings));

    let fetcher = thread::ThreadFetcher::new(client.clone(), cfg.max_replies);
    let analyzer =
        Arc::new(analysis::GrokAnalyzer::new(&cfg).context("初始化分析服务客户端失败")?);
    let orchestrator = analysis::AnalysisOrchestrator::new(
        fetcher.clone(),
        analyzer,
        Duration::from_millis(cfg.analysis_timeout_ms),
    );

    let state = Arc::new(gateway::AppState {
        client,
        fetcher,
        orchestrator,
        extract_timeout: Duration::from_millis(cfg.call_timeout_ms.saturating_mul(2)),
        log_level: cfg.log_level(),
    });

    tracing::info!(origins = ?cfg.cors_origins, "CORS 来源白名单");

    let app = Router::new()
        .route("/api/health", get(gateway::handle_health))
        .route("/health", get(gateway::handle_health))
        .route("/api/usage-stats", get(gateway::handle_usage_stats))
        .route("/api/extract-thread", post(gateway::handle_extract_thread))
        .route("/api/analyze-thread", post(gateway::handle_analyze_thread))
        .layer(gateway::cors_layer(&cfg.cors_origins))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG 只控制详细请求/响应块；DEBUG=silent 才关闭全部日志。
    // 默认把依赖库压到 warn，本项目至少 info，限流相关日志不应被预设的 RUST_LOG 过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "silent" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,threadpeace=info")
        } else if env.contains("threadpeace") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},threadpeace=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
