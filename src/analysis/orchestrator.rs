use crate::analysis::analyzer::{AnalyzeError, Analyzer, build_prompt};
use crate::analysis::types::{AnalysisMetadata, AnalysisReport};
use crate::ratelimit::{CallError, Deadline};
use crate::thread::ThreadFetcher;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// 分析至少需要根推文 + 一条回复。
pub const MIN_ITEMS: usize = 2;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Fetch(#[from] CallError),

    #[error("会话内容不足（共 {items} 条），无法分析")]
    InsufficientContent { items: usize },

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error("分析超过截止时间")]
    Timeout,
}

pub struct AnalysisOrchestrator {
    fetcher: ThreadFetcher,
    analyzer: Arc<dyn Analyzer>,
    timeout: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(fetcher: ThreadFetcher, analyzer: Arc<dyn Analyzer>, timeout: Duration) -> Self {
        Self {
            fetcher,
            analyzer,
            timeout,
        }
    }

    /// 抓取 + 分析共用一个截止时间。
    pub async fn analyze_thread(&self, thread_id: &str) -> Result<AnalysisReport, AnalysisError> {
        let started = Instant::now();
        let deadline = Deadline::after(self.timeout);

        let payload = self.fetcher.fetch_thread(thread_id, deadline).await?;
        let total_items = payload.total_items();
        if total_items < MIN_ITEMS {
            tracing::warn!(thread_id, total_items, "会话内容不足，跳过分析");
            return Err(AnalysisError::InsufficientContent { items: total_items });
        }

        let prompt = build_prompt(&payload);
        tracing::info!(
            thread_id,
            total_items,
            prompt_chars = prompt.chars().count(),
            "开始共识分析"
        );
        let consensus =
            match tokio::time::timeout_at(deadline.instant(), self.analyzer.analyze(&prompt)).await
            {
                Ok(res) => res?,
                Err(_) => {
                    tracing::warn!(thread_id, "共识分析超过截止时间");
                    return Err(AnalysisError::Timeout);
                }
            };

        let categories = payload.categories();
        let metadata = AnalysisMetadata {
            thread_id: payload.thread_id.clone(),
            total_items,
            unique_authors: payload.unique_author_count,
            author_chain_items: categories.author_chain.len(),
            quote_tweets: categories.quote_tweets.len(),
            replies: categories.replies.len(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            usage: self.fetcher.client().current_usage(),
        };
        tracing::info!(
            thread_id,
            processing_time_ms = metadata.processing_time_ms,
            consensus_points = consensus.consensus.len(),
            confidence = consensus.confidence_score,
            "共识分析完成"
        );

        Ok(AnalysisReport {
            consensus,
            metadata,
        })
    }
}
