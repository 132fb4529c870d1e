use crate::ratelimit::UsageSnapshot;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewpointSide {
    pub title: String,
    #[serde(default)]
    pub points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusResult {
    #[serde(rename = "sideA")]
    pub side_a: ViewpointSide,
    #[serde(rename = "sideB")]
    pub side_b: ViewpointSide,
    pub consensus: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisMetadata {
    pub thread_id: String,
    pub total_items: usize,
    pub unique_authors: usize,
    pub author_chain_items: usize,
    pub quote_tweets: usize,
    pub replies: usize,
    pub processing_time_ms: u64,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    #[serde(flatten)]
    pub consensus: ConsensusResult,
    pub metadata: AnalysisMetadata,
}
