//! 共识分析：把抓取到的会话交给大模型，找出对立双方的共同点。

pub mod analyzer;
pub mod orchestrator;
pub mod types;

pub use analyzer::{AnalyzeError, GrokAnalyzer};
pub use orchestrator::{AnalysisError, AnalysisOrchestrator};
pub use types::AnalysisReport;
