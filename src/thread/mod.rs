//! 会话抓取：链接解析、根推文 + 回复搜索两次受限调用、结果组装。

pub mod fetcher;
pub mod types;
pub mod url;

pub use fetcher::ThreadFetcher;
pub use types::ThreadPayload;
pub use url::{UrlError, extract_thread_id};
