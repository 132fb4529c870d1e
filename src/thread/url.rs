use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("链接为空")]
    Empty,

    #[error("无效的 X/Twitter 推文链接: {0}")]
    Invalid(String),
}

const ALLOWED_HOSTS: &[&str] = &["twitter.com", "x.com"];

/// 从推文链接中取出会话根推文 ID。
///
/// 接受 `http(s)://(www.|mobile.)?(twitter.com|x.com)/<user>/status/<digits>`（忽略 query 与 fragment），
/// 也接受直接传入的纯数字 ID。
pub fn extract_thread_id(input: &str) -> Result<String, UrlError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(UrlError::Empty);
    }
    if is_numeric_id(input) {
        return Ok(input.to_string());
    }

    let invalid = || UrlError::Invalid(input.to_string());

    let rest = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
        .ok_or_else(invalid)?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();

    let mut segments = rest.split('/');
    let host = segments.next().unwrap_or_default().to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("mobile."))
        .unwrap_or(&host);
    if !ALLOWED_HOSTS.contains(&host) {
        return Err(invalid());
    }

    let user = segments.next().unwrap_or_default();
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid());
    }

    if segments.next() != Some("status") {
        return Err(invalid());
    }

    match segments.next() {
        Some(id) if is_numeric_id(id) => Ok(id.to_string()),
        _ => Err(invalid()),
    }
}

fn is_numeric_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
