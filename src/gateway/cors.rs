use axum::http::{HeaderValue, request::Parts};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// 按配置的来源列表放行跨域请求（允许携带凭据，方法与请求头按预检请求回显）。
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let patterns: Arc<[String]> = origins.into();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origin_allowed(&patterns, origin))
            },
        ))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// `*` 放行全部；`https://*.example.com` 只匹配其子域名。
fn origin_allowed(patterns: &[String], origin: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        match pattern.split_once("://*.") {
            Some((scheme, suffix)) => origin
                .strip_prefix(scheme)
                .and_then(|rest| rest.strip_prefix("://"))
                .and_then(|host| host.strip_suffix(suffix))
                .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
            None => pattern == origin,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_and_subdomain_origins() {
        let p = patterns(&["http://localhost:3000", "https://*.vercel.app"]);
        assert!(origin_allowed(&p, "http://localhost:3000"));
        assert!(!origin_allowed(&p, "http://localhost:3001"));
        assert!(origin_allowed(&p, "https://preview-1.vercel.app"));
        assert!(!origin_allowed(&p, "https://vercel.app"));
        assert!(!origin_allowed(&p, "https://evilvercel.app"));
        assert!(!origin_allowed(&p, "http://preview-1.vercel.app"));
    }

    #[test]
    fn wildcard_allows_everything() {
        assert!(origin_allowed(&patterns(&["*"]), "https://anything.example"));
        assert!(!origin_allowed(&[], "http://localhost:3000"));
    }
}
