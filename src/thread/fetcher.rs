use crate::ratelimit::{ApiRequest, ApiResponse, CallError, Deadline, RateLimitedClient};
use crate::thread::types::{
    PublicMetrics, ReferencedTweet, ThreadPayload, Tweet, UNKNOWN_USERNAME, User,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

const TWEET_EXPANSIONS: &str = "author_id,referenced_tweets.id,referenced_tweets.id.author_id";
const SEARCH_EXPANSIONS: &str = "author_id,referenced_tweets.id";
const TWEET_FIELDS: &str =
    "created_at,author_id,public_metrics,context_annotations,conversation_id,referenced_tweets";
const USER_FIELDS: &str = "username,name,profile_image_url,verified,public_metrics";

/// recent search 接口接受的 `max_results` 范围。
const MIN_RESULTS: u32 = 10;
const MAX_RESULTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    FetchingRoot,
    FetchingReplies,
    Assembled,
    Failed,
}

#[derive(Debug, Deserialize)]
struct RawTweet {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    author_id: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    data: Option<RawTweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    data: Option<Vec<RawTweet>>,
    #[serde(default)]
    includes: Includes,
}

/// 会话抓取：根推文一次调用，回复搜索一次调用；任一步失败都不产出部分结果。
#[derive(Debug, Clone)]
pub struct ThreadFetcher {
    client: Arc<RateLimitedClient>,
    max_replies: u32,
}

impl ThreadFetcher {
    pub fn new(client: Arc<RateLimitedClient>, max_replies: u32) -> Self {
        Self {
            client,
            max_replies: max_replies.clamp(MIN_RESULTS, MAX_RESULTS),
        }
    }

    pub fn client(&self) -> &Arc<RateLimitedClient> {
        &self.client
    }

    pub async fn fetch_thread(
        &self,
        root_id: &str,
        deadline: Deadline,
    ) -> Result<ThreadPayload, CallError> {
        let mut progress = Progress::new(root_id);

        progress.advance(FetchState::FetchingRoot);
        let (root, mut users) = match self.fetch_root(root_id, deadline).await {
            Ok(v) => v,
            Err(e) => return Err(progress.fail(e)),
        };

        progress.advance(FetchState::FetchingReplies);
        let conversation_id = root
            .conversation_id
            .clone()
            .unwrap_or_else(|| root.id.clone());
        let (replies, reply_users) = match self.fetch_replies(&conversation_id, deadline).await {
            Ok(v) => v,
            Err(e) => return Err(progress.fail(e)),
        };
        users.extend(reply_users);

        let root_item = to_tweet(root, &users);
        let related_items = replies
            .into_iter()
            .filter(|t| t.id != root_item.id)
            .map(|t| to_tweet(t, &users))
            .collect::<Vec<_>>();

        let payload = ThreadPayload::assemble(root_id.to_string(), root_item, related_items, users);
        progress.advance(FetchState::Assembled);
        tracing::info!(
            thread_id = %payload.thread_id,
            root_author = %payload.root_item.author_username,
            related_items = payload.related_items.len(),
            unique_authors = payload.unique_author_count,
            "会话抓取完成"
        );
        Ok(payload)
    }

    async fn fetch_root(
        &self,
        root_id: &str,
        deadline: Deadline,
    ) -> Result<(RawTweet, HashMap<String, User>), CallError> {
        let req = ApiRequest::get(format!("tweets/{root_id}"))
            .query("expansions", TWEET_EXPANSIONS)
            .query("tweet.fields", TWEET_FIELDS)
            .query("user.fields", USER_FIELDS);
        let resp = self.client.execute(&req, deadline).await?;
        let body: LookupBody = decode(&resp, "推文详情")?;

        let Some(root) = body.data else {
            // 200 但没有 data：接口把“不存在/无权限”放在 errors 里。
            let message = body
                .errors
                .first()
                .map(|e| {
                    if e.detail.is_empty() {
                        e.title.clone()
                    } else {
                        e.detail.clone()
                    }
                })
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("推文 {root_id} 不存在"));
            return Err(CallError::PermanentError {
                status: 404,
                message,
            });
        };

        Ok((root, index_users(body.includes.users)))
    }

    async fn fetch_replies(
        &self,
        conversation_id: &str,
        deadline: Deadline,
    ) -> Result<(Vec<RawTweet>, HashMap<String, User>), CallError> {
        let req = ApiRequest::get("tweets/search/recent")
            .query("query", format!("conversation_id:{conversation_id}"))
            .query("max_results", self.max_replies.to_string())
            .query("expansions", SEARCH_EXPANSIONS)
            .query("tweet.fields", TWEET_FIELDS)
            .query("user.fields", USER_FIELDS);
        let resp = self.client.execute(&req, deadline).await?;
        let body: SearchBody = decode(&resp, "回复搜索")?;

        Ok((
            body.data.unwrap_or_default(),
            index_users(body.includes.users),
        ))
    }
}

/// 记录抓取状态机的迁移。
struct Progress<'a> {
    thread_id: &'a str,
    state: FetchState,
}

impl<'a> Progress<'a> {
    fn new(thread_id: &'a str) -> Self {
        Self {
            thread_id,
            state: FetchState::Idle,
        }
    }

    fn advance(&mut self, next: FetchState) {
        tracing::debug!(
            thread_id = self.thread_id,
            from = ?self.state,
            to = ?next,
            "抓取状态迁移"
        );
        self.state = next;
    }

    fn fail(&mut self, err: CallError) -> CallError {
        tracing::warn!(
            thread_id = self.thread_id,
            stage = ?self.state,
            outcome = err.kind().as_str(),
            error = %err,
            "会话抓取失败"
        );
        self.state = FetchState::Failed;
        err
    }
}

fn decode<T: DeserializeOwned>(resp: &ApiResponse, what: &str) -> Result<T, CallError> {
    sonic_rs::from_slice(&resp.body)
        .map_err(|e| CallError::InvalidResponse(format!("{what}: {e}")))
}

fn index_users(users: Vec<User>) -> HashMap<String, User> {
    users.into_iter().map(|u| (u.id.clone(), u)).collect()
}

fn to_tweet(raw: RawTweet, users: &HashMap<String, User>) -> Tweet {
    let author = users.get(&raw.author_id);
    Tweet {
        author_username: author
            .map(|u| u.username.clone())
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string()),
        author_name: author.map(|u| u.name.clone()).filter(|n| !n.is_empty()),
        id: raw.id,
        text: raw.text,
        author_id: raw.author_id,
        created_at: raw.created_at,
        conversation_id: raw.conversation_id,
        public_metrics: raw.public_metrics,
        referenced_tweets: raw.referenced_tweets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ClientSettings;
    use crate::ratelimit::transport::testing::{ScriptedTransport, reply, reply_json};
    use std::time::Duration;

    const ROOT_BODY: &str = r#"{
        "data": {"id": "100", "text": "root take", "author_id": "u1", "conversation_id": "100"},
        "includes": {"users": [{"id": "u1", "username": "alice", "name": "Alice"}]}
    }"#;

    const REPLIES_BODY: &str = r#"{
        "data": [
            {"id": "101", "text": "disagree", "author_id": "u2",
             "referenced_tweets": [{"type": "replied_to", "id": "100"}]},
            {"id": "102", "text": "agree", "author_id": "u3"},
            {"id": "103", "text": "more context", "author_id": "u1"},
            {"id": "104", "text": "nobody knows me", "author_id": "u9"}
        ],
        "includes": {"users": [
            {"id": "u2", "username": "bob", "name": "Bob"},
            {"id": "u3", "username": "carol", "name": "Carol"}
        ]},
        "meta": {"result_count": 4}
    }"#;

    fn fetcher_with(transport: Arc<ScriptedTransport>) -> ThreadFetcher {
        let client = RateLimitedClient::new(transport, ClientSettings::default());
        ThreadFetcher::new(Arc::new(client), 100)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(180))
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_assembles_root_and_replies_in_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(reply_json(200, &[], ROOT_BODY)),
            Ok(reply_json(200, &[], REPLIES_BODY)),
        ]));
        let fetcher = fetcher_with(transport.clone());

        let payload = fetcher.fetch_thread("100", deadline()).await.unwrap();
        assert_eq!(payload.thread_id, "100");
        assert_eq!(payload.root_item.author_username, "alice");
        let ids: Vec<_> = payload.related_items.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["101", "102", "103", "104"]);
        assert_eq!(payload.related_items[3].author_username, UNKNOWN_USERNAME);
        assert_eq!(payload.unique_author_count, 4);
        assert_eq!(payload.users.len(), 3);

        assert_eq!(transport.calls(), 2);
        assert_eq!(fetcher.client().current_usage().monthly_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_carry_expected_parameters() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(reply_json(200, &[], ROOT_BODY)),
            Ok(reply_json(200, &[], REPLIES_BODY)),
        ]));
        let client = RateLimitedClient::new(transport.clone(), ClientSettings::default());
        let fetcher = ThreadFetcher::new(Arc::new(client), 25);
        fetcher.fetch_thread("100", deadline()).await.unwrap();

        let reqs = transport.requests();
        assert_eq!(reqs[0].path, "tweets/100");
        assert!(
            reqs[0]
                .query
                .contains(&("expansions".to_string(), TWEET_EXPANSIONS.to_string()))
        );
        assert_eq!(reqs[1].path, "tweets/search/recent");
        assert!(
            reqs[1]
                .query
                .contains(&("query".to_string(), "conversation_id:100".to_string()))
        );
        assert!(
            reqs[1]
                .query
                .contains(&("max_results".to_string(), "25".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replies_without_data_mean_zero_replies() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(reply_json(200, &[], ROOT_BODY)),
            Ok(reply_json(200, &[], r#"{"meta": {"result_count": 0}}"#)),
        ]));
        let fetcher = fetcher_with(transport);

        let payload = fetcher.fetch_thread("100", deadline()).await.unwrap();
        assert!(payload.related_items.is_empty());
        assert_eq!(payload.unique_author_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_root_stops_before_reply_search() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(reply(404, &[]))]));
        let fetcher = fetcher_with(transport.clone());

        let err = fetcher.fetch_thread("100", deadline()).await.unwrap_err();
        assert!(matches!(err, CallError::PermanentError { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn root_without_data_is_not_found() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(reply_json(
            200,
            &[],
            r#"{"errors": [{"title": "Not Found Error", "detail": "Could not find tweet with id: [100]."}]}"#,
        ))]));
        let fetcher = fetcher_with(transport.clone());

        let err = fetcher.fetch_thread("100", deadline()).await.unwrap_err();
        match err {
            CallError::PermanentError { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("Could not find tweet"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_search_yields_no_partial_thread() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(reply_json(200, &[], ROOT_BODY)),
            Ok(reply(500, &[])),
            Ok(reply(502, &[])),
            Ok(reply(503, &[])),
        ]));
        let fetcher = fetcher_with(transport.clone());

        let err = fetcher.fetch_thread("100", deadline()).await.unwrap_err();
        assert!(matches!(err, CallError::TransientError { attempts: 3, .. }));
        assert_eq!(transport.calls(), 4);
        // 根推文那次调用已经成功，计数保留。
        assert_eq!(fetcher.client().current_usage().monthly_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_body_is_invalid_response() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(reply_json(
            200,
            &[],
            "<html>oops</html>",
        ))]));
        let fetcher = fetcher_with(transport);

        let err = fetcher.fetch_thread("100", deadline()).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidResponse(_)));
        assert_eq!(fetcher.client().current_usage().monthly_count, 1);
    }

    #[tokio::test]
    async fn max_replies_is_clamped_to_search_range() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = Arc::new(RateLimitedClient::new(transport, ClientSettings::default()));
        assert_eq!(ThreadFetcher::new(client.clone(), 3).max_replies, 10);
        assert_eq!(ThreadFetcher::new(client, 500).max_replies, 100);
    }
}
