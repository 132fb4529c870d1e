use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const UNKNOWN_USERNAME: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMetrics {
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedTweet {
    /// `replied_to` / `quoted` / `retweeted`
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_metrics: Option<PublicMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub referenced_tweets: Vec<ReferencedTweet>,
}

impl Tweet {
    fn references(&self, kind: &str) -> bool {
        self.referenced_tweets.iter().any(|r| r.kind == kind)
    }
}

/// 一次完整抓取的结果：根推文 + 按接口顺序排列的回复。组装后不再修改。
#[derive(Debug, Clone, Serialize)]
pub struct ThreadPayload {
    pub thread_id: String,
    pub root_item: Tweet,
    pub related_items: Vec<Tweet>,
    pub unique_author_count: usize,
    pub users: HashMap<String, User>,
}

/// 按原帖作者的视角给会话中的推文分组。
#[derive(Debug, Default, Serialize)]
pub struct ThreadCategories<'a> {
    /// 原帖作者本人发的（含根推文）
    pub author_chain: Vec<&'a Tweet>,
    pub quote_tweets: Vec<&'a Tweet>,
    pub replies: Vec<&'a Tweet>,
    pub other: Vec<&'a Tweet>,
}

impl ThreadPayload {
    pub fn assemble(
        thread_id: String,
        root_item: Tweet,
        related_items: Vec<Tweet>,
        users: HashMap<String, User>,
    ) -> Self {
        let unique_author_count = std::iter::once(&root_item)
            .chain(related_items.iter())
            .map(|t| t.author_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            thread_id,
            root_item,
            related_items,
            unique_author_count,
            users,
        }
    }

    pub fn total_items(&self) -> usize {
        1 + self.related_items.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &Tweet> {
        std::iter::once(&self.root_item).chain(self.related_items.iter())
    }

    pub fn categories(&self) -> ThreadCategories<'_> {
        let root_author = self.root_item.author_id.as_str();
        let mut out = ThreadCategories::default();
        for tweet in self.items() {
            if tweet.author_id == root_author {
                out.author_chain.push(tweet);
            } else if tweet.references("quoted") {
                out.quote_tweets.push(tweet);
            } else if tweet.references("replied_to") {
                out.replies.push(tweet);
            } else {
                out.other.push(tweet);
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn tweet(id: &str, author: &str, text: &str) -> Tweet {
    Tweet {
        id: id.to_string(),
        text: text.to_string(),
        author_id: author.to_string(),
        author_username: format!("user_{author}"),
        author_name: None,
        created_at: None,
        conversation_id: None,
        public_metrics: None,
        referenced_tweets: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_ref(mut t: Tweet, kind: &str) -> Tweet {
        t.referenced_tweets.push(ReferencedTweet {
            kind: kind.to_string(),
            id: "1".to_string(),
        });
        t
    }

    #[test]
    fn assemble_counts_unique_authors() {
        let payload = ThreadPayload::assemble(
            "1".to_string(),
            tweet("1", "a", "root"),
            vec![
                tweet("2", "b", "x"),
                tweet("3", "a", "y"),
                tweet("4", "c", "z"),
                tweet("5", "b", "w"),
            ],
            HashMap::new(),
        );
        assert_eq!(payload.unique_author_count, 3);
        assert_eq!(payload.total_items(), 5);
    }

    #[test]
    fn categories_follow_root_author_and_references() {
        let payload = ThreadPayload::assemble(
            "1".to_string(),
            tweet("1", "a", "root"),
            vec![
                with_ref(tweet("2", "a", "self reply"), "replied_to"),
                with_ref(tweet("3", "b", "quote"), "quoted"),
                with_ref(tweet("4", "c", "reply"), "replied_to"),
                tweet("5", "d", "plain"),
            ],
            HashMap::new(),
        );

        let c = payload.categories();
        let ids = |v: &[&Tweet]| v.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&c.author_chain), ["1", "2"]);
        assert_eq!(ids(&c.quote_tweets), ["3"]);
        assert_eq!(ids(&c.replies), ["4"]);
        assert_eq!(ids(&c.other), ["5"]);
    }
}
