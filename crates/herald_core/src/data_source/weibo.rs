//! Weibo, through the mobile web API.
//!
//! The friends timeline of the logged-in account is the feed, so entities
//! have to be followed first. Following needs the XSRF token the profile
//! page hands out as a cookie. Post bodies are HTML: links to images become
//! pictures, emoji images become their alt text, everything else is
//! flattened to plain text.

use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::header::{COOKIE, REFERER};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::http::{int_at, read_json, request_failed, text_at};
use super::{CadenceClass, Candidate, CommentItem, FeedBatch, FeedItem, FetchOutcome, Observation, SourceAdapter};
use crate::error::{FetchError, MalformedItem};
use crate::event::{Comment, EntityRef, Post};
use crate::id::SourceType;
use crate::utils::link_to_https;
use crate::watch::{Attributes, CommentWatch};

const FEED_URL: &str = "https://m.weibo.cn/feed/friends?";
const CONTAINER_URL: &str = "https://m.weibo.cn/api/container/getIndex";
const EXTEND_URL: &str = "https://m.weibo.cn/statuses/extend";
const HOTFLOW_URL: &str = "https://m.weibo.cn/comments/hotflow";
const FOLLOW_URL: &str = "https://m.weibo.cn/api/friendships/create";

/// errno for "already following".
const ALREADY_FOLLOWING: &str = "20504";

const SOURCE: SourceType = SourceType::Weibo;

/// Upstream date format, e.g. `Tue Jun 04 21:04:12 +0800 2024`.
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

static BR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b([^>]*)>(.*?)</a>"#).expect("valid anchor regex")
});
static HREF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)href="([^"]*)""#).expect("valid href regex"));
static IMG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)<img\b[^>]*>"#).expect("valid img regex"));
static ALT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)alt="([^"]*)""#).expect("valid alt regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));

#[derive(Debug, Clone)]
pub struct WeiboAdapter {
    client: reqwest::Client,
    cookie: String,
    detail_enabled: bool,
    comment_enabled: bool,
}

impl WeiboAdapter {
    pub fn new(client: reqwest::Client, cookie: &str) -> Self {
        Self {
            client,
            cookie: cookie.to_string(),
            detail_enabled: false,
            comment_enabled: false,
        }
    }

    pub fn with_details(mut self, enabled: bool) -> Self {
        self.detail_enabled = enabled;
        self
    }

    pub fn with_comments(mut self, enabled: bool) -> Self {
        self.comment_enabled = enabled;
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(COOKIE, &self.cookie)
            .header(REFERER, "https://m.weibo.cn/")
            .header("DNT", "1")
            .header("MWeibo-Pwa", "1")
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let response = self
            .request(self.client.get(url).query(query))
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        read_json(SOURCE, response).await
    }

    /// The friends feed sometimes answers with an HTML page that redirects
    /// to the real feed URL; follow it once.
    async fn get_feed(&self) -> Result<Value, FetchError> {
        let body = self
            .request(self.client.get(FEED_URL))
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?
            .text()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        if let Ok(value) = serde_json::from_str(&body) {
            return Ok(value);
        }

        let redirect = find_feed_redirect(&body)
            .ok_or_else(|| FetchError::malformed(SOURCE, "feed is neither JSON nor a redirect page"))?;
        debug!("weibo: following feed redirect to {}", redirect);
        self.get_json(&redirect, &[]).await
    }

    async fn xsrf_token(&self, entity_id: &str) -> Result<String, FetchError> {
        let response = self
            .request(self.client.get(format!("https://m.weibo.cn/profile/{}", entity_id)))
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        let token = xsrf_from_headers(response.headers());
        token.ok_or_else(|| FetchError::rejected(SOURCE, "profile page did not hand out an XSRF token"))
    }
}

/// Reads the `XSRF-TOKEN` cookie out of a response's `Set-Cookie` headers.
pub(crate) fn xsrf_from_headers(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next()?.split_once('='))
        .find(|(name, _)| name.trim() == "XSRF-TOKEN")
        .map(|(_, value)| value.trim().to_string())
}

#[async_trait]
impl SourceAdapter for WeiboAdapter {
    fn source_type(&self) -> SourceType {
        SOURCE
    }

    fn supports(&self, class: CadenceClass) -> bool {
        match class {
            CadenceClass::Feed => true,
            CadenceClass::Detail => self.detail_enabled,
            CadenceClass::Comment => self.comment_enabled,
        }
    }

    async fn fetch_feed(&self, _entity_ids: &[String]) -> FetchOutcome<FeedBatch> {
        match self.get_feed().await {
            Ok(body) => parse_feed(&body).into(),
            Err(e) => FetchOutcome::Fail(e),
        }
    }

    async fn expand(&self, item: &mut FeedItem) -> Result<(), FetchError> {
        let body = self.get_json(EXTEND_URL, &[("id", item.post.id.clone())]).await?;
        let html = text_at(&body, "/data/longTextContent")
            .ok_or_else(|| FetchError::malformed(SOURCE, "long text response has no content"))?;
        let (text, pics) = strip_html(&html);
        item.post.text = text;
        for pic in pics {
            if !item.post.pics.contains(&pic) {
                item.post.pics.push(pic);
            }
        }
        item.truncated = false;
        Ok(())
    }

    async fn fetch_details(&self, entity_ids: &[String]) -> FetchOutcome<Vec<Candidate<Observation>>> {
        let mut observations = Vec::new();
        for uid in entity_ids {
            let query = [
                ("type", "uid".to_string()),
                ("value", uid.clone()),
                ("containerid", format!("100505{}", uid)),
            ];
            match self.get_json(CONTAINER_URL, &query).await {
                Ok(body) => match parse_user_info(&body, uid) {
                    Ok(observation) => observations.extend(observation),
                    Err(e) => return FetchOutcome::Fail(e),
                },
                Err(e) => return FetchOutcome::Fail(e),
            }
        }
        FetchOutcome::from_option(Some(observations).filter(|o| !o.is_empty()))
    }

    async fn fetch_comments(&self, entity_id: &str, watch: &CommentWatch) -> FetchOutcome<Vec<Candidate<CommentItem>>> {
        let query = [
            ("type", "uid".to_string()),
            ("value", entity_id.to_string()),
            ("containerid", format!("107603{}", entity_id)),
        ];
        let timeline = match self.get_json(CONTAINER_URL, &query).await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::Fail(e),
        };

        let mut comments = Vec::new();
        for post_id in comment_targets(&timeline, watch.include_pinned) {
            let query = [
                ("id", post_id.clone()),
                ("mid", post_id.clone()),
                ("max_id_type", "0".to_string()),
            ];
            match self.get_json(HOTFLOW_URL, &query).await {
                Ok(body) => comments.extend(parse_comments(&body, entity_id, &post_id)),
                Err(e) => return FetchOutcome::Fail(e),
            }
        }
        FetchOutcome::from_option(Some(comments).filter(|c| !c.is_empty()))
    }

    async fn establish_watch(&self, entity_id: &str, subtype: Option<&str>) -> Result<(), FetchError> {
        if subtype.is_some() {
            return Ok(());
        }

        let token = self.xsrf_token(entity_id).await?;
        let query = [
            ("uid", entity_id.to_string()),
            ("st", token.clone()),
            ("_spr", "screen:412x915".to_string()),
        ];
        let response = self
            .client
            .post(FOLLOW_URL)
            .query(&query)
            .header(COOKIE, format!("{}; XSRF-TOKEN={}", self.cookie, token))
            .header(REFERER, format!("https://m.weibo.cn/profile/{}", entity_id))
            .header("x-xsrf-token", token)
            .header("x-requested-with", "XMLHttpRequest")
            .header("mweibo-pwa", "1")
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        let body = read_json(SOURCE, response).await?;
        interpret_follow(&body, entity_id)
    }
}

fn find_feed_redirect(html: &str) -> Option<String> {
    let start = html.find("https://m.weibo.cn/feed/friends")?;
    let rest = &html[start..];
    let end = rest.find('"').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn check_ok(body: &Value) -> Result<(), FetchError> {
    match int_at(body, "/ok") {
        Some(1) => Ok(()),
        Some(-100) => Err(FetchError::UpstreamAuthExpired { source_type: SOURCE }),
        other => Err(FetchError::malformed(
            SOURCE,
            format!(
                "ok={:?}: {}",
                other,
                text_at(body, "/msg").unwrap_or_default()
            ),
        )),
    }
}

pub(crate) fn interpret_follow(body: &Value, entity_id: &str) -> Result<(), FetchError> {
    if int_at(body, "/ok") == Some(1) {
        info!("weibo: followed {}", entity_id);
        return Ok(());
    }
    let errno = text_at(body, "/errno").unwrap_or_default();
    if errno == ALREADY_FOLLOWING {
        info!("weibo: {} is already followed", entity_id);
        return Ok(());
    }
    Err(FetchError::rejected(
        SOURCE,
        format!("follow returned errno {}: {}", errno, text_at(body, "/msg").unwrap_or_default()),
    ))
}

pub(crate) fn parse_created_at(raw: &str) -> Option<i64> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|time| time.timestamp())
}

/// Flattens a post body to text, returning the text and any picture links
/// found in anchors.
pub(crate) fn strip_html(html: &str) -> (String, Vec<String>) {
    let mut pics = Vec::new();

    let text = BR.replace_all(html, "\n");
    let text = ANCHOR.replace_all(&text, |caps: &regex::Captures| {
        let href = HREF
            .captures(&caps[1])
            .map(|href| href[1].to_string())
            .unwrap_or_default();
        let lower = href.to_ascii_lowercase();
        if [".jpg", ".jpeg", ".png", ".gif"].iter().any(|ext| lower.ends_with(ext)) {
            pics.push(link_to_https(&href));
            String::new()
        } else {
            caps[2].to_string()
        }
    });
    let text = IMG.replace_all(&text, |caps: &regex::Captures| {
        ALT.captures(&caps[0])
            .map(|alt| alt[1].to_string())
            .unwrap_or_default()
    });
    let text = TAG.replace_all(&text, "");

    let text = text
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");
    (text, pics)
}

fn collect_pics(status: &Value) -> Vec<String> {
    let mut pics: Vec<String> = status
        .get("pics")
        .and_then(Value::as_array)
        .map(|pics| {
            pics.iter()
                .filter_map(|pic| text_at(pic, "/large/url"))
                .map(|url| link_to_https(&url))
                .collect()
        })
        .unwrap_or_default();
    if text_at(status, "/page_info/type").as_deref() == Some("video") {
        if let Some(cover) = text_at(status, "/page_info/page_pic/url") {
            pics.push(link_to_https(&cover));
        }
    }
    pics
}

fn parse_post(status: &Value) -> Result<(Post, i64), String> {
    let id = text_at(status, "/id").ok_or("status without id")?;
    let created_at = text_at(status, "/created_at").ok_or("status without created_at")?;
    let created_time = parse_created_at(&created_at).ok_or_else(|| format!("unparsable created_at {:?}", created_at))?;

    let (text, link_pics) = strip_html(&text_at(status, "/text").unwrap_or_default());
    let mut pics = collect_pics(status);
    pics.extend(link_pics);

    Ok((
        Post {
            link: Some(format!("https://m.weibo.cn/detail/{}", id)),
            id,
            text,
            pics,
            ..Post::default()
        },
        created_time,
    ))
}

fn parse_status(status: &Value) -> Candidate<FeedItem> {
    let malformed = |reason: String| MalformedItem::new(SOURCE, reason);

    let uid = text_at(status, "/user/id").ok_or_else(|| malformed("status without user".to_string()))?;
    let name = text_at(status, "/user/screen_name");
    let (mut post, created_time) = parse_post(status).map_err(malformed)?;

    if let Some(original) = status.get("retweeted_status").filter(|s| s.get("id").is_some()) {
        match parse_post(original) {
            Ok((mut repost, repost_time)) => {
                repost.created_time = Some(repost_time);
                repost.author = Some(EntityRef::new(
                    text_at(original, "/user/id").unwrap_or_default(),
                    text_at(original, "/user/screen_name"),
                ));
                post.repost = Some(Box::new(repost));
            }
            Err(reason) => debug!("weibo: dropping unreadable retweet of {}: {}", post.id, reason),
        }
    }

    let mut attributes = Attributes::new();
    if let Some(name) = &name {
        attributes.insert("name".to_string(), name.clone());
    }
    if let Some(avatar) = text_at(status, "/user/avatar_hd") {
        attributes.insert("avatar".to_string(), link_to_https(&avatar));
    }
    if let Some(description) = text_at(status, "/user/description") {
        attributes.insert("desc".to_string(), description);
    }

    Ok(FeedItem {
        user: EntityRef::new(uid, name),
        created_time,
        post,
        attributes,
        truncated: status.get("isLongText").and_then(Value::as_bool).unwrap_or(false),
    })
}

pub(crate) fn parse_feed(body: &Value) -> Result<Option<FeedBatch>, FetchError> {
    check_ok(body)?;
    let statuses = body
        .pointer("/data/statuses")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::malformed(SOURCE, "feed has no statuses"))?;
    if statuses.is_empty() {
        return Ok(None);
    }
    Ok(Some(FeedBatch {
        items: statuses.iter().map(parse_status).collect(),
        observations: Vec::new(),
    }))
}

pub(crate) fn parse_user_info(body: &Value, uid: &str) -> Result<Option<Candidate<Observation>>, FetchError> {
    check_ok(body)?;
    let Some(info) = body.pointer("/data/userInfo") else {
        return Ok(Some(Err(MalformedItem::new(
            SOURCE,
            format!("profile of {} has no userInfo", uid),
        ))));
    };

    let mut attributes = Attributes::new();
    if let Some(name) = text_at(info, "/screen_name") {
        attributes.insert("name".to_string(), name);
    }
    if let Some(avatar) = text_at(info, "/avatar_hd") {
        attributes.insert("avatar".to_string(), link_to_https(&avatar));
    }
    if let Some(description) = text_at(info, "/description") {
        attributes.insert("desc".to_string(), description);
    }
    Ok(Some(Ok(Observation {
        entity_id: uid.to_string(),
        attributes,
        context: Default::default(),
    })))
}

/// Post ids to scan for comments: the newest non-pinned post, plus the
/// pinned one when asked to.
pub(crate) fn comment_targets(timeline: &Value, include_pinned: bool) -> Vec<String> {
    let Some(cards) = timeline.pointer("/data/cards").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut targets = Vec::new();
    let mut found_latest = false;
    for card in cards.iter().filter(|card| int_at(card, "/card_type") == Some(9)) {
        let Some(id) = text_at(card, "/mblog/id") else {
            continue;
        };
        let pinned = int_at(card, "/mblog/isTop") == Some(1);
        if pinned {
            if include_pinned {
                targets.push(id);
            }
        } else if !found_latest {
            targets.push(id);
            found_latest = true;
        }
    }
    targets
}

pub(crate) fn parse_comments(body: &Value, entity_id: &str, post_id: &str) -> Vec<Candidate<CommentItem>> {
    // A post without comments answers ok=0 and no data.
    if int_at(body, "/ok") != Some(1) {
        return Vec::new();
    }
    let Some(comments) = body.pointer("/data/data").and_then(Value::as_array) else {
        return Vec::new();
    };
    comments
        .iter()
        .map(|comment| {
            let malformed = |what: &str| MalformedItem::new(SOURCE, format!("comment without {}", what));
            let id = text_at(comment, "/id").ok_or_else(|| malformed("id"))?;
            let created_time = text_at(comment, "/created_at")
                .and_then(|raw| parse_created_at(&raw))
                .ok_or_else(|| malformed("readable created_at"))?;
            let (text, _) = strip_html(&text_at(comment, "/text").unwrap_or_default());
            Ok(CommentItem {
                entity_id: entity_id.to_string(),
                created_time,
                comment: Comment {
                    id,
                    post_id: post_id.to_string(),
                    author: EntityRef::new(
                        text_at(comment, "/user/id").unwrap_or_default(),
                        text_at(comment, "/user/screen_name"),
                    ),
                    text,
                },
            })
        })
        .collect()
}
