//! Bilibili dynamics (the followed-users timeline).
//!
//! The feed is the logged-in account's timeline, so an entity has to be
//! followed before its dynamics show up. Profile fields (name, avatar,
//! signature) ride along on every card and are also refreshed in batches of
//! up to 45 users through the user-card endpoint.

use async_trait::async_trait;
use reqwest::header::{COOKIE, REFERER};
use serde_json::Value;
use tracing::{debug, info};

use super::http::{int_at, read_json, request_failed, text_at};
use super::{CadenceClass, Candidate, CommentItem, FeedBatch, FeedItem, FetchOutcome, Observation, SourceAdapter};
use crate::error::{FetchError, MalformedItem};
use crate::event::{Comment, EntityRef, Post};
use crate::id::SourceType;
use crate::utils::{link_to_https, parse_cookie};
use crate::watch::{Attributes, CommentWatch};

const FEED_URL: &str = "https://api.vc.bilibili.com/dynamic_svr/v1/dynamic_svr/dynamic_new?type_list=268435455";
const USER_CARDS_URL: &str = "https://api.vc.bilibili.com/account/v1/user/cards";
const SPACE_URL: &str = "https://api.bilibili.com/x/polymer/web-dynamic/v1/feed/space";
const REPLY_URL: &str = "https://api.bilibili.com/x/v2/reply/main";
const RELATION_URL: &str = "https://api.bilibili.com/x/relation/modify";

/// Users per user-card request.
const DETAIL_BATCH: usize = 45;

/// Relation codes meaning there is nothing left to do: following oneself,
/// and already following.
const FOLLOW_NOOP_CODES: [i64; 2] = [22001, 22014];

const SOURCE: SourceType = SourceType::BiliDyn;

#[derive(Debug, Clone)]
pub struct BiliDynAdapter {
    client: reqwest::Client,
    cookie: String,
    csrf: String,
    detail_enabled: bool,
    comment_enabled: bool,
}

impl BiliDynAdapter {
    pub fn new(client: reqwest::Client, cookie: &str) -> Self {
        let csrf = parse_cookie(cookie)
            .remove("bili_jct")
            .unwrap_or_default();
        Self {
            client,
            cookie: cookie.to_string(),
            csrf,
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

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header(COOKIE, &self.cookie)
            .header(REFERER, "https://t.bilibili.com/")
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        let body = read_json(SOURCE, response).await?;
        check_code(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl SourceAdapter for BiliDynAdapter {
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

    fn detail_batch_size(&self) -> usize {
        DETAIL_BATCH
    }

    async fn fetch_feed(&self, _entity_ids: &[String]) -> FetchOutcome<FeedBatch> {
        match self.get(FEED_URL, &[]).await {
            Ok(body) => FetchOutcome::from_option(parse_feed(&body)),
            Err(e) => FetchOutcome::Fail(e),
        }
    }

    async fn fetch_details(&self, entity_ids: &[String]) -> FetchOutcome<Vec<Candidate<Observation>>> {
        match self.get(USER_CARDS_URL, &[("uids", entity_ids.join(","))]).await {
            Ok(body) => FetchOutcome::from_option(parse_user_cards(&body)),
            Err(e) => FetchOutcome::Fail(e),
        }
    }

    async fn fetch_comments(&self, entity_id: &str, watch: &CommentWatch) -> FetchOutcome<Vec<Candidate<CommentItem>>> {
        let space = match self.get(SPACE_URL, &[("host_mid", entity_id.to_string())]).await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::Fail(e),
        };

        let mut comments = Vec::new();
        for target in comment_targets(&space, watch.include_pinned) {
            let query = [
                ("type", target.comment_type.clone()),
                ("oid", target.comment_id.clone()),
                ("mode", "2".to_string()),
            ];
            match self.get(REPLY_URL, &query).await {
                Ok(body) => comments.extend(parse_replies(&body, entity_id, &target.dynamic_id)),
                Err(e) => return FetchOutcome::Fail(e),
            }
        }
        FetchOutcome::from_option(Some(comments).filter(|c| !c.is_empty()))
    }

    async fn establish_watch(&self, entity_id: &str, subtype: Option<&str>) -> Result<(), FetchError> {
        if subtype.is_some() {
            // Subtypes ride on the base follow.
            return Ok(());
        }

        let form = [
            ("fid", entity_id.to_string()),
            ("act", "1".to_string()),
            ("re_src", "11".to_string()),
            ("csrf", self.csrf.clone()),
        ];
        let response = self
            .client
            .post(RELATION_URL)
            .header(COOKIE, &self.cookie)
            .form(&form)
            .send()
            .await
            .map_err(|e| request_failed(SOURCE, e))?;
        let body = read_json(SOURCE, response).await?;
        interpret_follow(&body, entity_id)
    }
}

fn check_code(body: &Value) -> Result<(), FetchError> {
    match int_at(body, "/code") {
        Some(0) => Ok(()),
        Some(-6) | Some(-101) => Err(FetchError::UpstreamAuthExpired { source_type: SOURCE }),
        Some(code) => Err(FetchError::malformed(
            SOURCE,
            format!("code {}: {}", code, text_at(body, "/message").unwrap_or_default()),
        )),
        None => Err(FetchError::malformed(SOURCE, "response has no code")),
    }
}

pub(crate) fn interpret_follow(body: &Value, entity_id: &str) -> Result<(), FetchError> {
    let code = int_at(body, "/code").unwrap_or(-1);
    if code == 0 {
        info!("bili_dyn: followed {}", entity_id);
        return Ok(());
    }
    if FOLLOW_NOOP_CODES.contains(&code) {
        info!("bili_dyn: {} needs no follow (code {})", entity_id, code);
        return Ok(());
    }
    if code == -101 {
        return Err(FetchError::UpstreamAuthExpired { source_type: SOURCE });
    }
    Err(FetchError::rejected(
        SOURCE,
        format!("follow returned code {}: {}", code, text_at(body, "/message").unwrap_or_default()),
    ))
}

pub(crate) fn parse_feed(body: &Value) -> Option<FeedBatch> {
    let cards = body.pointer("/data/cards")?.as_array()?;
    let items: Vec<Candidate<FeedItem>> = cards.iter().map(parse_card).collect();
    if items.is_empty() {
        return None;
    }
    Some(FeedBatch {
        items,
        observations: Vec::new(),
    })
}

fn parse_card(card: &Value) -> Candidate<FeedItem> {
    let malformed = |reason: &str| MalformedItem::new(SOURCE, reason.to_string());

    let uid = text_at(card, "/desc/uid").ok_or_else(|| malformed("card without uid"))?;
    let created_time = int_at(card, "/desc/timestamp").ok_or_else(|| malformed("card without timestamp"))?;
    let dynamic_id = text_at(card, "/desc/dynamic_id_str")
        .or_else(|| text_at(card, "/desc/dynamic_id"))
        .ok_or_else(|| malformed("card without dynamic id"))?;
    let kind = int_at(card, "/desc/type").unwrap_or_default();
    let name = text_at(card, "/desc/user_profile/info/uname");

    let content: Value = card
        .get("card")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .ok_or_else(|| malformed("card body is not JSON"))?;

    let mut post = parse_content(kind, &content);
    post.id = dynamic_id.clone();
    if post.link.is_none() {
        post.link = Some(format!("https://t.bilibili.com/{}", dynamic_id));
    }
    if kind == 8 {
        if let Some(bvid) = text_at(card, "/desc/bvid") {
            post.link = Some(format!("https://www.bilibili.com/video/{}", bvid));
        }
    }
    if let Some(repost) = post.repost.as_mut() {
        repost.created_time = int_at(card, "/desc/origin/timestamp");
        if repost.id.is_empty() {
            repost.id = text_at(card, "/desc/orig_dy_id_str").unwrap_or_default();
        }
    }

    let mut attributes = Attributes::new();
    if let Some(name) = &name {
        attributes.insert("name".to_string(), name.clone());
    }
    if let Some(avatar) = text_at(card, "/desc/user_profile/info/face") {
        attributes.insert("avatar".to_string(), link_to_https(&avatar));
    }
    if let Some(sign) = text_at(card, "/desc/user_profile/sign") {
        attributes.insert("desc".to_string(), sign);
    }

    Ok(FeedItem {
        user: EntityRef::new(uid, name),
        created_time,
        post,
        attributes,
        truncated: false,
    })
}

/// Maps the type-specific card body onto a post.
fn parse_content(kind: i64, content: &Value) -> Post {
    let text = |pointer: &str| text_at(content, pointer).unwrap_or_default();
    match kind {
        // Picture post
        2 => Post {
            text: text("/item/description"),
            pics: content
                .pointer("/item/pictures")
                .and_then(Value::as_array)
                .map(|pics| {
                    pics.iter()
                        .filter_map(|pic| text_at(pic, "/img_src"))
                        .map(|src| link_to_https(&src))
                        .collect()
                })
                .unwrap_or_default(),
            ..Post::default()
        },
        // Text-only post
        4 => Post {
            text: text("/item/content"),
            ..Post::default()
        },
        // Video
        8 => Post {
            text: text("/desc"),
            title: text_at(content, "/title"),
            pics: text_at(content, "/pic").map(|pic| link_to_https(&pic)).into_iter().collect(),
            ..Post::default()
        },
        // Article
        64 => Post {
            text: text("/summary"),
            title: text_at(content, "/title"),
            pics: text_at(content, "/image_urls/0").map(|pic| link_to_https(&pic)).into_iter().collect(),
            link: text_at(content, "/id").map(|cv| format!("https://www.bilibili.com/read/cv{}", cv)),
            ..Post::default()
        },
        // Repost
        1 => {
            let original_kind = int_at(content, "/item/orig_type").unwrap_or_default();
            let mut repost = content
                .get("origin")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .map(|origin| parse_content(original_kind, &origin))
                .unwrap_or_default();
            repost.author = Some(EntityRef::new(
                text_at(content, "/origin_user/info/uid").unwrap_or_default(),
                text_at(content, "/origin_user/info/uname"),
            ));
            Post {
                text: text("/item/content"),
                repost: Some(Box::new(repost)),
                ..Post::default()
            }
        }
        other => {
            debug!("bili_dyn: unhandled dynamic type {}", other);
            Post::default()
        }
    }
}

pub(crate) fn parse_user_cards(body: &Value) -> Option<Vec<Candidate<Observation>>> {
    let cards = body.get("data")?.as_array()?;
    let observations: Vec<_> = cards
        .iter()
        .map(|card| {
            let uid = text_at(card, "/mid").ok_or_else(|| MalformedItem::new(SOURCE, "user card without mid"))?;
            let mut attributes = Attributes::new();
            if let Some(name) = text_at(card, "/name") {
                attributes.insert("name".to_string(), name);
            }
            if let Some(face) = text_at(card, "/face") {
                attributes.insert("avatar".to_string(), link_to_https(&face));
            }
            if let Some(sign) = text_at(card, "/sign") {
                attributes.insert("desc".to_string(), sign);
            }
            Ok(Observation {
                entity_id: uid,
                attributes,
                context: Default::default(),
            })
        })
        .collect();
    (!observations.is_empty()).then_some(observations)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommentTarget {
    pub dynamic_id: String,
    pub comment_id: String,
    pub comment_type: String,
}

/// Picks the latest non-pinned dynamic, plus pinned ones when asked to.
pub(crate) fn comment_targets(space: &Value, include_pinned: bool) -> Vec<CommentTarget> {
    let Some(items) = space.pointer("/data/items").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut targets = Vec::new();
    let mut found_latest = false;
    for item in items {
        let pinned = text_at(item, "/modules/module_tag/text").is_some();
        if pinned && !include_pinned {
            continue;
        }
        if !pinned && found_latest {
            continue;
        }
        let (Some(dynamic_id), Some(comment_id), Some(comment_type)) = (
            text_at(item, "/id_str"),
            text_at(item, "/basic/comment_id_str"),
            text_at(item, "/basic/comment_type"),
        ) else {
            continue;
        };
        targets.push(CommentTarget {
            dynamic_id,
            comment_id,
            comment_type,
        });
        if !pinned {
            found_latest = true;
        }
        if found_latest && !include_pinned {
            break;
        }
    }
    targets
}

pub(crate) fn parse_replies(body: &Value, entity_id: &str, dynamic_id: &str) -> Vec<Candidate<CommentItem>> {
    let Some(replies) = body.pointer("/data/replies").and_then(Value::as_array) else {
        return Vec::new();
    };
    replies
        .iter()
        .map(|reply| {
            let malformed = |what: &str| MalformedItem::new(SOURCE, format!("reply without {}", what));
            let id = text_at(reply, "/rpid_str")
                .or_else(|| text_at(reply, "/rpid"))
                .ok_or_else(|| malformed("rpid"))?;
            let created_time = int_at(reply, "/ctime").ok_or_else(|| malformed("ctime"))?;
            Ok(CommentItem {
                entity_id: entity_id.to_string(),
                created_time,
                comment: Comment {
                    id,
                    post_id: dynamic_id.to_string(),
                    author: EntityRef::new(
                        text_at(reply, "/member/mid").unwrap_or_default(),
                        text_at(reply, "/member/uname"),
                    ),
                    text: text_at(reply, "/content/message").unwrap_or_default(),
                },
            })
        })
        .collect()
}
