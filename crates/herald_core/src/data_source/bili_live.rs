//! Bilibili live room status.
//!
//! The feed endpoint answers with the room of every requested uid in one
//! call. There are no posts: each room becomes an attribute observation of
//! `status` and `title`, so going live or renaming the stream shows up as an
//! attribute change.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::info;

use super::http::{int_at, read_json, request_failed, text_at};
use super::{Candidate, FeedBatch, FetchOutcome, Observation, SourceAdapter};
use crate::error::{FetchError, MalformedItem};
use crate::id::SourceType;
use crate::watch::Attributes;

const STATUS_URL: &str = "https://api.live.bilibili.com/room/v1/Room/get_status_info_by_uids";

#[derive(Debug, Clone)]
pub struct BiliLiveAdapter {
    client: reqwest::Client,
}

impl BiliLiveAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceAdapter for BiliLiveAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::BiliLive
    }

    async fn fetch_feed(&self, entity_ids: &[String]) -> FetchOutcome<FeedBatch> {
        let uids: Vec<i64> = entity_ids.iter().filter_map(|id| id.parse().ok()).collect();
        let response = match self
            .client
            .post(STATUS_URL)
            .json(&json!({ "uids": uids }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Fail(request_failed(SourceType::BiliLive, e)),
        };

        match read_json(SourceType::BiliLive, response).await {
            Ok(body) => parse_status_response(&body, entity_ids).into(),
            Err(e) => FetchOutcome::Fail(e),
        }
    }
}

/// Turns the room status response into one observation per requested uid.
pub(crate) fn parse_status_response(
    body: &Value,
    entity_ids: &[String],
) -> Result<Option<FeedBatch>, FetchError> {
    let code = int_at(body, "/code").unwrap_or(-1);
    if code != 0 {
        return Err(FetchError::malformed(
            SourceType::BiliLive,
            format!(
                "status request returned code {}: {}",
                code,
                text_at(body, "/message").unwrap_or_default()
            ),
        ));
    }

    let Some(rooms) = body.get("data").and_then(Value::as_object) else {
        // An empty result comes back as `"data": []`.
        return Ok(None);
    };

    let observations: Vec<Candidate<Observation>> = entity_ids
        .iter()
        .filter_map(|uid| match rooms.get(uid) {
            Some(room) => Some(parse_room(uid, room)),
            None => {
                info!("bili_live: uid {} has no live room", uid);
                None
            }
        })
        .collect();

    if observations.is_empty() {
        return Ok(None);
    }
    Ok(Some(FeedBatch {
        items: Vec::new(),
        observations,
    }))
}

fn parse_room(uid: &str, room: &Value) -> Candidate<Observation> {
    let missing = |field: &str| MalformedItem::new(SourceType::BiliLive, format!("room of {} has no {}", uid, field));

    let status = text_at(room, "/live_status").ok_or_else(|| missing("live_status"))?;
    let title = text_at(room, "/title").ok_or_else(|| missing("title"))?;
    let room_id = text_at(room, "/room_id").ok_or_else(|| missing("room_id"))?;
    let name = text_at(room, "/uname").unwrap_or_default();

    let attributes = Attributes::from([
        ("status".to_string(), status),
        ("title".to_string(), title.clone()),
    ]);
    let context = BTreeMap::from([
        ("room_id".to_string(), room_id),
        ("name".to_string(), name),
        ("title".to_string(), title),
    ]);
    Ok(Observation {
        entity_id: uid.to_string(),
        attributes,
        context,
    })
}
