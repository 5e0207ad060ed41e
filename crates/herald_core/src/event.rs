//! The immutable event records that flow from pollers through the queue to
//! subscribers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{COMMENT_SUBTYPE, SourceType};

/// Who an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(uid: impl Into<String>, name: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewItem,
    AttributeChanged,
}

/// A post as published upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Original author, set on reposted content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost: Option<Box<Post>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    /// Post the comment was left on
    pub post_id: String,
    pub author: EntityRef,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDelta {
    pub attribute: String,
    pub previous: String,
    pub now: String,
    /// Extra fields subscribers need to act on the change (room id, title)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Post(Post),
    Comment(Comment),
    Change(AttributeDelta),
}

/// One detected change, addressed by `(source_type, subtype, user.uid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub subtype: Option<String>,
    pub user: EntityRef,
    pub kind: EventKind,
    pub created_time: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// A new post from the entity's main feed.
    pub fn new_post(source_type: SourceType, user: EntityRef, post: Post, created_time: i64) -> Self {
        Self {
            source_type,
            subtype: None,
            user,
            kind: EventKind::NewItem,
            created_time,
            payload: EventPayload::Post(post),
        }
    }

    /// A new comment on a post by the watched entity. `user` is the watched
    /// entity; the commenter is `comment.author`.
    pub fn new_comment(
        source_type: SourceType,
        user: EntityRef,
        comment: Comment,
        created_time: i64,
    ) -> Self {
        Self {
            source_type,
            subtype: Some(COMMENT_SUBTYPE.to_string()),
            user,
            kind: EventKind::NewItem,
            created_time,
            payload: EventPayload::Comment(comment),
        }
    }

    pub fn attribute_changed(
        source_type: SourceType,
        user: EntityRef,
        delta: AttributeDelta,
        created_time: i64,
    ) -> Self {
        Self {
            source_type,
            subtype: Some(delta.attribute.clone()),
            user,
            kind: EventKind::AttributeChanged,
            created_time,
            payload: EventPayload::Change(delta),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.user.uid
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::CoreError::serialization("Event", e))
    }
}
