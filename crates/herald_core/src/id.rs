//! Identifiers shared across the pipeline: upstream source types and entity ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Subtype used for comment watches on an entity's latest post.
pub const COMMENT_SUBTYPE: &str = "comment";

/// An upstream platform kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Weibo,
    BiliDyn,
    BiliLive,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Weibo, SourceType::BiliDyn, SourceType::BiliLive];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Weibo => "weibo",
            SourceType::BiliDyn => "bili_dyn",
            SourceType::BiliLive => "bili_live",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| CoreError::UnknownSourceType {
                name: s.to_string(),
            })
    }
}

/// Entity ids are the numeric user ids the upstream platforms hand out.
pub fn is_valid_entity_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// Normalises a requested subtype. Empty strings and a subtype equal to the
/// source type name both mean "base level".
pub fn normalize_subtype(source_type: SourceType, subtype: Option<&str>) -> Option<String> {
    match subtype.map(str::trim) {
        None | Some("") => None,
        Some(s) if s == source_type.as_str() => None,
        Some(s) => Some(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_names() {
        for source in SourceType::ALL {
            assert_eq!(source.as_str().parse::<SourceType>().unwrap(), source);
        }
        assert!("twitter".parse::<SourceType>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&SourceType::BiliDyn).unwrap();
        assert_eq!(json, "\"bili_dyn\"");
    }

    #[test]
    fn entity_ids_must_be_digits() {
        assert!(is_valid_entity_id("1234567"));
        assert!(!is_valid_entity_id(""));
        assert!(!is_valid_entity_id("12a4"));
        assert!(!is_valid_entity_id("-12"));
    }

    #[test]
    fn subtype_equal_to_type_is_base_level() {
        assert_eq!(normalize_subtype(SourceType::Weibo, Some("weibo")), None);
        assert_eq!(normalize_subtype(SourceType::Weibo, Some("")), None);
        assert_eq!(normalize_subtype(SourceType::Weibo, None), None);
        assert_eq!(
            normalize_subtype(SourceType::Weibo, Some("comment")),
            Some("comment".to_string())
        );
    }
}
