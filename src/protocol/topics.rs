//! Topic filter validation, wildcard matching and device topic construction
//!
//! Topics are slash-delimited hierarchies. Subscription filters may use `+`
//! (exactly one level) and `#` (zero or more trailing levels); publish topics
//! never carry wildcards.

use crate::error::{InvalidTopicFilter, PublishError};
use thiserror::Error;

pub const LEVEL_SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Longest topic the MQTT wire format can carry
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

pub fn validate_topic_filter(filter: &str) -> Result<(), InvalidTopicFilter> {
    if filter.is_empty() {
        return Err(InvalidTopicFilter::new(filter, "filter cannot be empty"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(InvalidTopicFilter::new(filter, "filter exceeds 65535 bytes"));
    }
    if filter.contains('\0') {
        return Err(InvalidTopicFilter::new(filter, "filter contains NUL"));
    }

    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != MULTI_LEVEL_WILDCARD {
                return Err(InvalidTopicFilter::new(
                    filter,
                    "'#' must occupy an entire level",
                ));
            }
            if levels.peek().is_some() {
                return Err(InvalidTopicFilter::new(filter, "'#' must be the last level"));
            }
        }
        if level.contains('+') && level != SINGLE_LEVEL_WILDCARD {
            return Err(InvalidTopicFilter::new(
                filter,
                "'+' must occupy an entire level",
            ));
        }
    }

    Ok(())
}

pub fn validate_publish_topic(topic: &str) -> Result<(), PublishError> {
    let reason = if topic.is_empty() {
        "topic cannot be empty"
    } else if topic.len() > MAX_TOPIC_LEN {
        "topic exceeds 65535 bytes"
    } else if topic.contains(['+', '#']) {
        "wildcards are not allowed in publish topics"
    } else if topic.contains('\0') {
        "topic contains NUL"
    } else {
        return Ok(());
    };

    Err(PublishError::InvalidTopic {
        topic: topic.to_string(),
        reason,
    })
}

/// Match a concrete topic against a (valid) subscription filter
///
/// Filters starting with a wildcard never match `$`-prefixed system topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

/// Device topic namespace
pub struct TopicBuilder;

impl TopicBuilder {
    /// Commands to a device: `device/{id}/cmd`
    pub fn command_topic(device_id: &str) -> String {
        format!("device/{device_id}/cmd")
    }

    /// Telemetry and presence from a device: `device/{id}/status`
    pub fn status_topic(device_id: &str) -> String {
        format!("device/{device_id}/status")
    }

    /// Command acknowledgments from a device: `device/{id}/ack`
    pub fn ack_topic(device_id: &str) -> String {
        format!("device/{device_id}/ack")
    }

    /// Content pushed to a device: `device/{id}/content`
    pub fn content_topic(device_id: &str) -> String {
        format!("device/{device_id}/content")
    }

    /// Devices report the result of a content push here
    pub fn content_response_topic() -> &'static str {
        "device/content_response"
    }

    pub fn register_topic() -> &'static str {
        "device/register"
    }

    pub fn heartbeat_topic() -> &'static str {
        "device/heartbeat"
    }

    pub fn broadcast_topic() -> &'static str {
        "broadcast/all"
    }

    /// Every status topic in the namespace
    pub fn all_status_filter() -> &'static str {
        "device/+/status"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_matching_examples() {
        assert!(topic_matches("device/+/status", "device/abc/status"));
        assert!(!topic_matches("device/+/status", "device/abc/ack"));
        assert!(!topic_matches("device/+/status", "device/abc/status/extra"));
        assert!(topic_matches("device/#", "device/abc/status"));
        assert!(topic_matches("device/#", "device"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("+/+", "/leading"));
        assert!(!topic_matches("+", "a/b"));
        assert!(topic_matches("device/abc/status", "device/abc/status"));
        assert!(!topic_matches("device/abc/status", "device/abd/status"));
    }

    #[test]
    fn test_system_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/load"));
        assert!(!topic_matches("+/broker/load", "$SYS/broker/load"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/load"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_topic_filter("device/+/status").is_ok());
        assert!(validate_topic_filter("device/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("a//b").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/b").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+/c").is_err());
        assert!(validate_topic_filter("a\0b").is_err());

        let error = validate_topic_filter("a/#/b").unwrap_err();
        assert_eq!(error.filter, "a/#/b");
        assert_eq!(error.reason, "'#' must be the last level");
    }

    #[test]
    fn test_publish_topic_validation() {
        assert!(validate_publish_topic("device/abc/cmd").is_ok());

        for topic in ["", "device/+/cmd", "device/#", "a\0b"] {
            assert!(
                matches!(
                    validate_publish_topic(topic),
                    Err(PublishError::InvalidTopic { .. })
                ),
                "{topic:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_topic_construction() {
        assert_eq!(TopicBuilder::command_topic("abc"), "device/abc/cmd");
        assert_eq!(TopicBuilder::status_topic("abc"), "device/abc/status");
        assert_eq!(TopicBuilder::ack_topic("abc"), "device/abc/ack");
        assert_eq!(TopicBuilder::content_topic("abc"), "device/abc/content");
        assert_eq!(
            TopicBuilder::content_response_topic(),
            "device/content_response"
        );
        // Not caught by the per-device filters
        assert!(!topic_matches(
            TopicBuilder::all_status_filter(),
            TopicBuilder::content_response_topic()
        ));
        assert!(topic_matches(
            TopicBuilder::all_status_filter(),
            &TopicBuilder::status_topic("abc")
        ));
    }

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("frame-01").is_ok());
        assert!(validate_device_id("kiosk_2.lobby").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("frame/01"),
            Err(ValidationError::InvalidDeviceIdChar('/'))
        );
        assert_eq!(
            validate_device_id("frame+"),
            Err(ValidationError::InvalidDeviceIdChar('+'))
        );
    }

    #[derive(Debug, Clone)]
    enum Level {
        Literal(String),
        Single,
    }

    fn filter_levels() -> impl Strategy<Value = (Vec<Level>, bool)> {
        let level = prop_oneof![
            3 => "[a-z0-9]{1,6}".prop_map(Level::Literal),
            1 => Just(Level::Single),
        ];
        (prop::collection::vec(level, 1..6), any::<bool>())
    }

    fn render_filter(levels: &[Level], trailing_hash: bool) -> String {
        let mut parts: Vec<String> = levels
            .iter()
            .map(|level| match level {
                Level::Literal(s) => s.clone(),
                Level::Single => "+".to_string(),
            })
            .collect();
        if trailing_hash {
            parts.push("#".to_string());
        }
        parts.join("/")
    }

    proptest! {
        #[test]
        fn generated_filters_are_valid((levels, hash) in filter_levels()) {
            let filter = render_filter(&levels, hash);
            prop_assert!(validate_topic_filter(&filter).is_ok(), "{}", filter);
        }

        #[test]
        fn topic_built_from_filter_matches(
            (levels, hash) in filter_levels(),
            fill in "[a-z0-9]{1,6}",
            extra in prop::collection::vec("[a-z0-9]{1,6}", 0..3),
        ) {
            let filter = render_filter(&levels, hash);
            let mut topic: Vec<String> = levels
                .iter()
                .map(|level| match level {
                    Level::Literal(s) => s.clone(),
                    Level::Single => fill.clone(),
                })
                .collect();
            if hash {
                topic.extend(extra);
            }
            let topic = topic.join("/");
            prop_assert!(topic_matches(&filter, &topic), "{} should match {}", filter, topic);
        }

        #[test]
        fn changed_literal_level_never_matches(
            (levels, hash) in filter_levels(),
            fill in "[a-z0-9]{1,6}",
        ) {
            let filter = render_filter(&levels, hash);
            let literal_index = levels.iter().position(|l| matches!(l, Level::Literal(_)));
            prop_assume!(literal_index.is_some());
            let literal_index = literal_index.unwrap();

            let topic: Vec<String> = levels
                .iter()
                .enumerate()
                .map(|(i, level)| match level {
                    Level::Literal(s) if i == literal_index => format!("{s}X"),
                    Level::Literal(s) => s.clone(),
                    Level::Single => fill.clone(),
                })
                .collect();
            let topic = topic.join("/");
            prop_assert!(!topic_matches(&filter, &topic), "{} should not match {}", filter, topic);
        }

        #[test]
        fn extra_levels_need_multi_level_wildcard(
            (levels, _) in filter_levels(),
            fill in "[a-z0-9]{1,6}",
        ) {
            let filter = render_filter(&levels, false);
            let mut topic: Vec<String> = levels
                .iter()
                .map(|level| match level {
                    Level::Literal(s) => s.clone(),
                    Level::Single => fill.clone(),
                })
                .collect();
            topic.push(fill.clone());
            let topic = topic.join("/");
            prop_assert!(!topic_matches(&filter, &topic));
            let deeper = format!("{}/#", filter);
            prop_assert!(topic_matches(&deeper, &topic));
        }

        #[test]
        fn literal_filter_matches_only_itself(topic in "[a-z0-9]{1,6}(/[a-z0-9]{1,6}){0,4}", other in "[a-z0-9]{1,6}(/[a-z0-9]{1,6}){0,4}") {
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert_eq!(topic_matches(&topic, &other), topic == other);
        }
    }
}
