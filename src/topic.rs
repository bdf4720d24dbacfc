//! Topic names and topic filters.
//!
//! Matching walks the filter and the topic level by level in a single pass.
//! Topics starting with `$` are only matched by filters that also start with
//! `$`, so `#` and `+/...` never see broker system topics.

use crate::error::ArgumentError;

/// Longest filter the client subscribes to or routes.
pub const MAX_TOPIC_LEN: usize = 128;

/// Returns `true` if `topic` matches the subscription `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }
    if filter.starts_with('$') != topic.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `#` also matches the parent level: "sport/#" matches "sport".
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a topic name used for PUBLISH (and for the will message).
///
/// Only the MQTT string limit applies; whether the frame fits is checked
/// against the buffer size when publishing.
pub fn validate_publish_topic(topic: &str) -> Result<(), ArgumentError> {
    if topic.is_empty() || topic.len() > u16::MAX as usize {
        return Err(ArgumentError::InvalidTopic);
    }
    if topic.contains(['+', '#']) {
        return Err(ArgumentError::InvalidTopic);
    }
    Ok(())
}

/// Validates a subscription filter.
///
/// `+` must occupy a whole level, `#` must occupy the last level.
pub fn validate_filter(filter: &str) -> Result<(), ArgumentError> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN {
        return Err(ArgumentError::InvalidTopic);
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            "+" => {}
            "#" if is_last => {}
            _ if level.contains(['+', '#']) => return Err(ArgumentError::InvalidTopic),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard() {
        assert!(matches("sport/+/player", "sport/tennis/player"));
        assert!(!matches("sport/+", "sport/tennis/player"));
        assert!(!matches("sport/+", "sport"));
        assert!(matches("sport/+", "sport/"));
        assert!(matches("+/+", "/finance"));
        assert!(matches("+", "finance"));
        assert!(!matches("+", "/finance"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("sport/#", "sport"));
        assert!(matches("sport/#", "sport/tennis/player"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("sport/tennis/#", "sport/tennis"));
        assert!(!matches("sport/tennis/#", "sport/tenniss"));
        assert!(!matches("sport/#/x", "sport/a/x"));
    }

    #[test]
    fn exact_levels() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b", "a/bc"));
        assert!(!matches("", "a"));
    }

    #[test]
    fn system_topics_are_isolated() {
        assert!(!matches("+/x", "$SYS/x"));
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(!matches("$SYS/#", "SYS/broker"));
    }

    #[test]
    fn publish_topics_reject_wildcards() {
        assert_eq!(validate_publish_topic("a/b"), Ok(()));
        assert_eq!(validate_publish_topic(""), Err(ArgumentError::InvalidTopic));
        assert_eq!(validate_publish_topic("a/+"), Err(ArgumentError::InvalidTopic));
        assert_eq!(validate_publish_topic("a/#"), Err(ArgumentError::InvalidTopic));
        let long = "a/".repeat(MAX_TOPIC_LEN);
        assert_eq!(validate_publish_topic(&long[..long.len() - 1]), Ok(()));
        assert_eq!(validate_filter(&long[..long.len() - 1]), Err(ArgumentError::InvalidTopic));
    }

    #[test]
    fn filters_require_whole_level_wildcards() {
        for ok in ["a/+/c", "#", "a/#", "+", "$SYS/#"] {
            assert_eq!(validate_filter(ok), Ok(()), "{}", ok);
        }
        for bad in ["", "a/b+", "a/#/c", "a#", "sport+"] {
            assert_eq!(validate_filter(bad), Err(ArgumentError::InvalidTopic), "{}", bad);
        }
    }
}
