//! Topic name and topic filter validation and matching

use thiserror::Error;

/// Longest topic accepted on the wire (UTF-8 encoded length prefix)
pub const MAX_TOPIC_LEN: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,

    #[error("topic is {0} bytes, longer than {MAX_TOPIC_LEN}")]
    TooLong(usize),

    #[error("topic must not contain NUL characters")]
    NulCharacter,

    #[error("wildcards are not allowed in topic names: {0}")]
    WildcardInName(String),

    #[error("invalid wildcard placement in filter: {0}")]
    InvalidWildcard(String),
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription filter.
///
/// `+` must occupy a whole level; `#` must occupy the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        let bad_plus = level.contains('+') && *level != "+";
        let bad_hash = level.contains('#') && (*level != "#" || index != last);
        if bad_plus || bad_hash {
            return Err(TopicError::InvalidWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// Whether `topic` is covered by `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level never match $-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("sensors/kitchen/temp").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic_name("sensors/+/temp"),
            Err(TopicError::WildcardInName(_))
        ));
        assert!(validate_topic_name("a/#").is_err());
        assert_eq!(validate_topic_name("a\0b"), Err(TopicError::NulCharacter));
    }

    #[test]
    fn test_topic_filter_validation() {
        for ok in ["#", "+", "a/+/c", "a/#", "+/+", "sport/tennis/#"] {
            assert!(validate_topic_filter(ok).is_ok(), "{ok}");
        }
        for bad in ["a/#/c", "a#", "a/b+", "#/a", "a/++"] {
            assert!(validate_topic_filter(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_exact_and_single_level_matching() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/d"));
        assert!(matches("+", "a"));
        assert!(!matches("+", "a/b"));
        assert!(matches("+/+", "/a"));
    }

    #[test]
    fn test_multi_level_matching() {
        assert!(matches("sport/#", "sport"));
        assert!(matches("sport/#", "sport/tennis/player1"));
        assert!(matches("#", "any/thing"));
        assert!(!matches("sport/#", "sports"));
    }

    #[test]
    fn test_system_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
