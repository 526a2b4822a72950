//! MQTT topic names and topic filters.
//!
//! Topic structure: levels separated by `/`.
//!
//! Filters may use:
//! - `+` to match exactly one level
//! - `#` as the final level to match the parent and any number of children
//!
//! Topics starting with `$` are never matched by a filter whose first level
//! is a wildcard.

/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

/// Check a concrete topic name used in a PUBLISH.
///
/// # Errors
///
/// Returns error if the topic is empty or contains a wildcard.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Check a topic filter used in a SUBSCRIBE.
///
/// # Errors
///
/// Returns error if the filter is empty or misplaces a wildcard.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL || idx != last) {
            return Err(TopicError::MisplacedMultiLevel(filter.to_string()));
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(TopicError::MisplacedSingleLevel(filter.to_string()));
        }
    }

    Ok(())
}

/// Whether `filter` matches the concrete `topic`.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    if topic.starts_with('$') {
        if let Some(first) = filter_levels.first() {
            if *first == SINGLE_LEVEL || *first == MULTI_LEVEL {
                return false;
            }
        }
    }

    let mut t_idx = 0;
    for level in &filter_levels {
        if *level == MULTI_LEVEL {
            return true;
        }
        let Some(topic_level) = topic_levels.get(t_idx) else {
            return false;
        };
        if *level != SINGLE_LEVEL && level != topic_level {
            return false;
        }
        t_idx += 1;
    }

    t_idx == topic_levels.len()
}

/// Topic validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Zero-length topic or filter
    #[error("topic must not be empty")]
    Empty,
    /// Wildcard used in a topic name
    #[error("wildcards are not allowed in topic names: {0}")]
    WildcardInTopic(String),
    /// `#` not alone in the last level
    #[error("'#' must occupy the whole last level: {0}")]
    MisplacedMultiLevel(String),
    /// `+` sharing a level with other characters
    #[error("'+' must occupy a whole level: {0}")]
    MisplacedSingleLevel(String),
}
