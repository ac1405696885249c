use crate::error::{MqttError, Result};

/// Longest topic name or filter the engine accepts, in bytes.
const MAX_TOPIC_LENGTH: usize = 65_535;

/// Validates an MQTT topic name.
///
/// # Rules:
/// - Must have at least one character
/// - Must not contain null characters (U+0000)
/// - Must not exceed the maximum string length when UTF-8 encoded
/// - Must not contain wildcard characters (+, #); those belong in filters
#[must_use]
pub fn is_valid_topic_name(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LENGTH {
        return false;
    }

    if topic.contains('\0') {
        return false;
    }

    !topic.contains('+') && !topic.contains('#')
}

/// Validates an MQTT topic filter.
///
/// # Rules:
/// - Must follow all topic name rules except wildcard usage
/// - Single-level wildcard (+) must occupy an entire level
/// - Multi-level wildcard (#) must be last and occupy an entire level
/// - Examples: `sport/+/player`, `sport/tennis/#`, `+/tennis/#`
#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LENGTH {
        return false;
    }

    if filter.contains('\0') {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            // # must be the whole final level
            if *level != "#" || i != levels.len() - 1 {
                return false;
            }
        }

        if level.contains('+') && *level != "+" {
            return false;
        }
    }

    true
}

/// Validates a topic name and returns an error if invalid.
///
/// # Errors
///
/// Returns [`MqttError::InvalidTopicName`] if the topic name is empty, too
/// long, contains null characters or contains wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if !is_valid_topic_name(topic) {
        return Err(MqttError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validates a topic filter and returns an error if invalid.
///
/// # Errors
///
/// Returns [`MqttError::InvalidTopicFilter`] if the filter is empty, too
/// long, contains null characters or uses wildcards outside their own level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if !is_valid_topic_filter(filter) {
        return Err(MqttError::InvalidTopicFilter(filter.to_string()));
    }
    Ok(())
}

/// Checks whether a topic name matches a topic filter.
///
/// `+` matches exactly one level; `#` matches any number of remaining
/// levels including the parent level.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if filter == "#" {
        return true;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (topic_levels.next(), filter_levels.next()) {
            (_, Some("#")) => return true,
            (Some(t), Some(f)) => {
                if f != "+" && f != t {
                    return false;
                }
            }
            (None, Some(f)) => {
                // "sport/tennis" matches "sport/tennis/#" (parent level)
                return f == "#" && filter_levels.peek().is_none();
            }
            (Some(_), None) => return false,
            (None, None) => return true,
        }
    }
}
