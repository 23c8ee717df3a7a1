//! Topic names, topic filters and the matching tree.

mod tree;

pub use tree::TopicTree;

/// Splits a topic into its `/`-delimited levels. Empty levels are
/// preserved (`a//b` has three levels).
#[must_use]
pub fn levels(topic: &str) -> Vec<&str> {
    topic.split('/').collect()
}

/// Whether `name` is a valid concrete topic name for PUBLISH: not
/// empty and free of wildcard characters.
#[must_use]
pub fn valid_topic_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['+', '#'])
}

/// Whether `filter` is a valid subscription filter: not empty, `+`
/// only as a whole level, `#` only as the final whole level.
#[must_use]
pub fn valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let parts = levels(filter);
    let last = parts.len() - 1;
    for (i, level) in parts.iter().enumerate() {
        match *level {
            "+" => {}
            "#" => {
                if i != last {
                    return false;
                }
            }
            other => {
                if other.contains(['+', '#']) {
                    return false;
                }
            }
        }
    }
    true
}

/// Whether a concrete `topic` matches a subscription `filter` under
/// MQTT wildcard rules, including the `$`-prefix hiding rule.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels = levels(topic);
    let filter_levels = levels(filter);

    // A filter starting with a wildcard never matches a $-topic.
    if topic_levels[0].starts_with('$') && matches!(filter_levels[0], "+" | "#") {
        return false;
    }

    let mut t = topic_levels.iter();
    for level in &filter_levels {
        match *level {
            "#" => return true,
            "+" => {
                if t.next().is_none() {
                    return false;
                }
            }
            name => {
                if t.next() != Some(&name) {
                    return false;
                }
            }
        }
    }
    t.next().is_none()
}
