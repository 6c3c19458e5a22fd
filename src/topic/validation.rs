//! Topic name and filter validation and matching
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Filters with empty levels (`a//b`) are rejected
//! - Topics starting with $ are not matched by filters starting with + or #

/// Prefix of a shared subscription filter: `$share/{group}/{filter}`
pub const SHARE_PREFIX: &str = "$share/";

/// Parse a shared subscription filter
/// Returns (share_group, actual_filter) if it's a shared subscription, or None
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix(SHARE_PREFIX)?;
    let slash_pos = rest.find('/')?;
    let group = &rest[..slash_pos];
    let actual_filter = &rest[slash_pos + 1..];
    if group.is_empty() || actual_filter.is_empty() {
        return None;
    }
    Some((group, actual_filter))
}

/// Validate a topic name (used in PUBLISH)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
///
/// Shared subscriptions (`$share/{group}/{filter}`) are validated on the
/// filter part; the group name must be non-empty and wildcard free.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let actual_filter = if filter.starts_with(SHARE_PREFIX) {
        match parse_shared_subscription(filter) {
            Some((group, actual)) => {
                if group.contains('+') || group.contains('#') {
                    return Err("shared subscription group name cannot contain wildcards");
                }
                actual
            }
            None => return Err("invalid shared subscription format"),
        }
    } else {
        filter
    };

    let level_count = actual_filter.split('/').count();
    for (i, level) in actual_filter.split('/').enumerate() {
        if level.is_empty() {
            return Err("topic filter cannot contain empty levels");
        }

        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != level_count - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Boolean form of [`validate_topic_filter`]
pub fn is_valid_filter(filter: &str) -> bool {
    validate_topic_filter(filter).is_ok()
}

/// Whether a filter contains a wildcard level.
///
/// Pure function of the string; shared subscriptions are classified by
/// their filter part so every node partitions them identically.
pub fn is_wildcard(filter: &str) -> bool {
    let actual = parse_shared_subscription(filter)
        .map(|(_, actual)| actual)
        .unwrap_or(filter);
    actual.split('/').any(|level| level == "+" || level == "#")
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more trailing levels (so `a/#` matches `a`)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some(_), None) => return false,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (None, None) => return true,
            (None, Some(_)) => return false,
        }
    }
}

/// Whether every topic matched by `filter` is also matched by `allowed`.
///
/// Used to decide if an existing subscription is still covered by a client's
/// authorized subscribe filters.
pub fn filter_covered_by(filter: &str, allowed: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut allowed_levels = allowed.split('/');

    loop {
        match (allowed_levels.next(), filter_levels.next()) {
            (Some("#"), _) => return true,
            (Some(_), None) => return false,
            (Some("+"), Some(f)) => {
                if f == "#" {
                    return false;
                }
            }
            (Some(a), Some(f)) => {
                if a != f {
                    return false;
                }
            }
            (None, None) => return true,
            (None, Some(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("test/topic").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("$share/g1/test/+").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a//b").is_err());
        assert!(validate_topic_filter("a/b+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("+test").is_err());
        assert!(validate_topic_filter("$share//a").is_err());
        assert!(validate_topic_filter("$share/g+/a").is_err());
        assert!(validate_topic_filter("$share/group").is_err());
    }

    #[test_case("a/b/c", "a/+/c", true; "plus matches one level")]
    #[test_case("a/b/c/d", "a/+/c", false; "plus does not span levels")]
    #[test_case("a/b/c", "a/#", true; "hash matches remaining levels")]
    #[test_case("sport", "sport/#", true; "hash matches parent level")]
    #[test_case("a/b", "a/+/+", false; "plus needs a level")]
    #[test_case("a/b", "+/+", true; "all plus")]
    #[test_case("anything/at/all", "#", true; "bare hash")]
    #[test_case("A/b", "a/b", false; "no case folding")]
    #[test_case("a/b/", "a/b/+", true; "plus matches empty trailing level")]
    #[test_case("$SYS/uptime", "#", false; "dollar topics hidden from hash")]
    #[test_case("$SYS/uptime", "+/uptime", false; "dollar topics hidden from plus")]
    #[test_case("$SYS/uptime", "$SYS/#", true; "explicit dollar prefix")]
    fn test_topic_matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("a/+"));
        assert!(is_wildcard("#"));
        assert!(is_wildcard("$share/g/a/#"));
        assert!(!is_wildcard("a/b"));
        assert!(!is_wildcard("$share/g/a/b"));
    }

    #[test]
    fn test_parse_shared_subscription() {
        assert_eq!(
            parse_shared_subscription("$share/g1/a/b"),
            Some(("g1", "a/b"))
        );
        assert_eq!(parse_shared_subscription("a/b"), None);
        assert_eq!(parse_shared_subscription("$share/g1"), None);
    }

    #[test]
    fn test_filter_covered_by() {
        assert!(filter_covered_by("a/b", "a/#"));
        assert!(filter_covered_by("a/+/c", "a/#"));
        assert!(filter_covered_by("a/b", "a/+"));
        assert!(filter_covered_by("a/#", "#"));
        assert!(!filter_covered_by("a/#", "a/+"));
        assert!(!filter_covered_by("a/+", "a/b"));
        assert!(!filter_covered_by("b/c", "a/#"));
        assert!(!filter_covered_by("a/b/c", "a/+"));
    }

    proptest! {
        #[test]
        fn prop_literal_filter_matches_only_itself(
            topic in "[a-z]{1,4}(/[a-z]{0,4}){0,4}",
            filter in "[a-z]{1,4}(/[a-z]{0,4}){0,4}",
        ) {
            prop_assert_eq!(topic_matches_filter(&topic, &filter), topic == filter);
            prop_assert!(topic_matches_filter(&topic, &topic));
        }
    }
}
