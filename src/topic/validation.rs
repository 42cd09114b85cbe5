//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy an entire level and be the last level
//! - Single-level wildcard (+) must occupy an entire level and matches
//!   exactly one non-empty level
//! - Topics starting with $ are system topics: they never match a filter
//!   whose first level is + or #
//! - A trailing empty level (`foo/`) is a distinct level

/// Validate a topic name (used in PUBLISH)
///
/// Topic names must be non-empty, at most 65535 bytes, free of the null
/// character, and wildcard-free.
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

    let last = filter.split('/').count() - 1;
    for (i, level) in filter.split('/').enumerate() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != last {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check whether a topic filter matches a concrete topic name
///
/// `+` matches exactly one non-empty level. `#` matches zero or more
/// remaining levels, so `foo/#` matches `foo` itself. Topics starting with
/// `$` are only matched by filters whose first level is a literal
/// `$...` level.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // System topics never match a root-level wildcard.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match filter_levels.next() {
            // # swallows zero or more remaining levels, so foo/# matches foo
            Some("#") => return true,
            Some("+") => match topic_levels.next() {
                Some(level) if !level.is_empty() => {}
                _ => return false,
            },
            Some(literal) => match topic_levels.next() {
                Some(level) if level == literal => {}
                _ => return false,
            },
            None => return topic_levels.next().is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());
        assert!(validate_topic_name("$SYS/broker/uptime").is_ok());

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
        assert!(validate_topic_filter("+/test").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("foo/").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("+test").is_err());
        assert!(validate_topic_filter("test/fo#o").is_err());
    }

    #[test]
    fn test_exact_and_single_wildcard_matching() {
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        assert!(topic_matches_filter("test/topic", "test/+"));
        assert!(topic_matches_filter("test/topic", "+/topic"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));
    }

    #[test]
    fn test_single_wildcard_rejects_empty_level() {
        assert!(!topic_matches_filter("test/", "test/+"));
        assert!(!topic_matches_filter("/topic", "+/topic"));
        // A literal empty level still matches exactly.
        assert!(topic_matches_filter("test/", "test/"));
        assert!(topic_matches_filter("/topic", "/topic"));
    }

    #[test]
    fn test_multi_wildcard_matching() {
        assert!(topic_matches_filter("test", "#"));
        assert!(topic_matches_filter("test/topic/more", "#"));
        assert!(topic_matches_filter("test/topic", "test/#"));
        assert!(topic_matches_filter("test/topic/more", "test/#"));
        // # covers zero levels: foo/# matches foo itself
        assert!(topic_matches_filter("foo", "foo/#"));
        assert!(topic_matches_filter("foo/bar/baz", "foo/#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(!topic_matches_filter("$SYS", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/+"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
        assert!(topic_matches_filter("$SYS/broker/uptime", "$SYS/#"));
    }

    #[test]
    fn test_trailing_empty_level_is_distinct() {
        assert!(!topic_matches_filter("foo", "foo/"));
        assert!(!topic_matches_filter("foo/", "foo"));
        assert!(topic_matches_filter("foo/", "foo/#"));
    }
}
