//! Topics, subscription patterns and the topic matcher
//!
//! A topic is an ordered sequence of non-empty segments. Patterns may use
//! two reserved segments:
//! - `+` matches exactly one segment
//! - `#` matches zero or more trailing segments (final position only)
//!
//! Wildcards must occupy a whole segment; `a+` or `#b` are malformed and are
//! rejected rather than normalized.

use std::fmt;

use crate::{CanopyError, CanopyResult};

/// Single-level wildcard segment
pub const SINGLE_WILDCARD: &str = "+";

/// Multi-level trailing wildcard segment
pub const MULTI_WILDCARD: &str = "#";

/// Default separator set used to split topic strings
pub const DEFAULT_SEPARATORS: &str = "/";

/// Maximum number of segments in a topic or pattern
pub const MAX_SEGMENTS: usize = 255;

/// Maximum byte length of one segment
pub const MAX_SEGMENT_LEN: usize = 1024;

fn split_segments(s: &str, separators: &str) -> CanopyResult<Vec<String>> {
    if s.is_empty() {
        return Err(CanopyError::MalformedTopic("empty topic".into()));
    }
    let segments: Vec<String> = if separators.is_empty() {
        vec![s.to_string()]
    } else {
        s.split(|c| separators.contains(c))
            .map(str::to_string)
            .collect()
    };
    Ok(segments)
}

fn validate(segments: &[String], allow_wildcards: bool) -> CanopyResult<()> {
    if segments.is_empty() {
        return Err(CanopyError::MalformedTopic("no segments".into()));
    }
    if segments.len() > MAX_SEGMENTS {
        return Err(CanopyError::MalformedTopic(format!(
            "too many segments: {} > {}",
            segments.len(),
            MAX_SEGMENTS
        )));
    }
    let last = segments.len() - 1;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return Err(CanopyError::MalformedTopic(format!(
                "empty segment at position {}",
                i
            )));
        }
        if seg.len() > MAX_SEGMENT_LEN {
            return Err(CanopyError::MalformedTopic(format!(
                "segment at position {} is {} bytes",
                i,
                seg.len()
            )));
        }
        let is_wildcard = seg == SINGLE_WILDCARD || seg == MULTI_WILDCARD;
        if !is_wildcard && (seg.contains('+') || seg.contains('#')) {
            return Err(CanopyError::MalformedTopic(format!(
                "wildcard inside segment '{}'",
                seg
            )));
        }
        if is_wildcard && !allow_wildcards {
            return Err(CanopyError::MalformedTopic(format!(
                "wildcard '{}' in publication topic",
                seg
            )));
        }
        if seg == MULTI_WILDCARD && i != last {
            return Err(CanopyError::MalformedTopic(
                "'#' must be the final segment".into(),
            ));
        }
    }
    Ok(())
}

fn write_joined(f: &mut fmt::Formatter<'_>, segments: &[String]) -> fmt::Result {
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            f.write_str("/")?;
        }
        f.write_str(seg)?;
    }
    Ok(())
}

/// Concrete publication topic (no wildcards)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    segments: Vec<String>,
}

impl Topic {
    /// Parse a topic string, splitting on any character in `separators`
    pub fn parse(s: &str, separators: &str) -> CanopyResult<Self> {
        Self::from_segments(split_segments(s, separators)?)
    }

    /// Build a topic from already-split segments
    pub fn from_segments<I, S>(segments: I) -> CanopyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        validate(&segments, false)?;
        Ok(Topic { segments })
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Topic(")?;
        write_joined(f, &self.segments)?;
        f.write_str(")")
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.segments)
    }
}

/// Subscription pattern (may contain `+` and a trailing `#`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern {
    segments: Vec<String>,
}

impl TopicPattern {
    /// Parse a pattern string, splitting on any character in `separators`
    pub fn parse(s: &str, separators: &str) -> CanopyResult<Self> {
        Self::from_segments(split_segments(s, separators)?)
    }

    /// Build a pattern from already-split segments
    pub fn from_segments<I, S>(segments: I) -> CanopyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        validate(&segments, true)?;
        Ok(TopicPattern { segments })
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if the pattern contains no wildcard
    pub fn is_concrete(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| s == SINGLE_WILDCARD || s == MULTI_WILDCARD)
    }

    /// Does this pattern match a concrete topic
    #[inline]
    pub fn matches(&self, topic: &Topic) -> bool {
        matches(&self.segments, &topic.segments)
    }

    /// Does every topic matched by `other` also match `self`
    #[inline]
    pub fn covers(&self, other: &TopicPattern) -> bool {
        covers(&self.segments, &other.segments)
    }

    /// Keep the first `depth` segments and match anything below them.
    /// The result always covers `self`.
    pub fn generalize(&self, depth: usize) -> TopicPattern {
        if self.segments.len() <= depth {
            return self.clone();
        }
        let mut segments = self.segments[..depth].to_vec();
        segments.push(MULTI_WILDCARD.to_string());
        TopicPattern { segments }
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pattern(")?;
        write_joined(f, &self.segments)?;
        f.write_str(")")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.segments)
    }
}

impl From<Topic> for TopicPattern {
    fn from(topic: Topic) -> Self {
        TopicPattern {
            segments: topic.segments,
        }
    }
}

/// Segment-wise match of a pattern against a topic.
///
/// Both inputs are assumed validated; a `#` anywhere but last is treated as
/// matching the remainder.
pub fn matches<P: AsRef<str>, T: AsRef<str>>(pattern: &[P], topic: &[T]) -> bool {
    let mut remaining = topic.iter();
    for seg in pattern {
        match seg.as_ref() {
            MULTI_WILDCARD => return true,
            SINGLE_WILDCARD => {
                if remaining.next().is_none() {
                    return false;
                }
            }
            literal => match remaining.next() {
                Some(t) if t.as_ref() == literal => {}
                _ => return false,
            },
        }
    }
    remaining.next().is_none()
}

/// Containment check between patterns: true iff every topic matched by
/// `specific` is also matched by `general`.
pub fn covers<G: AsRef<str>, S: AsRef<str>>(general: &[G], specific: &[S]) -> bool {
    match (general.first(), specific.first()) {
        (Some(g), _) if g.as_ref() == MULTI_WILDCARD => true,
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(g), Some(s)) => {
            let (g, s) = (g.as_ref(), s.as_ref());
            if s == MULTI_WILDCARD {
                return false;
            }
            let head = g == SINGLE_WILDCARD || (s != SINGLE_WILDCARD && g == s);
            head && covers(&general[1..], &specific[1..])
        }
    }
}

/// A publication matches a subscription if any (pattern, topic) pair matches
pub fn matches_any(patterns: &[TopicPattern], topics: &[Topic]) -> bool {
    patterns
        .iter()
        .any(|p| topics.iter().any(|t| p.matches(t)))
}

/// Publication topics matched by at least one of the patterns
pub fn matched_topics<'a>(patterns: &[TopicPattern], topics: &'a [Topic]) -> Vec<&'a Topic> {
    topics
        .iter()
        .filter(|t| patterns.iter().any(|p| p.matches(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pat(s: &str) -> TopicPattern {
        TopicPattern::parse(s, DEFAULT_SEPARATORS).unwrap()
    }

    fn topic(s: &str) -> Topic {
        Topic::parse(s, DEFAULT_SEPARATORS).unwrap()
    }

    #[test]
    fn test_literal_match() {
        assert!(pat("A/A").matches(&topic("A/A")));
        assert!(!pat("A/B").matches(&topic("A/A")));
        assert!(!pat("A/B").matches(&topic("A")));
        assert!(!pat("A").matches(&topic("A/B")));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(pat("a/+/c").matches(&topic("a/b/c")));
        assert!(pat("a/+/c").matches(&topic("a/zzz/c")));
        assert!(!pat("a/+/c").matches(&topic("a/c")));
        assert!(!pat("a/+").matches(&topic("a/b/c")));
    }

    #[test]
    fn test_multi_wildcard() {
        assert!(pat("A/#").matches(&topic("A")));
        assert!(pat("A/#").matches(&topic("A/B/C/D")));
        assert!(pat("+/#").matches(&topic("x")));
        assert!(pat("#").matches(&topic("x/y")));
        assert!(!pat("B/#").matches(&topic("A/B")));
    }

    #[test]
    fn test_mixed_separators() {
        let t = Topic::parse("foo/bar/baz.1", "/.").unwrap();
        assert_eq!(t.segments(), ["foo", "bar", "baz", "1"]);
        let p = TopicPattern::parse("foo/+/+.#", "/.").unwrap();
        assert!(p.matches(&t));
        let p = TopicPattern::parse("foo/+/+/+/#", "/.").unwrap();
        assert!(p.matches(&t));
        let p = TopicPattern::parse("foo/+/+/+/+/+", "/.").unwrap();
        assert!(!p.matches(&t));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        for bad in ["", "a//b", "/a", "a/", "a/#/b", "#/a", "a+/b", "a/#b", "a/b+c"] {
            assert!(
                matches!(
                    TopicPattern::parse(bad, DEFAULT_SEPARATORS),
                    Err(CanopyError::MalformedTopic(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_oversized_segment_rejected() {
        let long = "x".repeat(MAX_SEGMENT_LEN + 1);
        assert!(matches!(
            Topic::from_segments(["a".to_string(), long]),
            Err(CanopyError::MalformedTopic(_))
        ));
        assert!(Topic::from_segments(["x".repeat(MAX_SEGMENT_LEN)]).is_ok());
    }

    #[test]
    fn test_generalize() {
        assert_eq!(pat("a/b/c").generalize(1), pat("a/#"));
        assert_eq!(pat("a/+/c").generalize(2), pat("a/+/#"));
        assert_eq!(pat("a/b").generalize(0), pat("#"));
        assert_eq!(pat("a/b").generalize(2), pat("a/b"));
        assert_eq!(pat("a/#").generalize(1), pat("a/#"));
        for p in ["a/b/c", "+/x", "a/#", "q"] {
            for depth in 0..4 {
                assert!(pat(p).generalize(depth).covers(&pat(p)));
            }
        }
    }

    #[test]
    fn test_wildcards_rejected_in_topics() {
        assert!(Topic::parse("a/+", DEFAULT_SEPARATORS).is_err());
        assert!(Topic::parse("a/#", DEFAULT_SEPARATORS).is_err());
        assert!(Topic::from_segments(["a", "b"]).is_ok());
    }

    #[test]
    fn test_matches_any() {
        let patterns = vec![pat("B/B"), pat("a/+/c")];
        assert!(matches_any(&patterns, &[topic("x"), topic("a/b/c")]));
        assert!(!matches_any(&patterns, &[topic("A/A")]));
        assert!(!matches_any(&[], &[topic("A/A")]));
        assert!(!matches_any(&patterns, &[]));
    }

    #[test]
    fn test_matched_topics() {
        let topics = vec![topic("a/b/c"), topic("d/e/f"), topic("a/x/c")];
        let matched = matched_topics(&[pat("a/+/c")], &topics);
        assert_eq!(matched, vec![&topics[0], &topics[2]]);
    }

    #[test]
    fn test_covers() {
        assert!(pat("a/+").covers(&pat("a/b")));
        assert!(pat("a/#").covers(&pat("a")));
        assert!(pat("a/#").covers(&pat("a/+/c/#")));
        assert!(pat("+/#").covers(&pat("a/b/c")));
        assert!(pat("a/b").covers(&pat("a/b")));
        assert!(!pat("a/b").covers(&pat("a/+")));
        assert!(!pat("a/+").covers(&pat("a/#")));
        assert!(!pat("a/+/#").covers(&pat("a")));
        assert!(!pat("a/b/c").covers(&pat("a/b")));
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
    }

    fn topic_strategy() -> impl Strategy<Value = Topic> {
        prop::collection::vec(segment(), 1..5)
            .prop_map(|segs| Topic::from_segments(segs).unwrap())
    }

    fn pattern_strategy() -> impl Strategy<Value = TopicPattern> {
        let seg = prop_oneof![segment(), Just(SINGLE_WILDCARD.to_string())];
        (prop::collection::vec(seg, 0..4), any::<bool>()).prop_filter_map(
            "non-empty pattern",
            |(mut segs, trailing)| {
                if trailing {
                    segs.push(MULTI_WILDCARD.to_string());
                }
                TopicPattern::from_segments(segs).ok()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(t in topic_strategy()) {
            prop_assert!(TopicPattern::from(t.clone()).matches(&t));
        }

        #[test]
        fn prop_plus_matches_any_segment(
            prefix in prop::collection::vec(segment(), 0..3),
            any_seg in "[a-z0-9]{1,8}",
            suffix in prop::collection::vec(segment(), 0..3),
        ) {
            let mut p = prefix.clone();
            p.push(SINGLE_WILDCARD.to_string());
            p.extend(suffix.clone());
            let mut t = prefix;
            t.push(any_seg);
            t.extend(suffix);
            prop_assert!(matches(&p, &t));
        }

        #[test]
        fn prop_hash_matches_any_tail(
            prefix in prop::collection::vec(segment(), 1..3),
            tail in prop::collection::vec(segment(), 0..4),
        ) {
            let mut p = prefix.clone();
            p.push(MULTI_WILDCARD.to_string());
            let mut t = prefix;
            t.extend(tail);
            prop_assert!(matches(&p, &t));
        }

        #[test]
        fn prop_covers_implies_matches(
            general in pattern_strategy(),
            specific in pattern_strategy(),
            t in topic_strategy(),
        ) {
            if general.covers(&specific) && specific.matches(&t) {
                prop_assert!(general.matches(&t));
            }
        }

        #[test]
        fn prop_covers_is_reflexive(p in pattern_strategy()) {
            prop_assert!(p.covers(&p));
        }
    }
}
