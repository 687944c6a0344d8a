//! Channel-name and channel-pattern grammar, validation, and matching.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{BayeuxError, Result};

const NAME_SEGMENT: &str = r"[A-Za-z0-9\-_!~()$@]+";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^(/{NAME_SEGMENT})+$")).expect("valid regex"));

// A pattern segment is either a name segment, `*`, or `**`.
static PATTERN_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^({NAME_SEGMENT}|\\*\\*|\\*)$")).expect("valid regex"));

/// Compiled-pattern cache, keyed by the raw pattern string.
///
/// Subscriptions are long-lived and matched against every inbound message, so
/// re-compiling the translated regex on every `channel_matches` call would be
/// wasteful; this mirrors the small process-local caches the teacher crate
/// keeps around hot paths (e.g. its subscription alias maps).
static MATCH_CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// An immutable, normalized Bayeux channel name or pattern.
///
/// Construction validates the string against the channel grammar (§4.1); a
/// `Channel` is guaranteed to either be a valid channel name or a valid
/// channel pattern (or the root `/`) for the lifetime of the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
}

impl Channel {
    /// Builds a `Channel`, normalizing the input and validating it against
    /// the channel-name or channel-pattern grammar.
    ///
    /// # Errors
    /// Returns [`BayeuxError::InvalidChannel`] if `raw` is neither a valid
    /// channel name nor a valid channel pattern.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let name = normalize(raw.as_ref());
        if is_valid_channel_name(&name) || is_valid_channel_pattern(&name) {
            Ok(Self { name })
        } else {
            Err(BayeuxError::InvalidChannel(name))
        }
    }

    /// The normalized channel string.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// `true` if this channel is concrete (not a pattern) — i.e. safe to
    /// publish on.
    pub fn is_name(&self) -> bool {
        is_valid_channel_name(&self.name)
    }

    /// `true` if this channel begins with `/meta/`.
    pub fn is_meta(&self) -> bool {
        self.name.starts_with("/meta/")
    }

    /// `true` if this channel begins with `/service/`.
    pub fn is_service(&self) -> bool {
        self.name.starts_with("/service/")
    }

    /// `true` if this channel contains a wildcard segment.
    pub fn is_pattern(&self) -> bool {
        self.name.contains('*')
    }

    /// `true` if this channel ends in the multi-segment wildcard `/**`.
    pub fn is_wildcard(&self) -> bool {
        self.name.ends_with("/**")
    }

    /// The non-empty, `/`-separated segments of this channel.
    pub fn segments(&self) -> Vec<&str> {
        self.name.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// `true` if `self` (a pattern or name) matches `channel`.
    ///
    /// Delegates to [`channel_matches`].
    pub fn matches(&self, channel: &Channel) -> bool {
        channel_matches(channel.as_str(), self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Prepends a leading `/` if missing and strips a trailing `/` unless the
/// whole string is the root `/`.
pub fn normalize(raw: &str) -> String {
    let mut s = if raw.starts_with('/') { raw.to_owned() } else { format!("/{raw}") };
    if s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    s
}

/// `^(/[A-Za-z0-9\-_!~()$@]+)+$` — no trailing slash except the root, no
/// empty segments.
pub fn is_valid_channel_name(name: &str) -> bool {
    name == "/" || NAME_RE.is_match(name)
}

/// Starts with `/`; every segment is a valid name-segment, `*`, or `**`;
/// contains at least one wildcard segment.
pub fn is_valid_channel_pattern(pattern: &str) -> bool {
    if !pattern.starts_with('/') || pattern == "/" {
        return false;
    }
    let segments: Vec<&str> = pattern.split('/').skip(1).collect();
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return false;
    }
    if !segments.iter().any(|s| *s == "*" || *s == "**") {
        return false;
    }
    segments.iter().all(|s| PATTERN_SEGMENT_RE.is_match(s))
}

/// Translates `pattern` into an anchored regular expression (`**` → `.*`,
/// `*` → `[^/]*`) and tests `channel` against it.
///
/// Invalid channel names or patterns return `false` without raising, per
/// §4.1's failure mode.
pub fn channel_matches(channel: &str, pattern: &str) -> bool {
    if !is_valid_channel_name(channel) {
        return false;
    }
    if pattern == channel {
        return is_valid_channel_name(pattern);
    }
    if !is_valid_channel_pattern(pattern) {
        return false;
    }

    let mut cache = MATCH_CACHE.lock().expect("match cache poisoned");
    let regex = cache.entry(pattern.to_owned()).or_insert_with(|| compile_pattern(pattern));
    regex.is_match(channel)
}

fn compile_pattern(pattern: &str) -> Regex {
    let mut translated = String::from("^");
    let segments: Vec<&str> = pattern.split('/').skip(1).collect();
    for segment in segments {
        translated.push('/');
        match segment {
            "**" => translated.push_str(".*"),
            "*" => translated.push_str("[^/]*"),
            other => translated.push_str(&regex::escape(other)),
        }
    }
    translated.push('$');
    // The pattern has already been validated, so this cannot fail.
    Regex::new(&translated).expect("translated pattern is a valid regex")
}

/// `true` if `channel` falls under the first-segment namespace `ns` (e.g.
/// `/chat/room1` is in namespace `/chat`).
pub fn is_in_namespace(channel: &str, ns: &str) -> bool {
    let ns = normalize(ns);
    channel == ns || channel.starts_with(&format!("{ns}/"))
}

/// The first segment of `channel` as a namespace (e.g. `/chat/room1` → `/chat`).
pub fn namespace_of(channel: &str) -> Option<String> {
    let segments: Vec<&str> = channel.split('/').filter(|s| !s.is_empty()).collect();
    segments.first().map(|s| format!("/{s}"))
}

/// The portion of `channel` after `ns`, or `None` if `channel` is not in `ns`.
pub fn relative_to(channel: &str, ns: &str) -> Option<String> {
    let ns = normalize(ns);
    if channel == ns {
        return Some(String::new());
    }
    channel.strip_prefix(&format!("{ns}/")).map(|rest| format!("/{rest}"))
}

/// Every parent of `channel`, from the immediate parent up to the root,
/// excluding `channel` itself and including `/`.
pub fn parents(channel: &str) -> Vec<String> {
    let segments: Vec<&str> = channel.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::with_capacity(segments.len());
    for i in (0..segments.len()).rev() {
        out.push(format!("/{}", segments[..i].join("/")));
    }
    if out.is_empty() {
        out.push("/".to_owned());
    } else {
        // `segments[..0].join("/")` yields an empty string; normalize to root.
        if let Some(last) = out.last_mut() {
            if last == "/" {
                // already root
            } else if last.is_empty() {
                *last = "/".to_owned();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_channel_names() {
        assert!(is_valid_channel_name("/"));
        assert!(is_valid_channel_name("/chat"));
        assert!(is_valid_channel_name("/chat/room1"));
        assert!(is_valid_channel_name("/meta/handshake"));
        assert!(!is_valid_channel_name("/chat/"));
        assert!(!is_valid_channel_name("/chat//room1"));
        assert!(!is_valid_channel_name("chat"));
        assert!(!is_valid_channel_name("/chat room1"));
        assert!(!is_valid_channel_name(""));
    }

    #[test]
    fn validates_channel_patterns() {
        assert!(is_valid_channel_pattern("/chat/*"));
        assert!(is_valid_channel_pattern("/chat/**"));
        assert!(is_valid_channel_pattern("/*/room1"));
        assert!(!is_valid_channel_pattern("/chat/room1"));
        assert!(!is_valid_channel_pattern("/"));
        assert!(!is_valid_channel_pattern("chat/*"));
        assert!(!is_valid_channel_pattern("/chat/* /"));
    }

    #[test]
    fn matches_single_segment_wildcard() {
        assert!(channel_matches("/chat/room1", "/chat/*"));
        assert!(!channel_matches("/chat/room1/messages", "/chat/*"));
    }

    #[test]
    fn matches_multi_segment_wildcard() {
        assert!(channel_matches("/chat/room1", "/chat/**"));
        assert!(channel_matches("/chat/room1/messages", "/chat/**"));
        assert!(channel_matches("/chat", "/chat/**"));
    }

    #[test]
    fn invalid_inputs_return_false_without_panicking() {
        assert!(!channel_matches("not a channel", "/chat/*"));
        assert!(!channel_matches("/chat/room1", "not a pattern"));
    }

    #[test]
    fn exact_name_matches_itself() {
        assert!(channel_matches("/chat/room1", "/chat/room1"));
    }

    #[test]
    fn namespace_helpers() {
        assert!(is_in_namespace("/chat/room1", "/chat"));
        assert!(!is_in_namespace("/chatter/room1", "/chat"));
        assert_eq!(namespace_of("/chat/room1"), Some("/chat".to_owned()));
        assert_eq!(relative_to("/chat/room1", "/chat"), Some("/room1".to_owned()));
        assert_eq!(relative_to("/chat", "/chat"), Some(String::new()));
        assert_eq!(parents("/chat/room1/messages"), vec!["/chat/room1", "/chat", "/"]);
    }

    #[test]
    fn channel_type_flags() {
        let c = Channel::new("/meta/handshake").unwrap();
        assert!(c.is_meta());
        assert!(!c.is_service());
        assert!(!c.is_pattern());

        let pattern = Channel::new("/chat/**").unwrap();
        assert!(pattern.is_pattern());
        assert!(pattern.is_wildcard());
        assert!(!pattern.is_name());
    }

    #[test]
    fn rejects_unvalidatable_strings() {
        assert!(Channel::new("not-a-channel").is_err());
        assert!(Channel::new("/chat/").is_err());
    }
}
