//! Path, host and URL subjects used by permissions, plus their patterns.
//!
//! Patterns deliberately stay small: `/...` at the end of a path or URL
//! pattern makes it a prefix pattern, `**.` at the start of a host pattern
//! matches any subdomain chain, `*.` matches exactly one label.

use std::fmt;

/// An absolute slash-separated path (`/a/b`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsolutePath(String);

impl AbsolutePath {
    pub fn new(path: impl Into<String>) -> Option<Self> {
        let path = path.into();
        path.starts_with('/').then_some(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the path names a directory (trailing slash convention).
    pub fn is_dir_path(&self) -> bool {
        self.0.ends_with('/')
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AbsolutePath {
    fn from(path: &str) -> Self {
        Self::new(path).unwrap_or_else(|| Self(format!("/{path}")))
    }
}

/// A path pattern: either a prefix pattern (`/a/...`) or a pattern with
/// `*` wildcards inside single segments (`/a/*.txt`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathPattern(String);

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_prefix_pattern(&self) -> bool {
        self.0.ends_with("/...")
    }

    /// The literal path prefix of a prefix pattern (`/a/...` → `/a/`).
    fn prefix(&self) -> &str {
        self.0.trim_end_matches("...")
    }

    pub fn test(&self, path: &AbsolutePath) -> bool {
        if self.is_prefix_pattern() {
            let prefix = self.prefix();
            return path.as_str().starts_with(prefix)
                || path.as_str() == prefix.trim_end_matches('/');
        }
        segments_match(&self.0, path.as_str())
    }

    /// A prefix pattern includes another prefix pattern with a longer (or
    /// equal) prefix.
    pub fn includes_pattern(&self, other: &PathPattern) -> bool {
        if self == other {
            return true;
        }
        self.is_prefix_pattern()
            && other.is_prefix_pattern()
            && other.prefix().starts_with(self.prefix())
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

/// Segment-wise glob match where `*` matches any run of characters inside a
/// single segment.
fn segments_match(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut path_segments = path.split('/');

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if segment_matches(p, s) => continue,
            _ => return false,
        }
    }
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    // Classic backtracking match over a single `*` alphabet.
    let pattern: Vec<char> = pattern.chars().collect();
    let segment: Vec<char> = segment.chars().collect();

    let (mut p, mut s) = (0usize, 0usize);
    let (mut star, mut star_s) = (None::<usize>, 0usize);

    while s < segment.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == segment[s] {
            p += 1;
            s += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_s = s;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_s += 1;
            s = star_s;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// A host with a scheme, e.g. `https://example.com:443`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Host(String);

impl Host {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or("")
    }

    pub fn without_scheme(&self) -> &str {
        match self.0.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.0,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

/// A host pattern, e.g. `https://**.example.com` or `*.example.com`.
///
/// `**.` matches one or more leading labels, `*.` matches exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    fn hostname(&self) -> &str {
        match self.0.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.0,
        }
    }

    pub fn test(&self, host: &Host) -> bool {
        if let Some(scheme) = self.scheme() {
            if scheme != host.scheme() {
                return false;
            }
        }
        let hostname = host.without_scheme();

        if let Some(suffix) = self.hostname().strip_prefix("**.") {
            return hostname == suffix
                || (hostname.ends_with(suffix)
                    && hostname[..hostname.len() - suffix.len()].ends_with('.'));
        }
        if let Some(suffix) = self.hostname().strip_prefix("*.") {
            let Some(labels) = hostname.strip_suffix(suffix) else {
                return false;
            };
            let labels = labels.trim_end_matches('.');
            return !labels.is_empty() && !labels.contains('.');
        }

        self.hostname() == hostname
    }

    /// `**.example.com` includes `**.sub.example.com` and `*.example.com`;
    /// a `*.` pattern only includes itself.
    pub fn includes_pattern(&self, other: &HostPattern) -> bool {
        if self == other {
            return true;
        }
        if self.scheme() != other.scheme() && self.scheme().is_some() {
            return false;
        }
        let Some(suffix) = self.hostname().strip_prefix("**.") else {
            return false;
        };
        let other_hostname = other.hostname();
        for prefix in ["**.", "*."] {
            if let Some(other_suffix) = other_hostname.strip_prefix(prefix) {
                return other_suffix == suffix
                    || (other_suffix.ends_with(suffix)
                        && other_suffix[..other_suffix.len() - suffix.len()].ends_with('.'));
            }
        }
        false
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

/// A URL pattern; `/...` at the end of the path makes it a prefix pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UrlPattern(String);

impl UrlPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_prefix_pattern(&self) -> bool {
        self.0.ends_with("/...")
    }

    fn prefix(&self) -> &str {
        self.0.trim_end_matches("...")
    }

    pub fn test(&self, url: &str) -> bool {
        if self.is_prefix_pattern() {
            let prefix = self.prefix();
            return url.starts_with(prefix) || url == prefix.trim_end_matches('/');
        }
        self.0 == url
    }

    pub fn includes_pattern(&self, other: &UrlPattern) -> bool {
        if self == other {
            return true;
        }
        self.is_prefix_pattern()
            && other.is_prefix_pattern()
            && other.prefix().starts_with(self.prefix())
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UrlPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_path_patterns() {
        let pattern = PathPattern::from("/tmp/...");
        assert!(pattern.test(&AbsolutePath::from("/tmp/a.txt")));
        assert!(pattern.test(&AbsolutePath::from("/tmp/a/b/c")));
        assert!(pattern.test(&AbsolutePath::from("/tmp")));
        assert!(!pattern.test(&AbsolutePath::from("/home/user")));
        assert!(!pattern.test(&AbsolutePath::from("/tmpfoo")));
    }

    #[test]
    fn wildcard_path_patterns() {
        let pattern = PathPattern::from("/logs/*.log");
        assert!(pattern.test(&AbsolutePath::from("/logs/app.log")));
        assert!(pattern.test(&AbsolutePath::from("/logs/.log")));
        assert!(!pattern.test(&AbsolutePath::from("/logs/app.txt")));
        assert!(!pattern.test(&AbsolutePath::from("/logs/sub/app.log")));
    }

    #[test]
    fn prefix_pattern_inclusion_is_reflexive_and_narrowing() {
        let wide = PathPattern::from("/a/...");
        let narrow = PathPattern::from("/a/b/...");
        assert!(wide.includes_pattern(&wide));
        assert!(wide.includes_pattern(&narrow));
        assert!(!narrow.includes_pattern(&wide));
    }

    #[test]
    fn host_patterns_match_subdomains() {
        let deep = HostPattern::from("**.example.com");
        assert!(deep.test(&Host::from("a.example.com")));
        assert!(deep.test(&Host::from("a.b.example.com")));
        assert!(deep.test(&Host::from("example.com")));
        assert!(!deep.test(&Host::from("example.org")));
        assert!(!deep.test(&Host::from("badexample.com")));

        let single = HostPattern::from("*.example.com");
        assert!(single.test(&Host::from("a.example.com")));
        assert!(!single.test(&Host::from("a.b.example.com")));
        assert!(!single.test(&Host::from("example.com")));
    }

    #[test]
    fn host_patterns_respect_schemes() {
        let pattern = HostPattern::from("https://**.example.com");
        assert!(pattern.test(&Host::from("https://api.example.com")));
        assert!(!pattern.test(&Host::from("wss://api.example.com")));
    }

    #[test]
    fn host_pattern_inclusion() {
        let deep = HostPattern::from("**.example.com");
        assert!(deep.includes_pattern(&HostPattern::from("**.sub.example.com")));
        assert!(deep.includes_pattern(&HostPattern::from("*.example.com")));
        assert!(!HostPattern::from("*.example.com").includes_pattern(&deep));
    }

    #[test]
    fn url_prefix_patterns() {
        let pattern = UrlPattern::from("https://example.com/api/...");
        assert!(pattern.test("https://example.com/api/users"));
        assert!(pattern.test("https://example.com/api"));
        assert!(!pattern.test("https://example.com/other"));

        let narrower = UrlPattern::from("https://example.com/api/v2/...");
        assert!(pattern.includes_pattern(&narrower));
        assert!(!narrower.includes_pattern(&pattern));
    }
}
