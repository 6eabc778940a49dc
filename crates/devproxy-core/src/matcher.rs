//! URL-to-watch matching: decides which requests the proxy even bothers routing
//! through the plugin pipeline, and which hosts are worth MITM-ing at the TLS layer.

use regex::Regex;

use crate::error::ProxyError;

/// One line of a urlsToWatch list: a glob-style pattern and whether it excludes
/// rather than includes matching traffic.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pub source: String,
    pub exclude: bool,
}

impl UrlPattern {
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            source: pattern.into(),
            exclude: false,
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            source: pattern.into(),
            exclude: true,
        }
    }

    /// `!pattern` is parsed as an exclude entry, matching the config file convention.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(rest) => Self::exclude(rest),
            None => Self::include(raw),
        }
    }
}

struct Compiled {
    exclude: bool,
    host: Regex,
    full: Regex,
}

/// A compiled set of url-to-watch patterns, ready to answer match queries on the
/// hot path without re-parsing anything.
pub struct WatchSet {
    compiled: Vec<Compiled>,
}

impl WatchSet {
    pub fn compile(patterns: &[UrlPattern]) -> Result<Self, ProxyError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let (scheme, host, path) = split_pattern(&pattern.source);

            let host_src = format!("(?i)^{}$", wildcard_to_regex(host));
            let host = Regex::new(&host_src)
                .map_err(|e| ProxyError::InvalidWatchPattern(pattern.source.clone(), e))?;

            let scheme_src = match scheme {
                Some(s) => regex::escape(s),
                None => "https?".to_string(),
            };
            let path_src = match path {
                Some(p) => wildcard_to_regex(p),
                None => ".*".to_string(),
            };
            let full_src = format!(
                "(?i)^{scheme}://{host}{path}$",
                scheme = scheme_src,
                host = wildcard_to_regex(host),
                path = path_src,
            );
            let full = Regex::new(&full_src)
                .map_err(|e| ProxyError::InvalidWatchPattern(pattern.source.clone(), e))?;

            compiled.push(Compiled {
                exclude: pattern.exclude,
                host,
                full,
            });
        }
        Ok(Self { compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Used by the CONNECT handler, which only ever sees a bare hostname.
    pub fn is_host_watched(&self, host: &str) -> bool {
        let mut matched = false;
        for entry in &self.compiled {
            if entry.host.is_match(host) {
                if entry.exclude {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }

    /// Used once the full request line (scheme, host, path, query) is known.
    pub fn is_url_watched(&self, url: &str) -> bool {
        let mut matched = false;
        for entry in &self.compiled {
            if entry.full.is_match(url) {
                if entry.exclude {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// Translates `*`-glob syntax into an (unanchored) regex source fragment.
/// Exposed so other crates that need the same glob semantics (the
/// mock-response engine's URL matching) don't reimplement it.
pub fn wildcard_to_regex(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for ch in src.chars() {
        if ch == '*' {
            out.push_str(".*");
        } else {
            out.push_str(&regex::escape(&ch.to_string()));
        }
    }
    out
}

/// Splits `[scheme://]host[/path]` into its parts. A missing scheme matches
/// both http and https; a missing path matches any path under that host.
fn split_pattern(pattern: &str) -> (Option<&str>, &str, Option<&str>) {
    if let Some(rest) = pattern.strip_prefix("https://") {
        let (host, path) = split_host_path(rest);
        (Some("https"), host, path)
    } else if let Some(rest) = pattern.strip_prefix("http://") {
        let (host, path) = split_host_path(rest);
        (Some("http"), host, path)
    } else {
        let (host, path) = split_host_path(pattern);
        (None, host, path)
    }
}

fn split_host_path(s: &str) -> (&str, Option<&str>) {
    match s.find('/') {
        Some(idx) => (&s[..idx], Some(&s[idx..])),
        None => (s, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_pattern_matches_any_path() {
        let set = WatchSet::compile(&[UrlPattern::include("jsonplaceholder.typicode.com")]).unwrap();
        assert!(set.is_host_watched("jsonplaceholder.typicode.com"));
        assert!(set.is_url_watched("https://jsonplaceholder.typicode.com/posts/1"));
        assert!(set.is_url_watched("http://jsonplaceholder.typicode.com/"));
        assert!(!set.is_host_watched("example.com"));
    }

    #[test]
    fn scheme_pins_to_that_scheme_only() {
        let set = WatchSet::compile(&[UrlPattern::include("https://api.example.com/*")]).unwrap();
        assert!(set.is_url_watched("https://api.example.com/v1/users"));
        assert!(!set.is_url_watched("http://api.example.com/v1/users"));
    }

    #[test]
    fn exclude_overrides_include() {
        let set = WatchSet::compile(&[
            UrlPattern::include("*.example.com/*"),
            UrlPattern::exclude("*.example.com/health"),
        ])
        .unwrap();
        assert!(set.is_url_watched("https://api.example.com/users"));
        assert!(!set.is_url_watched("https://api.example.com/health"));
    }

    #[test]
    fn wildcard_host_matches_subdomains() {
        let set = WatchSet::compile(&[UrlPattern::include("*.typicode.com/*")]).unwrap();
        assert!(set.is_host_watched("jsonplaceholder.typicode.com"));
        assert!(!set.is_host_watched("typicode.org"));
    }

    #[test]
    fn bang_prefix_parses_as_exclude() {
        let pattern = UrlPattern::parse("!https://api.example.com/internal/*");
        assert!(pattern.exclude);
        assert_eq!(pattern.source, "https://api.example.com/internal/*");
    }
}
