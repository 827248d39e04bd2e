//! # HTTP Presentation Options
//!
//! The store engine knows nothing about HTTP. This module holds the options a
//! transport layer needs to present it, and the one piece of presentation
//! logic that belongs with them: URL canonicalization.
//!
//! ## Canonical URLs
//!
//! Resource URLs that differ only in query parameter order name the same
//! resource. With [`MiddlewareOptions::use_canonical_urls`] on, a transport
//! redirects such requests to the canonical form, which keeps HTTP caches
//! from storing one page under several keys:
//!
//! ```text
//! /streams/order-1?maxCount=20&d=f   ──308──►  /streams/order-1?d=f&maxCount=20
//! ```
//!
//! Parameters are ordered by key (ASCII case-insensitive); parameters with the
//! same key keep their relative order.

/// Options for an HTTP layer sitting on top of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareOptions {
    /// Redirect requests whose query string is not in canonical order.
    pub use_canonical_urls: bool,
    /// Server version advertised by the transport.
    pub server_version: String,
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        Self {
            use_canonical_urls: true,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl MiddlewareOptions {
    pub fn with_canonical_urls(mut self, enabled: bool) -> Self {
        self.use_canonical_urls = enabled;
        self
    }

    /// Returns the URL to redirect to, or `None` to serve the request as-is.
    ///
    /// `query` is the raw query string without the leading `?`.
    pub fn canonical_redirect(&self, path: &str, query: &str) -> Option<String> {
        if !self.use_canonical_urls {
            return None;
        }
        let canonical = canonical_query(query);
        if canonical == query {
            return None;
        }
        Some(if canonical.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{canonical}")
        })
    }
}

/// Reorders a raw query string into canonical form. Empty pairs are dropped.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    // `sort_by` is stable, so repeated keys keep their order.
    pairs.sort_by(|a, b| {
        let key = |p: &str| p.split('=').next().unwrap_or_default().to_ascii_lowercase();
        key(a).cmp(&key(b))
    });
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_canonical_urls() {
        let options = MiddlewareOptions::default();
        assert!(options.use_canonical_urls);
        assert!(!options.server_version.is_empty());
    }

    #[test]
    fn test_redirects_unordered_query() {
        let options = MiddlewareOptions::default();
        assert_eq!(
            options.canonical_redirect("/streams/order-1", "maxCount=20&d=f"),
            Some("/streams/order-1?d=f&maxCount=20".to_string())
        );
        assert_eq!(options.canonical_redirect("/streams/order-1", "d=f&maxCount=20"), None);
        assert_eq!(options.canonical_redirect("/stream", ""), None);
    }

    #[test]
    fn test_disabled_never_redirects() {
        let options = MiddlewareOptions::default().with_canonical_urls(false);
        assert_eq!(options.canonical_redirect("/stream", "p=1&d=b"), None);
    }

    #[test]
    fn test_canonical_query_rules() {
        assert_eq!(canonical_query("B=2&a=1"), "a=1&B=2");
        assert_eq!(canonical_query("k=2&a&k=1"), "a&k=2&k=1");
        assert_eq!(canonical_query("&&x=1&"), "x=1");
    }
}
