//! URL handling for crawl-keeper
//!
//! Frontier entries are deduplicated by their normalized form, and links found
//! on rendered pages are resolved and filtered here before they can extend a
//! job's frontier.

mod matcher;
mod normalize;

pub use matcher::matches_wildcard;
pub use normalize::normalize_url;

use url::Url;

/// Extracts the lowercase host from a URL
pub fn extract_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Resolves an `href` found on a page into a normalized absolute URL
///
/// Returns `None` for non-navigational links (`javascript:`, `mailto:`,
/// `tel:`, data URIs, bare fragments) and anything that does not resolve to
/// an HTTP(S) URL.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return None;
    }

    let absolute = base.join(href).ok()?;
    normalize_url(absolute.as_str()).ok()
}

/// Decides whether a discovered link may join a frontier
///
/// With no patterns, only links on the same host as the page qualify;
/// otherwise the link's host must match one of the patterns.
pub fn is_host_allowed(link: &Url, page: &Url, patterns: &[String]) -> bool {
    let Some(host) = extract_host(link) else {
        return false;
    };

    if patterns.is_empty() {
        return extract_host(page).as_deref() == Some(host.as_str());
    }

    patterns
        .iter()
        .any(|pattern| matches_wildcard(&pattern.to_lowercase(), &host))
}
