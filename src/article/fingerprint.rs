//! URL canonicalisation and fingerprinting
//!
//! Two candidates that point at the same story through cosmetically
//! different URLs (scheme, `www.`, tracking parameters, fragment, trailing
//! slash, query order) get the same fingerprint.

use sha2::{Digest, Sha256};
use url::{form_urlencoded, Url};

/// Query parameters that never change what a URL points at.
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "ref_src",
    "source",
    "fbclid",
    "gclid",
    "dclid",
    "mc_cid",
    "mc_eid",
    "igshid",
    "yclid",
    "_hsenc",
    "_hsmi",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical form of a URL: no scheme, lowercase host without `www.`,
/// default port dropped, no fragment, no tracking parameters, remaining
/// query pairs sorted, no trailing slash.
///
/// Strings that do not parse as absolute URLs are trimmed and lowercased.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(u) if u.host_str().is_some() => u,
        _ => return trimmed.trim_end_matches('/').to_lowercase(),
    };

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut out = String::with_capacity(trimmed.len());
    out.push_str(host);
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    let path = parsed.path().trim_end_matches('/');
    out.push_str(path);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        // Re-encode: decoded values may contain `&` or `=`
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            if v.is_empty() {
                query.append_key_only(k);
            } else {
                query.append_pair(k, v);
            }
        }
        out.push('?');
        out.push_str(&query.finish());
    }
    out
}

/// SHA-256 (hex) of the canonical URL.
pub fn fingerprint(url: &str) -> String {
    let canonical = normalize_url(url);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_www_and_trailing_slash_are_ignored() {
        assert_eq!(
            normalize_url("https://www.Example.com/post/1/"),
            normalize_url("http://example.com/post/1")
        );
    }

    #[test]
    fn tracking_params_and_fragment_are_stripped() {
        let noisy = "https://example.com/a?utm_source=x&id=7&fbclid=abc#comments";
        assert_eq!(normalize_url(noisy), "example.com/a?id=7");
    }

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(
            fingerprint("https://example.com/a?b=2&a=1"),
            fingerprint("https://example.com/a?a=1&b=2")
        );
    }

    #[test]
    fn encoded_separators_in_values_stay_distinct() {
        let split = "https://example.com/a?a=1&b=2";
        let packed = "https://example.com/a?a=1%26b%3D2";
        assert_ne!(fingerprint(split), fingerprint(packed));
        assert_eq!(normalize_url(packed), "example.com/a?a=1%26b%3D2");
        assert_eq!(normalize_url("https://example.com/a?flag&id=3"), "example.com/a?flag&id=3");
    }

    #[test]
    fn different_paths_differ() {
        assert_ne!(
            fingerprint("https://example.com/a"),
            fingerprint("https://example.com/b")
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint("https://example.com");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unparseable_urls_fall_back_to_lowercase() {
        assert_eq!(normalize_url("  Not A URL/ "), "not a url");
    }
}
