//! Relay URL normalization.
//!
//! Relay records are keyed by URL, so cosmetic variations (trailing
//! slashes, host case, default ports) must collapse to one key.
//!
//! # Normalization Rules
//!
//! - Scheme must be `ws://` or `wss://`
//! - Lowercase the host
//! - Drop default ports (80 for ws, 443 for wss)
//! - Remove trailing slashes from the path

use url::Url;

use crate::error::{Error, Result};

/// Normalize a relay URL.
///
/// # Examples
///
/// ```
/// use relay_mesh::relay_url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").unwrap(),
///     "wss://relay.example.com"
/// );
/// assert!(normalize_relay_url("https://relay.example.com").is_err());
/// ```
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();

    if !trimmed.starts_with("wss://") && !trimmed.starts_with("ws://") {
        return Err(Error::Validation(format!(
            "Relay URL must start with wss:// or ws://: {}",
            trimmed
        )));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| Error::Validation(format!("Invalid relay URL {}: {}", trimmed, e)))?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Validation(format!("Relay URL has no host: {}", trimmed)))?;

    let mut normalized = format!("{}://{}", parsed.scheme(), host.to_lowercase());

    // `Url::port` is already `None` for the scheme's default port.
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }

    let path = parsed.path().trim_end_matches('/');
    normalized.push_str(path);

    if let Some(query) = parsed.query() {
        normalized.push('?');
        normalized.push_str(query);
    }

    Ok(normalized)
}

/// Normalize and deduplicate a list of relay URLs, dropping invalid ones.
///
/// Order of first occurrence is preserved.
pub fn normalize_relay_urls<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        match normalize_relay_url(url.as_ref()) {
            Ok(normalized) => {
                if seen.insert(normalized.clone()) {
                    out.push(normalized);
                }
            }
            Err(e) => tracing::debug!("Skipping relay URL: {}", e),
        }
    }
    out
}
