//! Endpoint identifiers.
//!
//! Identifiers are opaque strings exchanged out of band (typed, scanned or
//! carried in a share link). The spelling as first given is what gets stored and
//! displayed; every comparison goes through [`normalize`] so that manual
//! transcription differences in case or surrounding whitespace still match.

use rand_core::{OsRng, RngCore};
use thiserror::Error;

/// Query parameter carrying the identifier in a share link.
pub const SHARE_LINK_PARAM: &str = "connect";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("share link has no `{SHARE_LINK_PARAM}` parameter")]
    MissingParam,
}

/// Comparison key for an identifier: trimmed and lowercased.
pub fn normalize(id: &str) -> String {
    id.trim().to_lowercase()
}

/// Case- and whitespace-insensitive identifier equality.
pub fn matches(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Trim an identifier for storage, rejecting blank input.
pub fn canonical(id: &str) -> Result<String, IdentifierError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(IdentifierError::Empty);
    }
    Ok(trimmed.to_string())
}

/// Generate a fresh local identifier (8 lowercase hex chars).
pub fn generate() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build a share link that hands `id` to another device.
pub fn share_link(base_url: &str, id: &str) -> String {
    let base = base_url.split('?').next().unwrap_or(base_url);
    format!("{}?{}={}", base, SHARE_LINK_PARAM, id)
}

/// Extract an identifier from either a share link or a bare identifier.
pub fn from_share_link(text: &str) -> Result<String, IdentifierError> {
    let text = text.trim();
    let marker = format!("?{}=", SHARE_LINK_PARAM);
    let alt_marker = format!("&{}=", SHARE_LINK_PARAM);

    let Some(query_start) = text.find('?') else {
        return canonical(text);
    };

    let query = &text[query_start..];
    let value_start = query
        .find(&marker)
        .map(|i| i + marker.len())
        .or_else(|| query.find(&alt_marker).map(|i| i + alt_marker.len()))
        .ok_or(IdentifierError::MissingParam)?;

    let value = &query[value_start..];
    let value = value.split(['&', '#']).next().unwrap_or("");
    canonical(value)
}
