//! Shared key normalization for every pipeline stage.
//! Used when building the skip set, when recording progress, when writing
//! the metadata log and when joining at merge time.
//!
//! CRITICAL: every component must derive keys through `normalize_key`.
//! A second normalization path means keys written by one stage stop
//! matching keys read by another.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Joins the normalized track and artist parts of a key.
/// Control characters are stripped from both parts, so this cannot occur
/// inside either of them.
pub const KEY_SEPARATOR: char = '\u{1F}';

/// Collapse any whitespace run into a single space
pub static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ============================================================================
// TRACK KEY
// ============================================================================

/// Normalized composite identity of a (track, artist) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackKey(String);

impl TrackKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into (track_norm, artist_norm).
    pub fn parts(&self) -> (&str, &str) {
        self.0
            .split_once(KEY_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    /// Both parts present. Incomplete keys are never looked up.
    pub fn is_complete(&self) -> bool {
        let (track, artist) = self.parts();
        !track.is_empty() && !artist.is_empty()
    }

    /// Rebuild a key from an already-stored string (progress store rows).
    pub fn from_stored(raw: String) -> Self {
        TrackKey(raw)
    }

    /// Human-readable form for logs and the CLI: `track :: artist`.
    pub fn display_pair(&self) -> String {
        let (track, artist) = self.parts();
        format!("{} :: {}", track, artist)
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_pair())
    }
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Fold typographic quotes to ASCII so they are stripped with the plain ones.
pub fn fold_quotes(s: &str) -> String {
    s.replace(['\u{2018}', '\u{2019}', '\u{00B4}', '\u{0060}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
}

/// Normalize one field: NFC, quotes and control characters removed,
/// whitespace collapsed, trimmed, lower-cased. Missing input is "".
pub fn normalize_field(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return String::new();
    };

    let composed: String = raw.nfc().collect();
    // Whitespace controls (tab, newline) survive here and collapse below
    let cleaned: String = fold_quotes(&composed)
        .chars()
        .filter(|c| *c != '\'' && *c != '"' && !(c.is_control() && !c.is_whitespace()))
        .collect();

    MULTI_SPACE
        .replace_all(cleaned.trim(), " ")
        .to_lowercase()
}

/// Canonical lookup key for a (track, artist) pair. Pure and total.
pub fn normalize_key(track: Option<&str>, artist: Option<&str>) -> TrackKey {
    let mut key = normalize_field(track);
    key.push(KEY_SEPARATOR);
    key.push_str(&normalize_field(artist));
    TrackKey(key)
}

/// Parse the CLI form `track::artist` into a key.
pub fn parse_key_arg(arg: &str) -> Option<TrackKey> {
    let (track, artist) = arg.split_once("::")?;
    Some(normalize_key(Some(track), Some(artist)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_whitespace_variants_match() {
        assert_eq!(
            normalize_key(Some("  Hello "), Some("World")),
            normalize_key(Some("hello"), Some("WORLD"))
        );
        assert_eq!(
            normalize_key(Some("Song   Name"), Some("Artist\tX")),
            normalize_key(Some("song name"), Some("artist x"))
        );
    }

    #[test]
    fn test_normalize_field_basic() {
        assert_eq!(normalize_field(Some("  Hey Jude  ")), "hey jude");
        assert_eq!(normalize_field(Some("Don't Stop")), "dont stop");
        assert_eq!(normalize_field(Some("Don\u{2019}t Stop")), "dont stop");
        assert_eq!(normalize_field(Some("\"Heroes\"")), "heroes");
        assert_eq!(normalize_field(None), "");
    }

    #[test]
    fn test_composed_and_decomposed_accents_match() {
        let composed = normalize_field(Some("Beyonc\u{e9}"));
        let decomposed = normalize_field(Some("Beyonce\u{301}"));
        assert_eq!(composed, decomposed);
        assert_eq!(composed, "beyonc\u{e9}");
    }

    #[test]
    fn test_idempotent() {
        let once = normalize_field(Some("  The  \"Wall\" "));
        let twice = normalize_field(Some(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_separator_cannot_be_forged() {
        // A track containing the separator must not collide with a split pair
        let forged = normalize_key(Some("a\u{1F}b"), Some("c"));
        let real = normalize_key(Some("a"), Some("b\u{1F}c"));
        assert_ne!(forged, real);
        assert_eq!(forged.parts(), ("ab", "c"));
    }

    #[test]
    fn test_concatenation_ambiguity() {
        assert_ne!(
            normalize_key(Some("ab"), Some("c")),
            normalize_key(Some("a"), Some("bc"))
        );
    }

    #[test]
    fn test_missing_inputs() {
        let key = normalize_key(None, Some("Artist"));
        assert_eq!(key.parts(), ("", "artist"));
        assert!(!key.is_complete());
        assert!(normalize_key(Some("Song"), Some("Artist")).is_complete());
        assert!(!normalize_key(Some("   "), Some("Artist")).is_complete());
    }

    #[test]
    fn test_parse_key_arg() {
        assert_eq!(
            parse_key_arg("Song A::Artist X"),
            Some(normalize_key(Some("song a"), Some("artist x")))
        );
        assert_eq!(parse_key_arg("no separator"), None);
    }
}
