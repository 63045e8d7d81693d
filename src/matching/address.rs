//! Street address normalization.
//!
//! Import sources spell the same address many ways ("123 Main Street",
//! "123 main st."). When `address_line_1` is a matching column, the normalized
//! form is what gets compared.

use std::sync::OnceLock;

use regex::Regex;

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("terrace", "ter"),
    ("circle", "cir"),
    ("square", "sq"),
    ("suite", "ste"),
    ("apartment", "apt"),
    ("building", "bldg"),
    ("floor", "fl"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("northeast", "ne"),
    ("northwest", "nw"),
    ("southeast", "se"),
    ("southwest", "sw"),
];

fn punctuation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}\s\-/]").expect("static address regex"))
}

fn ordinal_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(st|nd|rd|th)$").expect("static address regex"))
}

/// Normalizes a street address for comparison.
///
/// Returns `None` when nothing but punctuation and whitespace remains.
///
/// # Examples
///
/// ```
/// use matchlink::matching::normalize_address;
///
/// assert_eq!(
///     normalize_address("123 Main Street, Suite #4"),
///     normalize_address("123 main st ste 4"),
/// );
/// ```
#[must_use]
pub fn normalize_address(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let stripped = punctuation().replace_all(&lowered, " ");
    let tokens: Vec<String> = stripped
        .split_whitespace()
        .map(|token| {
            if let Some(caps) = ordinal_suffix().captures(token) {
                return caps[1].to_string();
            }
            ABBREVIATIONS
                .iter()
                .find(|(long, _)| *long == token)
                .map_or_else(|| token.to_string(), |(_, short)| (*short).to_string())
        })
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes_and_case() {
        assert_eq!(
            normalize_address("1600 Pennsylvania Avenue NorthWest").as_deref(),
            Some("1600 pennsylvania ave nw")
        );
    }

    #[test]
    fn test_ordinals_and_punctuation() {
        assert_eq!(
            normalize_address("  12 W. 42nd St.  ").as_deref(),
            Some("12 w 42 st")
        );
    }

    #[test]
    fn test_blank_is_none() {
        assert_eq!(normalize_address(" ., "), None);
    }
}
