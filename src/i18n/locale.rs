//! Locale type: canonical, validated locale token.
//!
//! Locales arrive as text in many spellings (`en`, `EN`, `en_us`, `en-US`).
//! This module provides the `Locale` type, which always holds the canonical
//! spelling so comparisons and storage never depend on how the caller wrote it.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A canonical locale token (e.g., `en`, `fr`, `pt-BR`, `zh-Hant`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locale(Arc<str>);

impl Locale {
    /// Parse and canonicalize a locale.
    ///
    /// Subtags may be separated by `-` or `_`. The primary subtag is
    /// lower-cased, two-letter region subtags are upper-cased and four-letter
    /// script subtags are title-cased.
    ///
    /// # Returns
    /// * `Ok(Locale)` with the canonical spelling
    /// * `Err(Error::InvalidLocale)` if the input is empty or malformed
    ///
    /// # Example
    /// ```
    /// use capito::Locale;
    ///
    /// let locale = Locale::parse("EN_us").unwrap();
    /// assert_eq!(locale.as_str(), "en-US");
    /// ```
    pub fn parse(raw: &str) -> Result<Locale> {
        let trimmed = raw.trim();
        let invalid = || Error::InvalidLocale {
            value: raw.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut subtags = Vec::new();
        for (index, subtag) in trimmed.split(['-', '_']).enumerate() {
            if subtag.is_empty()
                || subtag.len() > 8
                || !subtag.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(invalid());
            }
            subtags.push(canonical_subtag(index, subtag));
        }

        Ok(Locale(Arc::from(subtags.join("-"))))
    }

    /// Get the canonical spelling.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the primary language subtag (`pt` for `pt-BR`).
    pub fn language(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

fn canonical_subtag(index: usize, subtag: &str) -> String {
    let alphabetic = subtag.chars().all(|c| c.is_ascii_alphabetic());
    match (index, subtag.len()) {
        (0, _) => subtag.to_ascii_lowercase(),
        (_, 2) if alphabetic => subtag.to_ascii_uppercase(),
        (_, 4) if alphabetic => {
            let lower = subtag.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => lower,
            }
        }
        _ => subtag.to_ascii_lowercase(),
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Locale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Locale::parse(s)
    }
}

impl TryFrom<&str> for Locale {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Locale::parse(value)
    }
}

impl TryFrom<String> for Locale {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Locale::parse(&value)
    }
}

impl AsRef<str> for Locale {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Locale {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Locale {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Locale::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ==================== parse Tests ====================

    #[test]
    fn test_parse_simple() {
        let locale = Locale::parse("en").expect("Should parse");
        assert_eq!(locale.as_str(), "en");
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Locale::parse("FR").unwrap(), Locale::parse("fr").unwrap());
    }

    #[test]
    fn test_parse_region() {
        assert_eq!(Locale::parse("pt_br").unwrap().as_str(), "pt-BR");
        assert_eq!(Locale::parse("EN-us").unwrap().as_str(), "en-US");
    }

    #[test]
    fn test_parse_script() {
        assert_eq!(Locale::parse("zh-hant").unwrap().as_str(), "zh-Hant");
        assert_eq!(Locale::parse("sr_LATN_rs").unwrap().as_str(), "sr-Latn-RS");
    }

    #[test]
    fn test_parse_numeric_region() {
        assert_eq!(Locale::parse("es-419").unwrap().as_str(), "es-419");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(Locale::parse("  de ").unwrap().as_str(), "de");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(Locale::parse("").is_err());
        assert!(Locale::parse("   ").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Locale::parse("en--US").is_err());
        assert!(Locale::parse("en US").is_err());
        assert!(Locale::parse("en;drop").is_err());
        assert!(Locale::parse("abcdefghi").is_err());
    }

    #[test]
    fn test_language_subtag() {
        assert_eq!(Locale::parse("pt-BR").unwrap().language(), "pt");
        assert_eq!(Locale::parse("fr").unwrap().language(), "fr");
    }

    // ==================== Trait Tests ====================

    #[test]
    fn test_from_str_and_try_from() {
        let a: Locale = "fr".parse().unwrap();
        let b = Locale::try_from("FR").unwrap();
        let c = Locale::try_from("fr".to_string()).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let locale = Locale::parse("en_gb").unwrap();
        assert_eq!(serde_json::to_string(&locale).unwrap(), "\"en-GB\"");

        let parsed: Locale = serde_json::from_str("\"EN-gb\"").unwrap();
        assert_eq!(parsed, locale);

        assert!(serde_json::from_str::<Locale>("\"\"").is_err());
    }

    // ==================== Property Tests ====================

    proptest! {
        #[test]
        fn test_canonicalization_is_idempotent(raw in "[a-zA-Z]{2,3}([-_][a-zA-Z0-9]{2,8}){0,2}") {
            let once = Locale::parse(&raw).unwrap();
            let twice = Locale::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_spelling_does_not_matter(raw in "[a-z]{2}(_[a-z]{2})?") {
            let lower = Locale::parse(&raw).unwrap();
            let upper = Locale::parse(&raw.to_uppercase().replace('_', "-")).unwrap();
            prop_assert_eq!(lower, upper);
        }
    }
}
