//! Locale defaults: the fallback source for the current and available locales.
//!
//! A `LocaleContext` without overrides resolves against a `LocaleDefaults`.
//! Applications usually build one from `Config`; when nothing is supplied the
//! process-wide defaults are used. They are initialized once with `OnceLock`
//! and stay immutable thereafter.

use crate::i18n::Locale;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// Default locale and available-locale set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleDefaults {
    locale: Locale,
    available: BTreeSet<Locale>,
}

/// Process defaults instance (initialized lazily)
static PROCESS_DEFAULTS: OnceLock<Arc<LocaleDefaults>> = OnceLock::new();

/// Locale used when no configuration is supplied at all.
pub const PROCESS_DEFAULT_LOCALE: &str = "en";

impl LocaleDefaults {
    /// Create defaults from a locale and an available set.
    ///
    /// The default locale is always made a member of the available set.
    pub fn new(locale: Locale, available: impl IntoIterator<Item = Locale>) -> Self {
        let mut available: BTreeSet<Locale> = available.into_iter().collect();
        available.insert(locale.clone());
        Self { locale, available }
    }

    /// Get the process-wide defaults (`en`, with `{en}` available).
    pub fn process() -> Arc<LocaleDefaults> {
        Arc::clone(PROCESS_DEFAULTS.get_or_init(|| {
            let locale =
                Locale::parse(PROCESS_DEFAULT_LOCALE).expect("Process default locale should be valid");
            Arc::new(LocaleDefaults::new(locale.clone(), [locale]))
        }))
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    pub fn available_locales(&self) -> &BTreeSet<Locale> {
        &self.available
    }

    /// Check if a locale is in the available set.
    pub fn is_available(&self, locale: &Locale) -> bool {
        self.available.contains(locale)
    }
}

impl Default for LocaleDefaults {
    fn default() -> Self {
        LocaleDefaults::process().as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locale(code: &str) -> Locale {
        Locale::parse(code).unwrap()
    }

    #[test]
    fn test_process_defaults() {
        let defaults = LocaleDefaults::process();
        assert_eq!(defaults.locale(), &locale("en"));
        assert_eq!(defaults.available_locales().len(), 1);
        assert!(defaults.is_available(&locale("en")));
    }

    #[test]
    fn test_process_defaults_are_shared() {
        let a = LocaleDefaults::process();
        let b = LocaleDefaults::process();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_new_includes_default_in_available() {
        let defaults = LocaleDefaults::new(locale("fr"), [locale("en")]);
        assert!(defaults.is_available(&locale("fr")));
        assert!(defaults.is_available(&locale("en")));
        assert!(!defaults.is_available(&locale("de")));
    }

    #[test]
    fn test_default_matches_process() {
        assert_eq!(LocaleDefaults::default(), *LocaleDefaults::process());
    }
}
