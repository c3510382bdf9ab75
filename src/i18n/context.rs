//! Scoped current-locale and available-locales state.
//!
//! A `LocaleContext` is an explicit value owned by one logical task (a
//! request, a job, a test). Nothing here is global or thread-local: two tasks
//! holding their own contexts can never observe each other's overrides.
//!
//! Resolution chain for both the current locale and the available set:
//! explicit override, then the context's `LocaleDefaults`, which themselves
//! fall back to the process defaults.

use crate::i18n::{Locale, LocaleDefaults};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LocaleContext {
    defaults: Arc<LocaleDefaults>,
    locale: Option<Locale>,
    available_locales: Option<BTreeSet<Locale>>,
}

impl LocaleContext {
    pub fn new(defaults: LocaleDefaults) -> Self {
        Self::with_defaults(Arc::new(defaults))
    }

    /// Create a context sharing an existing defaults instance.
    pub fn with_defaults(defaults: Arc<LocaleDefaults>) -> Self {
        Self {
            defaults,
            locale: None,
            available_locales: None,
        }
    }

    pub fn defaults(&self) -> &LocaleDefaults {
        &self.defaults
    }

    /// The locale in effect: the override if set, otherwise the default.
    pub fn current_locale(&self) -> Locale {
        self.locale
            .clone()
            .unwrap_or_else(|| self.defaults.locale().clone())
    }

    /// Override the current locale. `None` reverts to the default locale
    /// rather than storing an empty value.
    pub fn set_current_locale(&mut self, locale: Option<Locale>) {
        self.locale = locale;
    }

    pub fn available_locales(&self) -> &BTreeSet<Locale> {
        self.available_locales
            .as_ref()
            .unwrap_or_else(|| self.defaults.available_locales())
    }

    /// Override the available locales. `None` reverts to the defaults.
    pub fn set_available_locales(&mut self, locales: Option<BTreeSet<Locale>>) {
        self.available_locales = locales;
    }

    pub fn is_available(&self, locale: &Locale) -> bool {
        self.available_locales().contains(locale)
    }

    /// Run `f` with the current locale temporarily set to `locale`.
    ///
    /// The previous override is restored however `f` exits: a normal return,
    /// an `Err` it hands back, or a panic (which is resumed after restoring).
    pub fn with_locale<T>(&mut self, locale: Locale, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.locale.replace(locale);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *self)));
        self.locale = previous;
        match outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Derive an independent context pinned to `locale`.
    ///
    /// Useful across `.await` points where `with_locale` cannot hold a
    /// mutable borrow.
    pub fn scoped(&self, locale: Locale) -> Self {
        let mut scoped = self.clone();
        scoped.locale = Some(locale);
        scoped
    }
}

impl Default for LocaleContext {
    fn default() -> Self {
        Self::with_defaults(LocaleDefaults::process())
    }
}
