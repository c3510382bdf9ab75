//! Per-locale translation records.
//!
//! A `Translation` holds the translated attribute values of one entity in one
//! locale. It refers to its owner only by id; the owning `Record` keeps the
//! translations by value.

use crate::error::{Result, ValidationError, ValidationErrorKind};
use crate::i18n::Locale;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Translation {
    id: Option<i64>,
    entity_id: Option<i64>,
    locale: Option<Locale>,
    attributes: BTreeMap<String, Value>,
    changed: bool,
    marked_for_destruction: bool,
    destroyed: bool,
    errors: Vec<ValidationError>,
}

impl Translation {
    /// Build an unsaved translation.
    pub fn new(locale: Option<Locale>) -> Self {
        Self {
            locale,
            changed: true,
            ..Self::default()
        }
    }

    pub(crate) fn from_row(
        id: i64,
        entity_id: i64,
        locale: Locale,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: Some(id),
            entity_id: Some(entity_id),
            locale: Some(locale),
            attributes,
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Id of the owning entity, once it has been saved.
    pub fn entity_id(&self) -> Option<i64> {
        self.entity_id
    }

    /// The canonical locale, or `None` if unset.
    pub fn locale(&self) -> Option<&Locale> {
        self.locale.as_ref()
    }

    pub fn set_locale(&mut self, locale: Option<Locale>) {
        if self.locale != locale {
            self.locale = locale;
            self.changed = true;
        }
    }

    /// Set the locale from its text form (`"en"`, `"EN_us"`, ...).
    pub fn set_locale_text(&mut self, raw: &str) -> Result<()> {
        let locale = Locale::parse(raw)?;
        self.set_locale(Some(locale));
        Ok(())
    }

    /// Read a translated attribute; unset attributes read as `Value::Null`.
    pub fn get(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if self.attributes.get(name) != Some(&value) {
            self.attributes.insert(name.to_string(), value);
            self.changed = true;
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn is_new_record(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some() && !self.destroyed
    }

    /// Whether there are unsaved changes.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Schedule removal on the owner's next save.
    pub fn mark_for_destruction(&mut self) {
        self.marked_for_destruction = true;
    }

    pub fn is_marked_for_destruction(&self) -> bool {
        self.marked_for_destruction
    }

    pub(crate) fn unmark_for_destruction(&mut self) {
        self.marked_for_destruction = false;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Neither destroyed nor scheduled for destruction.
    pub fn is_live(&self) -> bool {
        !self.destroyed && !self.marked_for_destruction
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Check presence and inclusion of the locale.
    ///
    /// `available` is read on every call, so changes to the caller's
    /// available locales apply to the next validation.
    pub fn validate(&mut self, available: &BTreeSet<Locale>) -> bool {
        self.errors.clear();
        match &self.locale {
            None => self
                .errors
                .push(ValidationError::new("locale", ValidationErrorKind::Presence)),
            Some(locale) if !available.contains(locale) => self
                .errors
                .push(ValidationError::new("locale", ValidationErrorKind::Inclusion)),
            Some(_) => {}
        }
        self.errors.is_empty()
    }

    pub(crate) fn set_entity_id(&mut self, entity_id: Option<i64>) {
        self.entity_id = entity_id;
    }

    pub(crate) fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub(crate) fn add_error(&mut self, error: ValidationError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }

    pub(crate) fn mark_saved(&mut self, id: i64, entity_id: i64) {
        self.id = Some(id);
        self.entity_id = Some(entity_id);
        self.changed = false;
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
        self.marked_for_destruction = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locale(code: &str) -> Locale {
        Locale::parse(code).unwrap()
    }

    fn available() -> BTreeSet<Locale> {
        [locale("en"), locale("fr")].into_iter().collect()
    }

    // ==================== Locale Tests ====================

    #[test]
    fn test_locale_accessors() {
        let mut translation = Translation::new(None);
        translation.set_locale(Some(locale("en")));
        assert_eq!(translation.locale(), Some(&locale("en")));
    }

    #[test]
    fn test_locale_is_always_canonical() {
        let mut translation = Translation::new(None);
        translation.set_locale_text("EN").expect("Should parse");
        assert_eq!(translation.locale(), Some(&locale("en")));
        assert_eq!(translation.locale().unwrap().as_str(), "en");
    }

    #[test]
    fn test_set_locale_text_rejects_garbage() {
        let mut translation = Translation::new(Some(locale("en")));
        assert!(translation.set_locale_text("not a locale").is_err());
        assert_eq!(translation.locale(), Some(&locale("en")));
    }

    // ==================== Attribute Tests ====================

    #[test]
    fn test_attribute_accessors() {
        let mut translation = Translation::new(Some(locale("en")));
        translation.set("title", "title");
        assert_eq!(translation.get("title"), Value::from("title"));
        assert!(translation.get("missing").is_null());
    }

    #[test]
    fn test_set_same_value_keeps_clean() {
        let attributes = BTreeMap::from([("title".to_string(), Value::from("a"))]);
        let mut translation = Translation::from_row(1, 1, locale("en"), attributes);
        assert!(!translation.is_changed());
        translation.set("title", "a");
        assert!(!translation.is_changed());
        translation.set("title", "b");
        assert!(translation.is_changed());
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_valid_with_available_locale() {
        let mut translation = Translation::new(Some(locale("en")));
        assert!(translation.validate(&available()));
        assert!(translation.is_valid());
    }

    #[test]
    fn test_invalid_without_locale() {
        let mut translation = Translation::new(None);
        assert!(!translation.validate(&available()));
        assert_eq!(
            translation.errors(),
            &[ValidationError::new("locale", ValidationErrorKind::Presence)]
        );
    }

    #[test]
    fn test_invalid_with_unavailable_locale() {
        let mut translation = Translation::new(Some(locale("de")));
        assert!(!translation.validate(&available()));
        assert_eq!(
            translation.errors(),
            &[ValidationError::new("locale", ValidationErrorKind::Inclusion)]
        );
    }

    #[test]
    fn test_validation_uses_current_available_set() {
        let mut translation = Translation::new(Some(locale("de")));
        assert!(!translation.validate(&available()));

        let mut widened = available();
        widened.insert(locale("de"));
        assert!(translation.validate(&widened));
    }

    // ==================== State Tests ====================

    #[test]
    fn test_new_translation_state() {
        let translation = Translation::new(Some(locale("en")));
        assert!(translation.is_new_record());
        assert!(!translation.is_persisted());
        assert!(translation.is_changed());
        assert!(translation.is_live());
    }

    #[test]
    fn test_mark_for_destruction() {
        let mut translation = Translation::new(Some(locale("en")));
        translation.mark_for_destruction();
        assert!(translation.is_marked_for_destruction());
        assert!(!translation.is_destroyed());
        assert!(!translation.is_live());
    }

    #[test]
    fn test_saved_then_destroyed() {
        let mut translation = Translation::new(Some(locale("en")));
        translation.mark_saved(10, 3);
        assert_eq!(translation.id(), Some(10));
        assert_eq!(translation.entity_id(), Some(3));
        assert!(translation.is_persisted());
        assert!(!translation.is_changed());

        translation.mark_destroyed();
        assert!(translation.is_destroyed());
        assert!(!translation.is_persisted());
    }
}
