//! Translatable entity instances.
//!
//! A `Record` owns its untranslated attributes and its collection of
//! per-locale `Translation`s. Attribute reads and writes dispatch through the
//! model's accessor registry; translated writes land on the translation for
//! the current locale, building it on first use.

use crate::error::{
    Error, ErrorReport, Result, TranslationErrors, ValidationError, ValidationErrorKind,
};
use crate::i18n::{Locale, LocaleContext};
use crate::model::{normalize_key, Model};
use crate::translation::Translation;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

/// Attribute name to value, as accepted by bulk assignment.
pub type AttributeMap = BTreeMap<String, Value>;

/// Field under which translation-level problems are reported on the entity.
const TRANSLATIONS_FIELD: &str = "translations";

#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<Model>,
    id: Option<i64>,
    attributes: AttributeMap,
    updated_at: Option<DateTime<Utc>>,
    translations: Vec<Translation>,
    changed: BTreeSet<String>,
    errors: Vec<ValidationError>,
    destroying: bool,
    destroyed: bool,
}

impl Record {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            id: None,
            attributes: AttributeMap::new(),
            updated_at: None,
            translations: Vec::new(),
            changed: BTreeSet::new(),
            errors: Vec::new(),
            destroying: false,
            destroyed: false,
        }
    }

    pub(crate) fn from_row(
        model: Arc<Model>,
        id: i64,
        attributes: AttributeMap,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Some(id),
            attributes,
            updated_at,
            ..Self::new(model)
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_new_record(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some() && !self.destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Set while the record itself is being destroyed.
    pub fn is_being_destroyed(&self) -> bool {
        self.destroying
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Untranslated attribute values.
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    // ==================== Attribute access ====================

    /// Read an attribute; translated ones are read in the current locale.
    pub fn get(&self, name: &str, ctx: &LocaleContext) -> Result<Value> {
        self.get_in(name, &ctx.current_locale())
    }

    /// Read an attribute, reading translated ones in `locale`.
    ///
    /// Returns `Value::Null` when there is no translation for `locale`; no
    /// translation is built as a side effect.
    pub fn get_in(&self, name: &str, locale: &Locale) -> Result<Value> {
        let accessor = self
            .model
            .accessor(name)
            .ok_or_else(|| Error::unknown_attribute(self.model.table_name(), name))?;
        Ok(accessor.get(self, locale))
    }

    /// Write an attribute; translated ones are written in the current locale.
    pub fn set(&mut self, name: &str, value: impl Into<Value>, ctx: &LocaleContext) -> Result<()> {
        self.set_in(name, value, &ctx.current_locale())
    }

    /// Write an attribute, writing translated ones in `locale`.
    pub fn set_in(&mut self, name: &str, value: impl Into<Value>, locale: &Locale) -> Result<()> {
        let model = Arc::clone(&self.model);
        let accessor = model
            .accessor(name)
            .ok_or_else(|| Error::unknown_attribute(model.table_name(), name))?;
        let value = value.into();
        if !accessor.column_type().accepts(&value) {
            return Err(Error::InvalidValue {
                name: name.to_string(),
                reason: format!("{} does not fit a {:?} column", value, accessor.column_type()),
            });
        }
        accessor.set(self, locale, value);
        Ok(())
    }

    pub(crate) fn attribute(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn write_attribute(&mut self, name: &str, value: Value) {
        if self.attributes.get(name) != Some(&value) {
            self.attributes.insert(name.to_string(), value);
            self.mark_changed(name);
        }
    }

    pub(crate) fn mark_changed(&mut self, name: &str) {
        self.changed.insert(name.to_string());
    }

    pub fn is_changed(&self, name: &str) -> bool {
        self.changed.contains(name)
    }

    /// Names of attributes changed since the last load or save.
    pub fn changed_attributes(&self) -> Vec<&str> {
        self.changed.iter().map(String::as_str).collect()
    }

    /// Whether the record or any of its translations has unsaved changes.
    pub fn has_changes(&self) -> bool {
        self.is_new_record()
            || !self.changed.is_empty()
            || self
                .translations
                .iter()
                .any(|t| t.is_changed() || t.is_marked_for_destruction())
    }

    // ==================== Translations ====================

    /// Translations held in memory, including unsaved and marked ones.
    pub fn translations(&self) -> &[Translation] {
        &self.translations
    }

    /// Find the in-memory translation for `locale`. Never queries or builds.
    pub fn translation(&self, locale: &Locale) -> Option<&Translation> {
        self.translations
            .iter()
            .find(|t| t.locale() == Some(locale))
    }

    pub fn translation_mut(&mut self, locale: &Locale) -> Option<&mut Translation> {
        self.translations
            .iter_mut()
            .find(|t| t.locale() == Some(locale))
    }

    /// Return the translation for `locale`, building an unsaved one if needed.
    ///
    /// A translation found while marked for destruction is kept instead.
    pub fn translation_or_build(&mut self, locale: &Locale) -> &mut Translation {
        let index = self.translation_index_or_build(locale);
        &mut self.translations[index]
    }

    /// Append a new translation without a locale.
    pub fn build_translation(&mut self) -> &mut Translation {
        let mut translation = Translation::new(None);
        translation.set_entity_id(self.id);
        self.translations.push(translation);
        let last = self.translations.len() - 1;
        &mut self.translations[last]
    }

    fn translation_index_or_build(&mut self, locale: &Locale) -> usize {
        if let Some(index) = self
            .translations
            .iter()
            .position(|t| t.locale() == Some(locale))
        {
            self.translations[index].unmark_for_destruction();
            return index;
        }
        let mut translation = Translation::new(Some(locale.clone()));
        translation.set_entity_id(self.id);
        self.translations.push(translation);
        self.translations.len() - 1
    }

    /// Locales of the live in-memory translations, saved or not.
    pub fn translated_locales(&self) -> BTreeSet<Locale> {
        self.translations
            .iter()
            .filter(|t| t.is_live())
            .filter_map(|t| t.locale().cloned())
            .collect()
    }

    /// Replace the translation set.
    ///
    /// Each entry must carry a `locale` key (`":locale"` is accepted too);
    /// the rest of its keys are translated attributes. Existing translations
    /// whose locale is absent from `entries` are marked for destruction and
    /// removed on the next save. Invalid input leaves the collection untouched
    /// and is reported under the `translations` field.
    pub fn set_translations<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = AttributeMap>,
    {
        let mut parsed = Vec::new();
        for entry in entries {
            match self.parse_translation_entry(entry) {
                Ok(entry) => parsed.push(entry),
                Err(kind) => return Err(self.reject_translations(kind)),
            }
        }

        let existing = self.translations.len();
        let mut kept = vec![false; existing];
        for (locale, attributes) in parsed {
            let index = self.translation_index_or_build(&locale);
            if index < existing {
                kept[index] = true;
            }
            for (name, value) in attributes {
                self.translations[index].set(&name, value);
                self.mark_changed(&name);
            }
        }

        for (translation, kept) in self.translations.iter_mut().zip(kept) {
            if !kept {
                translation.mark_for_destruction();
            }
        }
        Ok(())
    }

    /// `set_translations` from a JSON array of objects.
    pub fn set_translations_json(&mut self, json: &serde_json::Value) -> Result<()> {
        let Some(items) = json.as_array() else {
            return Err(self.reject_translations(ValidationErrorKind::Invalid));
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Some(object) = item.as_object() else {
                return Err(self.reject_translations(ValidationErrorKind::Invalid));
            };
            let mut entry = AttributeMap::new();
            for (key, value) in object {
                match Value::try_from(value.clone()) {
                    Ok(value) => {
                        entry.insert(key.clone(), value);
                    }
                    Err(_) => return Err(self.reject_translations(ValidationErrorKind::Invalid)),
                }
            }
            entries.push(entry);
        }
        self.set_translations(entries)
    }

    fn parse_translation_entry(
        &self,
        entry: AttributeMap,
    ) -> std::result::Result<(Locale, Vec<(String, Value)>), ValidationErrorKind> {
        let mut locale = None;
        let mut attributes = Vec::new();

        for (key, value) in entry {
            let key = normalize_key(&key);
            if key == "locale" {
                locale = Some(value);
                continue;
            }
            match self.model.accessor(key) {
                Some(accessor) if accessor.is_translated() && accessor.column_type().accepts(&value) => {
                    attributes.push((key.to_string(), value));
                }
                _ => {
                    warn!(
                        "Rejected translation attribute '{}' for {}",
                        key,
                        self.model.table_name()
                    );
                    return Err(ValidationErrorKind::Invalid);
                }
            }
        }

        match locale {
            None | Some(Value::Null) => Err(ValidationErrorKind::Presence),
            Some(Value::Text(raw)) => Locale::parse(&raw)
                .map(|locale| (locale, attributes))
                .map_err(|_| ValidationErrorKind::Invalid),
            Some(_) => Err(ValidationErrorKind::Invalid),
        }
    }

    fn reject_translations(&mut self, kind: ValidationErrorKind) -> Error {
        let error = ValidationError::new(TRANSLATIONS_FIELD, kind);
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
        Error::Validation(self.errors())
    }

    // ==================== Validation ====================

    /// Run the `before_validation` hook, then validate every live translation.
    pub fn validate(&mut self, ctx: &LocaleContext) -> bool {
        self.before_validation(ctx);
        self.errors.clear();

        let available = ctx.available_locales();
        let mut seen = BTreeSet::new();
        let mut translations_valid = true;

        for translation in self.translations.iter_mut() {
            if !translation.is_live() {
                translation.clear_errors();
                continue;
            }
            let mut valid = translation.validate(available);

            for name in translation.attributes().keys() {
                if !self.model.is_translated(name) {
                    valid = false;
                }
            }
            if !valid && translation.is_valid() {
                translation.add_error(ValidationError::new(
                    TRANSLATIONS_FIELD,
                    ValidationErrorKind::Invalid,
                ));
            }

            if let Some(locale) = translation.locale().cloned() {
                if !seen.insert(locale) {
                    translation.add_error(ValidationError::new(
                        "locale",
                        ValidationErrorKind::Uniqueness,
                    ));
                    valid = false;
                }
            }
            translations_valid &= valid;
        }

        if !translations_valid {
            self.mark_translations_invalid();
        }
        self.errors.is_empty()
    }

    /// Builds a translation for the current locale when there are none, so a
    /// bare record still validates something.
    pub(crate) fn before_validation(&mut self, ctx: &LocaleContext) {
        if self.model.options().autobuild
            && self.model.supports_translation_rewrite()
            && self.translations.is_empty()
        {
            self.translation_or_build(&ctx.current_locale());
        }
    }

    pub(crate) fn before_destroy(&mut self) {
        self.destroying = true;
    }

    pub(crate) fn abort_destroy(&mut self) {
        self.destroying = false;
    }

    pub(crate) fn add_translation_error(&mut self, index: usize, error: ValidationError) {
        if let Some(translation) = self.translations.get_mut(index) {
            translation.add_error(error);
            self.mark_translations_invalid();
        }
    }

    fn mark_translations_invalid(&mut self) {
        let generic = ValidationError::new(TRANSLATIONS_FIELD, ValidationErrorKind::Invalid);
        if !self.errors.contains(&generic) {
            self.errors.push(generic);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Entity errors with the generic translation error expanded into one
    /// entry per invalid translation.
    pub fn errors(&self) -> ErrorReport {
        let translations: Vec<TranslationErrors> = self
            .translations
            .iter()
            .filter(|t| t.is_live() && !t.is_valid())
            .map(|t| TranslationErrors {
                locale: t.locale().cloned(),
                errors: t.errors().to_vec(),
            })
            .collect();

        let base = self
            .errors
            .iter()
            .filter(|e| {
                translations.is_empty()
                    || !(e.field == TRANSLATIONS_FIELD && e.kind == ValidationErrorKind::Invalid)
            })
            .cloned()
            .collect();

        ErrorReport { base, translations }
    }

    // ==================== Persistence state ====================

    pub(crate) fn translations_mut(&mut self) -> &mut Vec<Translation> {
        &mut self.translations
    }

    pub(crate) fn replace_translations(&mut self, translations: Vec<Translation>) {
        self.translations = translations;
    }

    pub(crate) fn mark_saved(&mut self, id: i64, updated_at: Option<DateTime<Utc>>) {
        self.id = Some(id);
        if updated_at.is_some() {
            self.updated_at = updated_at;
        }
        self.changed.clear();
        self.errors.clear();
    }

    pub(crate) fn reset_attributes(
        &mut self,
        attributes: AttributeMap,
        updated_at: Option<DateTime<Utc>>,
    ) {
        self.attributes = attributes;
        self.updated_at = updated_at;
        self.changed.clear();
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
        self.destroying = false;
        for translation in &mut self.translations {
            translation.mark_destroyed();
        }
    }

    pub(crate) fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = Some(updated_at);
    }
}
