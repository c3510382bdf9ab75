//! Translatable model declarations.
//!
//! A `Model` describes one entity type: its table, untranslated columns, the
//! attributes it translates and the translation options. Declaring it builds
//! the accessor registry once, so every attribute read or write dispatches
//! through a closure looked up by name.

use crate::error::{Error, Result};
use crate::i18n::Locale;
use crate::record::Record;
use crate::value::{ColumnType, Value};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Options recognized when declaring translated attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TranslationOptions {
    /// Build a translation for the current locale before validating a record
    /// that has none.
    pub autobuild: bool,

    /// Destroy the record once its last translation is destroyed.
    pub destroy_model_without_translation: bool,

    /// Bump the record's `updated_at` whenever one of its translations is saved.
    pub touch: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            autobuild: true,
            destroy_model_without_translation: true,
            touch: false,
        }
    }
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

type Getter = Arc<dyn Fn(&Record, &Locale) -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(&mut Record, &Locale, Value) + Send + Sync>;

/// Getter/setter pair registered for one attribute.
#[derive(Clone)]
pub struct Accessor {
    name: String,
    column_type: ColumnType,
    translated: bool,
    getter: Getter,
    setter: Setter,
}

impl Accessor {
    fn plain(column: &Column) -> Self {
        let get_name = column.name.clone();
        let set_name = column.name.clone();
        Self {
            name: column.name.clone(),
            column_type: column.column_type,
            translated: false,
            getter: Arc::new(move |record, _| record.attribute(&get_name)),
            setter: Arc::new(move |record, _, value| record.write_attribute(&set_name, value)),
        }
    }

    fn translated(column: &Column) -> Self {
        let get_name = column.name.clone();
        let set_name = column.name.clone();
        Self {
            name: column.name.clone(),
            column_type: column.column_type,
            translated: true,
            getter: Arc::new(move |record, locale| {
                record
                    .translation(locale)
                    .map(|t| t.get(&get_name))
                    .unwrap_or_default()
            }),
            setter: Arc::new(move |record, locale, value| {
                record.translation_or_build(locale).set(&set_name, value);
                record.mark_changed(&set_name);
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_translated(&self) -> bool {
        self.translated
    }

    pub fn get(&self, record: &Record, locale: &Locale) -> Value {
        (self.getter)(record, locale)
    }

    pub fn set(&self, record: &mut Record, locale: &Locale, value: Value) {
        (self.setter)(record, locale, value)
    }
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("translated", &self.translated)
            .finish_non_exhaustive()
    }
}

/// Declared entity type with translated attributes.
#[derive(Debug)]
pub struct Model {
    name: String,
    table_name: String,
    translations_table_name: String,
    foreign_key: String,
    columns: Vec<Column>,
    translated_columns: Vec<Column>,
    translated_names: BTreeSet<String>,
    options: TranslationOptions,
    accessors: BTreeMap<String, Accessor>,
}

impl Model {
    /// Start declaring a model stored in `table_name`.
    ///
    /// # Example
    /// ```
    /// use capito::{ColumnType, Model};
    ///
    /// let products = Model::builder("products")
    ///     .column("permalink", ColumnType::Text)
    ///     .translates("title", ColumnType::Text)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(products.translations_table_name(), "product_translations");
    /// assert_eq!(products.foreign_key(), "product_id");
    /// assert_eq!(products.translated_column_name("title"), "product_translations.title");
    /// ```
    pub fn builder(table_name: &str) -> ModelBuilder {
        ModelBuilder::new(table_name)
    }

    /// Singular name of the entity (`product` for `products`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn translations_table_name(&self) -> &str {
        &self.translations_table_name
    }

    /// Foreign key column on the translations table.
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    /// Untranslated columns, excluding `id` and `updated_at`.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn translated_columns(&self) -> &[Column] {
        &self.translated_columns
    }

    pub fn translated_attribute_names(&self) -> &BTreeSet<String> {
        &self.translated_names
    }

    pub fn options(&self) -> TranslationOptions {
        self.options
    }

    pub fn is_translated(&self, name: &str) -> bool {
        self.translated_names.contains(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.accessors.contains_key(name)
    }

    pub fn accessor(&self, name: &str) -> Option<&Accessor> {
        self.accessors.get(name)
    }

    /// Whether queries on this model need the translation-aware rewriter.
    pub fn supports_translation_rewrite(&self) -> bool {
        !self.translated_names.is_empty()
    }

    /// Qualify a translated attribute with the translations table.
    pub fn translated_column_name(&self, name: &str) -> String {
        format!("{}.{}", self.translations_table_name, name)
    }

    /// Qualify an untranslated column with the entity table.
    pub fn column_name(&self, name: &str) -> String {
        format!("{}.{}", self.table_name, name)
    }

    /// Create an empty, unsaved record of this model.
    pub fn new_record(self: &Arc<Self>) -> Record {
        Record::new(Arc::clone(self))
    }
}

/// Builder for `Model` declarations.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    table_name: String,
    columns: Vec<Column>,
    translated: Vec<Column>,
    options: TranslationOptions,
    translations_table: Option<String>,
    foreign_key: Option<String>,
}

impl ModelBuilder {
    fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns: Vec::new(),
            translated: Vec::new(),
            options: TranslationOptions::default(),
            translations_table: None,
            foreign_key: None,
        }
    }

    /// Declare an untranslated column.
    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            column_type,
        });
        self
    }

    /// Declare a translated attribute.
    pub fn translates(mut self, name: &str, column_type: ColumnType) -> Self {
        self.translated.push(Column {
            name: name.to_string(),
            column_type,
        });
        self
    }

    pub fn options(mut self, options: TranslationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn autobuild(mut self, enabled: bool) -> Self {
        self.options.autobuild = enabled;
        self
    }

    pub fn destroy_model_without_translation(mut self, enabled: bool) -> Self {
        self.options.destroy_model_without_translation = enabled;
        self
    }

    pub fn touch(mut self, enabled: bool) -> Self {
        self.options.touch = enabled;
        self
    }

    /// Override the derived `<singular>_translations` table name.
    pub fn translations_table(mut self, name: &str) -> Self {
        self.translations_table = Some(name.to_string());
        self
    }

    /// Override the derived `<singular>_id` foreign key.
    pub fn foreign_key(mut self, name: &str) -> Self {
        self.foreign_key = Some(name.to_string());
        self
    }

    /// Validate the declaration and build the accessor registry.
    pub fn build(self) -> Result<Arc<Model>> {
        check_identifier(&self.table_name)?;

        let name = singularize(&self.table_name);
        let translations_table_name = self
            .translations_table
            .unwrap_or_else(|| format!("{}_translations", name));
        let foreign_key = self.foreign_key.unwrap_or_else(|| format!("{}_id", name));
        check_identifier(&translations_table_name)?;
        check_identifier(&foreign_key)?;

        if translations_table_name == self.table_name {
            return Err(Error::declaration(
                "translations table must differ from the entity table",
            ));
        }

        let reserved = ["id", "locale", "updated_at", foreign_key.as_str()];
        let mut accessors = BTreeMap::new();

        for (column, translated) in self
            .columns
            .iter()
            .map(|c| (c, false))
            .chain(self.translated.iter().map(|c| (c, true)))
        {
            check_identifier(&column.name)?;
            if reserved.contains(&column.name.as_str()) {
                return Err(Error::declaration(format!(
                    "'{}' is reserved and cannot be declared as an attribute",
                    column.name
                )));
            }
            let accessor = if translated {
                Accessor::translated(column)
            } else {
                Accessor::plain(column)
            };
            if accessors.insert(column.name.clone(), accessor).is_some() {
                return Err(Error::declaration(format!(
                    "attribute '{}' is declared twice",
                    column.name
                )));
            }
        }

        let translated_names = self.translated.iter().map(|c| c.name.clone()).collect();

        Ok(Arc::new(Model {
            name,
            table_name: self.table_name,
            translations_table_name,
            foreign_key,
            columns: self.columns,
            translated_columns: self.translated,
            translated_names,
            options: self.options,
            accessors,
        }))
    }
}

static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_REGEX.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("Invalid regex"))
}

/// Strip symbol-style decoration from an attribute key (`":title"` -> `"title"`).
pub(crate) fn normalize_key(key: &str) -> &str {
    key.trim().trim_start_matches(':')
}

/// Check that a name can be interpolated into SQL as a bare identifier.
fn is_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

fn check_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::declaration(format!("'{}' is not a valid identifier", name)))
    }
}

/// Singular form of a table name, enough for conventional English plurals.
fn singularize(table_name: &str) -> String {
    if let Some(stem) = table_name.strip_suffix("ies") {
        return format!("{}y", stem);
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if table_name.ends_with(suffix) {
            return table_name[..table_name.len() - 2].to_string();
        }
    }
    match table_name.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') && !stem.is_empty() => stem.to_string(),
        _ => table_name.to_string(),
    }
}
