//! Translation-aware query decorator.
//!
//! `Query` wraps a plain `Scope` for one model. Filter keys naming translated
//! attributes are requalified against the translations table and an inner
//! join is added, so callers filter by `title` exactly as they would by an
//! ordinary column.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::i18n::{Locale, LocaleContext};
use crate::model::Model;
use crate::query::{Condition, Criteria, Expected, Order, Predicate, Scope};
use crate::record::Record;
use crate::value::Value;
use std::sync::Arc;
use tracing::debug;

/// Rename translated keys to their translations-table columns.
///
/// Returns `None` when no key names a translated attribute. Values are left
/// exactly as given.
pub fn parse_translated_conditions(model: &Model, criteria: &Criteria) -> Option<Criteria> {
    if !criteria.keys().any(|key| model.is_translated(key)) {
        return None;
    }

    let mut rewritten = Criteria::new();
    for (key, expected) in criteria.iter() {
        if model.is_translated(key) {
            rewritten.insert(&model.translated_column_name(key), expected.clone());
        } else {
            rewritten.insert(key, expected.clone());
        }
    }
    Some(rewritten)
}

/// Query over a translatable model.
///
/// Translated filters match in the locale captured at construction unless
/// `in_any_locale` is called.
#[derive(Debug, Clone)]
pub struct Query {
    model: Arc<Model>,
    scope: Scope,
    locale: Locale,
    restrict_locale: bool,
    any_locale: bool,
    reload_needed: bool,
}

impl Query {
    pub fn new(model: Arc<Model>, ctx: &LocaleContext) -> Self {
        let scope = Scope::new(model.table_name());
        Self {
            model,
            scope,
            locale: ctx.current_locale(),
            restrict_locale: false,
            any_locale: false,
            reload_needed: false,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Locale translated filters are matched in.
    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    /// Whether fetched records get their full translation set reloaded.
    pub fn reload_needed(&self) -> bool {
        self.reload_needed
    }

    /// Keep only records matching every entry of `criteria`.
    pub fn where_eq(self, criteria: Criteria) -> Result<Self> {
        self.apply(criteria, Predicate::matching)
    }

    /// Keep only records matching none of the entries of `criteria`.
    ///
    /// Translated inequalities are null-safe and still require a translation
    /// in the matched locale.
    pub fn where_not(self, criteria: Criteria) -> Result<Self> {
        self.apply(criteria, Predicate::excluding)
    }

    /// Match translated filters against any locale.
    pub fn in_any_locale(mut self) -> Self {
        self.any_locale = true;
        self
    }

    /// Keep only records translated into at least one of `locales`, or into
    /// any locale at all when `locales` is empty.
    pub fn with_translations(mut self, locales: &[Locale]) -> Self {
        self.scope = self
            .scope
            .join(self.model.translations_table_name(), self.model.foreign_key());
        if !locales.is_empty() {
            let values = locales.iter().map(|l| Value::from(l.as_str())).collect();
            self.scope = self.scope.filter(Condition::new(
                self.model.translations_table_name(),
                "locale",
                Predicate::In(values),
            ));
        }
        self.reload_needed = true;
        self
    }

    fn apply(mut self, criteria: Criteria, predicate: fn(&Expected) -> Predicate) -> Result<Self> {
        let criteria = if self.model.supports_translation_rewrite() {
            parse_translated_conditions(&self.model, &criteria).unwrap_or(criteria)
        } else {
            criteria
        };

        for (key, expected) in criteria.iter() {
            let (table, column) = self.resolve(key)?;
            if table == self.model.translations_table_name() {
                self.scope = self
                    .scope
                    .join(self.model.translations_table_name(), self.model.foreign_key());
                self.reload_needed = true;
                if self.model.is_translated(&column) {
                    self.restrict_locale = true;
                }
            }
            self.scope = self
                .scope
                .filter(Condition::new(&table, &column, predicate(expected)));
        }
        Ok(self)
    }

    /// Resolve a filter key to `(table, column)`, rejecting unknown names.
    fn resolve(&self, key: &str) -> Result<(String, String)> {
        let model = &self.model;
        let unknown = || Error::unknown_attribute(model.table_name(), key);

        let (table, column) = match key.split_once('.') {
            Some((table, column)) => (table, column),
            None if model.is_translated(key) => (model.translations_table_name(), key),
            None => (model.table_name(), key),
        };

        let known = if table == model.table_name() {
            column == "id"
                || (column == "updated_at" && model.options().touch)
                || (model.has_attribute(column) && !model.is_translated(column))
        } else if table == model.translations_table_name() {
            column == "id"
                || column == "locale"
                || column == model.foreign_key()
                || model.is_translated(column)
        } else {
            false
        };

        if known {
            Ok((table.to_string(), column.to_string()))
        } else {
            Err(unknown())
        }
    }

    /// The scope as it will run, including the locale restriction.
    pub fn scope(&self) -> Scope {
        if self.restrict_locale && !self.any_locale {
            self.scope.clone().filter(Condition::new(
                self.model.translations_table_name(),
                "locale",
                Predicate::Eq(Value::from(self.locale.as_str())),
            ))
        } else {
            self.scope.clone()
        }
    }

    /// Single-valued equality filters, by bare attribute name.
    ///
    /// These seed the attributes of records built by `find_or_initialize_by`.
    pub fn where_values(&self) -> Criteria {
        let mut values = Criteria::new();
        for condition in self.scope.conditions() {
            let Predicate::Eq(value) = &condition.predicate else {
                continue;
            };
            if self.model.has_attribute(&condition.column) {
                values.insert(&condition.column, Expected::Value(value.clone()));
            }
        }
        values
    }

    // ==================== Execution ====================

    pub async fn first(&self, db: &Database) -> Result<Option<Record>> {
        let scope = self.scope().order(Order::Asc).limit(1);
        Ok(self.load(db, &scope).await?.into_iter().next())
    }

    pub async fn last(&self, db: &Database) -> Result<Option<Record>> {
        let scope = self.scope().order(Order::Desc).limit(1);
        Ok(self.load(db, &scope).await?.into_iter().next())
    }

    /// Any one matching record, in no particular order.
    pub async fn take(&self, db: &Database) -> Result<Option<Record>> {
        let scope = self.scope().limit(1);
        Ok(self.load(db, &scope).await?.into_iter().next())
    }

    pub async fn all(&self, db: &Database) -> Result<Vec<Record>> {
        let scope = self.scope().order(Order::Asc);
        self.load(db, &scope).await
    }

    pub async fn count(&self, db: &Database) -> Result<i64> {
        db.count_scope(&self.scope()).await
    }

    pub async fn exists(&self, db: &Database) -> Result<bool> {
        db.exists_scope(&self.scope()).await
    }

    /// `exists` with extra filters, rewritten like `where_eq`.
    pub async fn exists_where(&self, criteria: Criteria, db: &Database) -> Result<bool> {
        self.clone().where_eq(criteria)?.exists(db).await
    }

    async fn load(&self, db: &Database, scope: &Scope) -> Result<Vec<Record>> {
        let mut records = db.select(&self.model, scope).await?;
        if self.reload_needed {
            debug!(
                "Reloading translations for {} {} record(s)",
                records.len(),
                self.model.table_name()
            );
            for record in &mut records {
                db.reload_translations(record).await?;
            }
        }
        Ok(records)
    }

    // ==================== Finders ====================

    pub async fn find_by(&self, criteria: Criteria, db: &Database) -> Result<Option<Record>> {
        self.clone().where_eq(criteria)?.first(db).await
    }

    /// First match, or an unsaved record carrying the filter values.
    ///
    /// Translated values are written in the query's locale.
    pub async fn find_or_initialize_by(&self, criteria: Criteria, db: &Database) -> Result<Record> {
        let query = self.clone().where_eq(criteria)?;
        if let Some(found) = query.first(db).await? {
            return Ok(found);
        }
        query.initialize()
    }

    /// First match, or a newly saved record carrying the filter values.
    pub async fn find_or_create_by(
        &self,
        criteria: Criteria,
        db: &Database,
        ctx: &LocaleContext,
    ) -> Result<Record> {
        let mut record = self.find_or_initialize_by(criteria, db).await?;
        if record.is_new_record() {
            db.save(&mut record, ctx).await?;
        }
        Ok(record)
    }

    fn initialize(&self) -> Result<Record> {
        let mut record = self.model.new_record();
        for (name, expected) in self.where_values().iter() {
            if let Expected::Value(value) = expected {
                record.set_in(name, value.clone(), &self.locale)?;
            }
        }
        Ok(record)
    }
}
