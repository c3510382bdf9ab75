use crate::config::Config;
use crate::error::{Error, Result, ValidationError, ValidationErrorKind};
use crate::i18n::{Locale, LocaleContext};
use crate::model::Model;
use crate::query::{placeholders, Scope};
use crate::record::{AttributeMap, Record};
use crate::translation::Translation;
use crate::value::{ColumnType, Value};
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type SqlQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open a connection pool for `url`, creating the database file if needed.
    ///
    /// In-memory databases live only as long as their connection, so they
    /// get exactly one connection that never expires.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        info!("Connected to database at {}", url);
        Ok(Self { pool })
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::connect(&config.database_url, config.max_connections).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the entity and translations tables for `model` if missing
    pub async fn create_tables(&self, model: &Model) -> Result<()> {
        let mut columns = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        columns.extend(
            model
                .columns()
                .iter()
                .map(|c| format!("{} {}", c.name, c.column_type.sql_type())),
        );
        if model.options().touch {
            columns.push("updated_at TEXT".to_string());
        }
        let entity_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            model.table_name(),
            columns.join(", ")
        );

        let mut columns = vec![
            "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            format!(
                "{} INTEGER NOT NULL REFERENCES {}(id)",
                model.foreign_key(),
                model.table_name()
            ),
            "locale TEXT NOT NULL".to_string(),
        ];
        columns.extend(
            model
                .translated_columns()
                .iter()
                .map(|c| format!("{} {}", c.name, c.column_type.sql_type())),
        );
        columns.push(format!("UNIQUE({}, locale)", model.foreign_key()));
        let translations_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            model.translations_table_name(),
            columns.join(", ")
        );

        sqlx::query(&entity_sql).execute(&self.pool).await?;
        sqlx::query(&translations_sql).execute(&self.pool).await?;
        debug!(
            "Ensured tables {} and {}",
            model.table_name(),
            model.translations_table_name()
        );
        Ok(())
    }

    // ==================== Saving ====================

    /// Validate `record`, then persist it and its translations in one
    /// transaction.
    ///
    /// Translations marked for destruction are deleted before live ones are
    /// written. In-memory state only changes once the transaction commits.
    pub async fn save(&self, record: &mut Record, ctx: &LocaleContext) -> Result<()> {
        let model = Arc::clone(record.model());
        if record.is_destroyed() {
            return Err(Error::NotFound {
                table: model.table_name().to_string(),
                id: record.id().unwrap_or_default(),
            });
        }

        if record.validate(ctx) {
            self.check_stored_uniqueness(record).await?;
        }
        if !record.is_valid() {
            warn!(
                "Refusing to save invalid {}: {}",
                model.name(),
                record.errors()
            );
            return Err(Error::Validation(record.errors()));
        }

        let now = Utc::now();
        let touch = model.options().touch;
        let mut tx = self.pool.begin().await?;

        let id = match record.id() {
            Some(id) => {
                let (sql, params) = update_entity_sql(&model, record);
                let result = bind_all(sqlx::query(&sql), &params)
                    .execute(&mut *tx)
                    .await
                    .map_err(constraint_error)?;
                if result.rows_affected() == 0 {
                    return Err(Error::NotFound {
                        table: model.table_name().to_string(),
                        id,
                    });
                }
                id
            }
            None => {
                let (sql, mut params) = insert_entity_sql(&model, record);
                if touch {
                    params.push(Value::Text(now.to_rfc3339()));
                }
                bind_all(sqlx::query(&sql), &params)
                    .execute(&mut *tx)
                    .await
                    .map_err(constraint_error)?
                    .last_insert_rowid()
            }
        };

        let translations = record.translations();
        let mut deleted = 0;
        for translation in translations.iter().filter(|t| t.is_marked_for_destruction()) {
            if let Some(translation_id) = translation.id() {
                let sql = format!(
                    "DELETE FROM {} WHERE id = ?",
                    model.translations_table_name()
                );
                deleted += sqlx::query(&sql)
                    .bind(translation_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }

        let mut saved_ids = vec![None; translations.len()];
        let mut written = deleted > 0;
        let mut duplicate = None;
        for (index, translation) in translations.iter().enumerate() {
            if !translation.is_live() {
                continue;
            }
            let written_id = write_translation(&mut tx, &model, id, translation).await;
            match written_id {
                Ok(translation_id) => {
                    written |= translation.is_changed() || translation.is_new_record();
                    saved_ids[index] = Some(translation_id);
                }
                Err(error) if is_unique_violation(&error) => {
                    duplicate = Some(index);
                    break;
                }
                Err(error) => return Err(constraint_error(error)),
            }
        }

        if let Some(index) = duplicate {
            tx.rollback().await?;
            record.add_translation_error(
                index,
                ValidationError::new("locale", ValidationErrorKind::Uniqueness),
            );
            warn!("Duplicate translation locale on {} {}", model.name(), id);
            return Err(Error::Validation(record.errors()));
        }

        let mut touched_at = record.is_new_record().then_some(now).filter(|_| touch);
        if touch && written && record.id().is_some() {
            touch_entity(&mut tx, &model, id, now).await?;
            touched_at = Some(now);
        }

        let mut cascaded = false;
        if deleted > 0 && model.options().destroy_model_without_translation {
            cascaded = cascade_if_untranslated(&mut tx, &model, id).await?;
        }

        tx.commit().await?;

        let translations = std::mem::take(record.translations_mut());
        let kept = translations
            .into_iter()
            .zip(saved_ids)
            .filter_map(|(mut translation, saved_id)| {
                let translation_id = saved_id?;
                translation.mark_saved(translation_id, id);
                Some(translation)
            })
            .collect();
        record.replace_translations(kept);
        record.mark_saved(id, touched_at);

        if cascaded {
            record.mark_destroyed();
            info!(
                "Destroyed {} {} after its last translation was removed",
                model.name(),
                id
            );
        } else {
            info!(
                "Saved {} {} with {} translation(s)",
                model.name(),
                id,
                record.translations().len()
            );
        }
        Ok(())
    }

    /// Save only the translation for `locale`, touching the owner if configured.
    ///
    /// An unsaved record is saved as a whole instead.
    pub async fn save_translation(
        &self,
        record: &mut Record,
        locale: &Locale,
        ctx: &LocaleContext,
    ) -> Result<()> {
        let Some(id) = record.id() else {
            return self.save(record, ctx).await;
        };
        let model = Arc::clone(record.model());
        let Some(index) = record
            .translations()
            .iter()
            .position(|t| t.locale() == Some(locale) && t.is_live())
        else {
            return Ok(());
        };

        let current_id = record.translations()[index].id();
        if !record.translations_mut()[index].validate(ctx.available_locales()) {
            let error = ValidationError::new("translations", ValidationErrorKind::Invalid);
            record.add_translation_error(index, error);
            return Err(Error::Validation(record.errors()));
        }

        let stored = self.stored_translation_id(&model, id, locale).await?;
        if let Some(existing) = stored.filter(|existing| Some(*existing) != current_id) {
            debug!("Translation {} already holds locale {}", existing, locale);
            record.add_translation_error(
                index,
                ValidationError::new("locale", ValidationErrorKind::Uniqueness),
            );
            return Err(Error::Validation(record.errors()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let written = write_translation(&mut tx, &model, id, &record.translations()[index]).await;
        let translation_id = match written {
            Ok(translation_id) => translation_id,
            Err(error) if is_unique_violation(&error) => {
                tx.rollback().await?;
                record.add_translation_error(
                    index,
                    ValidationError::new("locale", ValidationErrorKind::Uniqueness),
                );
                return Err(Error::Validation(record.errors()));
            }
            Err(error) => return Err(constraint_error(error)),
        };
        if model.options().touch {
            touch_entity(&mut tx, &model, id, now).await?;
        }
        tx.commit().await?;

        record.translations_mut()[index].mark_saved(translation_id, id);
        if model.options().touch {
            record.set_updated_at(now);
        }
        debug!("Saved {} translation {} for {} {}", locale, translation_id, model.name(), id);
        Ok(())
    }

    /// Check persisted rows the record does not hold in memory for locale
    /// collisions.
    async fn check_stored_uniqueness(&self, record: &mut Record) -> Result<()> {
        let Some(id) = record.id() else {
            return Ok(());
        };
        let model = Arc::clone(record.model());

        let held: BTreeSet<i64> = record
            .translations()
            .iter()
            .filter_map(Translation::id)
            .collect();

        let mut collisions = Vec::new();
        for (index, translation) in record.translations().iter().enumerate() {
            let Some(locale) = translation.locale().filter(|_| translation.is_live()) else {
                continue;
            };
            if let Some(existing) = self.stored_translation_id(&model, id, locale).await? {
                if Some(existing) != translation.id() && !held.contains(&existing) {
                    collisions.push(index);
                }
            }
        }

        for index in collisions {
            record.add_translation_error(
                index,
                ValidationError::new("locale", ValidationErrorKind::Uniqueness),
            );
        }
        Ok(())
    }

    async fn stored_translation_id(
        &self,
        model: &Model,
        entity_id: i64,
        locale: &Locale,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE {} = ? AND locale = ?",
            model.translations_table_name(),
            model.foreign_key()
        );
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(locale.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<i64, _>("id")).transpose()?)
    }

    // ==================== Destroying ====================

    /// Delete the record and all of its translations.
    pub async fn destroy(&self, record: &mut Record) -> Result<()> {
        let model = Arc::clone(record.model());
        let Some(id) = record.id() else {
            record.mark_destroyed();
            return Ok(());
        };

        record.before_destroy();
        let result = self.delete_entity(&model, id).await;
        match result {
            Ok(0) => {
                record.abort_destroy();
                Err(Error::NotFound {
                    table: model.table_name().to_string(),
                    id,
                })
            }
            Ok(_) => {
                record.mark_destroyed();
                info!("Destroyed {} {}", model.name(), id);
                Ok(())
            }
            Err(error) => {
                record.abort_destroy();
                Err(error)
            }
        }
    }

    async fn delete_entity(&self, model: &Model, id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            model.translations_table_name(),
            model.foreign_key()
        );
        sqlx::query(&sql).bind(id).execute(&mut *tx).await?;

        let sql = format!("DELETE FROM {} WHERE id = ?", model.table_name());
        let deleted = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    /// Delete the translation for `locale` right away.
    ///
    /// Returns `false` when the record has no such translation. When the
    /// model destroys untranslated records and none remain, the record is
    /// destroyed as well.
    pub async fn destroy_translation(&self, record: &mut Record, locale: &Locale) -> Result<bool> {
        let model = Arc::clone(record.model());
        let Some(index) = record
            .translations()
            .iter()
            .position(|t| t.locale() == Some(locale))
        else {
            return Ok(false);
        };

        let (Some(id), Some(translation_id)) = (record.id(), record.translations()[index].id())
        else {
            record.translations_mut().remove(index);
            return Ok(true);
        };

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE id = ?",
            model.translations_table_name()
        );
        sqlx::query(&sql)
            .bind(translation_id)
            .execute(&mut *tx)
            .await?;

        let cascade = model.options().destroy_model_without_translation
            && !record.is_being_destroyed()
            && !record.is_destroyed();
        let cascaded = cascade && cascade_if_untranslated(&mut tx, &model, id).await?;
        tx.commit().await?;

        let mut removed = record.translations_mut().remove(index);
        removed.mark_destroyed();
        debug!("Destroyed {} translation of {} {}", locale, model.name(), id);

        if cascaded {
            record.mark_destroyed();
            info!(
                "Destroyed {} {} after its last translation was removed",
                model.name(),
                id
            );
        }
        Ok(true)
    }

    // ==================== Loading ====================

    /// Load one record with all of its translations.
    pub async fn find(&self, model: &Arc<Model>, id: i64) -> Result<Record> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", model.table_name());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound {
                table: model.table_name().to_string(),
                id,
            })?;

        let mut record = record_from_row(model, &row)?;
        let translations = self.load_translations(model, &[id], &Scope::new(model.table_name())).await?;
        record.replace_translations(translations.into_values().next().unwrap_or_default());
        Ok(record)
    }

    /// Discard unsaved changes and reload the record from storage.
    ///
    /// Unsaved records have nothing to reload from and are left as they are.
    pub async fn reload(&self, record: &mut Record) -> Result<()> {
        let Some(id) = record.id() else {
            return Ok(());
        };
        let fresh = self.find(record.model(), id).await?;
        record.reset_attributes(fresh.attributes().clone(), fresh.updated_at());
        record.replace_translations(fresh.translations().to_vec());
        Ok(())
    }

    /// Replace the in-memory translations with every stored one.
    pub async fn reload_translations(&self, record: &mut Record) -> Result<()> {
        let Some(id) = record.id() else {
            return Ok(());
        };
        let model = Arc::clone(record.model());

        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", model.table_name());
        let count: i64 = sqlx::query(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        if count == 0 {
            return Err(Error::NotFound {
                table: model.table_name().to_string(),
                id,
            });
        }

        let mut loaded = self
            .load_translations(&model, &[id], &Scope::new(model.table_name()))
            .await?;
        record.replace_translations(loaded.remove(&id).unwrap_or_default());
        Ok(())
    }

    /// Every locale with at least one stored translation of `model`.
    pub async fn translated_locales(&self, model: &Model) -> Result<BTreeSet<Locale>> {
        let sql = format!(
            "SELECT DISTINCT locale FROM {}",
            model.translations_table_name()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Locale::parse(&row.try_get::<String, _>("locale")?))
            .collect()
    }

    pub async fn count_translations(&self, model: &Model, entity_id: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            model.translations_table_name(),
            model.foreign_key()
        );
        let count = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count)
    }

    /// Fetch the records matched by `scope`, in scope order.
    ///
    /// Translations are eager-loaded under the scope's own conditions on the
    /// translations table.
    pub(crate) async fn select(&self, model: &Arc<Model>, scope: &Scope) -> Result<Vec<Record>> {
        let (sql, params) = scope.select_ids_sql();
        debug!("{}", sql);
        let ids: Vec<i64> = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<i64, _>(0))
            .collect::<std::result::Result<_, _>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM {} WHERE id IN ({})",
            model.table_name(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let mut records: BTreeMap<i64, Record> = BTreeMap::new();
        for row in query.fetch_all(&self.pool).await? {
            let record = record_from_row(model, &row)?;
            if let Some(id) = record.id() {
                records.insert(id, record);
            }
        }

        let mut translations = self.load_translations(model, &ids, scope).await?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let mut record = records.remove(id)?;
                record.replace_translations(translations.remove(id).unwrap_or_default());
                Some(record)
            })
            .collect())
    }

    pub(crate) async fn exists_scope(&self, scope: &Scope) -> Result<bool> {
        let (sql, params) = scope.exists_sql();
        debug!("{}", sql);
        let row = bind_all(sqlx::query(&sql), &params)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub(crate) async fn count_scope(&self, scope: &Scope) -> Result<i64> {
        let (sql, params) = scope.count_sql();
        debug!("{}", sql);
        let count = bind_all(sqlx::query(&sql), &params)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count)
    }

    /// Load translations of `ids`, grouped by owner, keeping only rows that
    /// satisfy `scope`'s translations-table conditions.
    async fn load_translations(
        &self,
        model: &Model,
        ids: &[i64],
        scope: &Scope,
    ) -> Result<BTreeMap<i64, Vec<Translation>>> {
        let table = model.translations_table_name();
        let mut params: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
        let mut clauses = vec![format!(
            "{}.{} IN ({})",
            table,
            model.foreign_key(),
            placeholders(ids.len())
        )];
        if scope.joined().is_some() {
            clauses.extend(scope.conditions_on(table).map(|c| c.render(&mut params)));
        }

        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {}.id",
            table,
            clauses.join(" AND "),
            table
        );
        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;

        let mut grouped: BTreeMap<i64, Vec<Translation>> = BTreeMap::new();
        for row in &rows {
            let owner: i64 = row.try_get(model.foreign_key())?;
            grouped
                .entry(owner)
                .or_default()
                .push(translation_from_row(model, row)?);
        }
        Ok(grouped)
    }
}

// ==================== Row mapping ====================

fn bind_value<'q>(query: SqlQuery<'q>, value: &Value) -> SqlQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Integer(i) => query.bind(*i),
        Value::Real(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
    }
}

fn bind_all<'q>(query: SqlQuery<'q>, values: &[Value]) -> SqlQuery<'q> {
    values.iter().fold(query, bind_value)
}

fn decode_value(row: &SqliteRow, column: &str, column_type: ColumnType) -> Result<Value> {
    let value = match column_type {
        ColumnType::Text => row.try_get::<Option<String>, _>(column)?.map(Value::Text),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(column)?.map(Value::Integer),
        ColumnType::Real => row.try_get::<Option<f64>, _>(column)?.map(Value::Real),
        ColumnType::Bool => row.try_get::<Option<bool>, _>(column)?.map(Value::Bool),
    };
    Ok(value.unwrap_or_default())
}

fn parse_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::InvalidValue {
                name: "updated_at".to_string(),
                reason: e.to_string(),
            })
    })
    .transpose()
}

fn record_from_row(model: &Arc<Model>, row: &SqliteRow) -> Result<Record> {
    let id: i64 = row.try_get("id")?;
    let mut attributes = AttributeMap::new();
    for column in model.columns() {
        let value = decode_value(row, &column.name, column.column_type)?;
        attributes.insert(column.name.clone(), value);
    }
    let updated_at = if model.options().touch {
        parse_timestamp(row.try_get("updated_at")?)?
    } else {
        None
    };
    Ok(Record::from_row(Arc::clone(model), id, attributes, updated_at))
}

fn translation_from_row(model: &Model, row: &SqliteRow) -> Result<Translation> {
    let id: i64 = row.try_get("id")?;
    let entity_id: i64 = row.try_get(model.foreign_key())?;
    let locale = Locale::parse(&row.try_get::<String, _>("locale")?)?;
    let mut attributes = BTreeMap::new();
    for column in model.translated_columns() {
        let value = decode_value(row, &column.name, column.column_type)?;
        attributes.insert(column.name.clone(), value);
    }
    Ok(Translation::from_row(id, entity_id, locale, attributes))
}

// ==================== Write helpers ====================

fn insert_entity_sql(model: &Model, record: &Record) -> (String, Vec<Value>) {
    let mut names: Vec<&str> = model.columns().iter().map(|c| c.name.as_str()).collect();
    let params: Vec<Value> = names.iter().map(|name| record.attribute(name)).collect();
    if model.options().touch {
        names.push("updated_at");
    }

    let sql = if names.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", model.table_name())
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            model.table_name(),
            names.join(", "),
            placeholders(names.len())
        )
    };
    (sql, params)
}

fn update_entity_sql(model: &Model, record: &Record) -> (String, Vec<Value>) {
    let mut assignments: Vec<String> = model
        .columns()
        .iter()
        .map(|c| format!("{} = ?", c.name))
        .collect();
    let mut params: Vec<Value> = model
        .columns()
        .iter()
        .map(|c| record.attribute(&c.name))
        .collect();
    if assignments.is_empty() {
        assignments.push("id = id".to_string());
    }
    params.push(Value::Integer(record.id().unwrap_or_default()));

    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?",
        model.table_name(),
        assignments.join(", ")
    );
    (sql, params)
}

/// Insert or update one translation row, returning its id.
async fn write_translation(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &Model,
    entity_id: i64,
    translation: &Translation,
) -> std::result::Result<i64, sqlx::Error> {
    let locale = translation.locale().map(|l| l.as_str().to_string());
    let names: Vec<&str> = model
        .translated_columns()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    let values: Vec<Value> = names.iter().map(|name| translation.get(name)).collect();

    match translation.id() {
        None => {
            let mut columns = vec![model.foreign_key(), "locale"];
            columns.extend(names.iter().copied());
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                model.translations_table_name(),
                columns.join(", "),
                placeholders(columns.len())
            );
            let query = sqlx::query(&sql).bind(entity_id).bind(locale);
            let result = bind_all(query, &values).execute(&mut **tx).await?;
            Ok(result.last_insert_rowid())
        }
        Some(translation_id) if translation.is_changed() => {
            let mut assignments = vec!["locale = ?".to_string()];
            assignments.extend(names.iter().map(|name| format!("{} = ?", name)));
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ?",
                model.translations_table_name(),
                assignments.join(", ")
            );
            let query = bind_all(sqlx::query(&sql).bind(locale), &values);
            query.bind(translation_id).execute(&mut **tx).await?;
            Ok(translation_id)
        }
        Some(translation_id) => Ok(translation_id),
    }
}

async fn touch_entity(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &Model,
    id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let sql = format!("UPDATE {} SET updated_at = ? WHERE id = ?", model.table_name());
    sqlx::query(&sql)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Delete the entity if it has no translation rows left. Returns whether it
/// was deleted.
async fn cascade_if_untranslated(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    model: &Model,
    id: i64,
) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?",
        model.translations_table_name(),
        model.foreign_key()
    );
    let remaining: i64 = sqlx::query(&sql)
        .bind(id)
        .fetch_one(&mut **tx)
        .await?
        .try_get(0)?;
    if remaining > 0 {
        return Ok(false);
    }

    let sql = format!("DELETE FROM {} WHERE id = ?", model.table_name());
    let deleted = sqlx::query(&sql)
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(e) if e.is_unique_violation())
}

fn constraint_error(error: sqlx::Error) -> Error {
    let is_constraint =
        matches!(&error, sqlx::Error::Database(e) if !matches!(e.kind(), ErrorKind::Other));
    if is_constraint {
        Error::ConstraintViolation(error)
    } else {
        Error::Database(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::LocaleDefaults;
    use tempfile::TempDir;

    // ==================== Helper Functions ====================

    fn locale(code: &str) -> Locale {
        Locale::parse(code).unwrap()
    }

    fn context() -> LocaleContext {
        LocaleContext::new(LocaleDefaults::new(locale("en"), [locale("fr")]))
    }

    fn products() -> Arc<Model> {
        Model::builder("products")
            .column("permalink", ColumnType::Text)
            .column("hidden", ColumnType::Bool)
            .translates("title", ColumnType::Text)
            .build()
            .expect("Should build model")
    }

    /// Create an in-memory database with the products tables
    async fn create_test_db(model: &Model) -> Database {
        let db = Database::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to create database");
        db.create_tables(model).await.expect("Should create tables");
        db
    }

    fn entry(locale: &str, title: &str) -> AttributeMap {
        AttributeMap::from([
            ("locale".to_string(), Value::from(locale)),
            ("title".to_string(), Value::from(title)),
        ])
    }

    async fn saved_with(db: &Database, model: &Arc<Model>, ctx: &LocaleContext, locales: &[&str]) -> Record {
        let mut record = model.new_record();
        record
            .set_translations(locales.iter().map(|l| entry(l, &format!("title {}", l))))
            .expect("Should assign");
        db.save(&mut record, ctx).await.expect("Should save");
        record
    }

    // ==================== Database Initialization Tests ====================

    #[tokio::test]
    async fn test_create_tables_is_idempotent() {
        let model = products();
        let db = create_test_db(&model).await;
        db.create_tables(&model).await.expect("Second create should succeed");
        assert!(db.translated_locales(&model).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_database_reopening() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("capito.db");
        let url = format!("sqlite://{}", db_path.display());
        let model = products();
        let ctx = context();

        let id = {
            let db = Database::connect(&url, 2).await.expect("Should open");
            db.create_tables(&model).await.unwrap();
            let record = saved_with(&db, &model, &ctx, &["en"]).await;
            db.pool().close().await;
            record.id().unwrap()
        };

        let db = Database::connect(&url, 2).await.expect("Should reopen");
        let record = db.find(&model, id).await.expect("Should persist");
        assert_eq!(
            record.get_in("title", &locale("en")).unwrap(),
            Value::from("title en")
        );
    }

    // ==================== Save Tests ====================

    #[tokio::test]
    async fn test_save_new_record() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();

        let mut record = model.new_record();
        record.set("title", "foo", &ctx).unwrap();
        record.set("permalink", "foo", &ctx).unwrap();
        db.save(&mut record, &ctx).await.expect("Should save");

        assert!(record.is_persisted());
        assert!(record.changed_attributes().is_empty());
        let translation = record.translation(&locale("en")).unwrap();
        assert!(translation.is_persisted());
        assert_eq!(translation.entity_id(), record.id());
    }

    #[tokio::test]
    async fn test_save_autobuilds_translation() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();

        let mut record = model.new_record();
        record.set("hidden", true, &ctx).unwrap();
        db.save(&mut record, &ctx).await.unwrap();

        let id = record.id().unwrap();
        assert_eq!(db.count_translations(&model, id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_updates_existing_translation() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        record.set("title", "changed", &ctx).unwrap();
        db.save(&mut record, &ctx).await.unwrap();

        let found = db.find(&model, record.id().unwrap()).await.unwrap();
        assert_eq!(found.get("title", &ctx).unwrap(), Value::from("changed"));
        assert_eq!(found.translations().len(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_translated_locales() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let record = saved_with(&db, &model, &ctx, &["en", "fr"]).await;

        let found = db.find(&model, record.id().unwrap()).await.unwrap();
        let expected: BTreeSet<_> = [locale("en"), locale("fr")].into_iter().collect();
        assert_eq!(found.translated_locales(), expected);
    }

    #[tokio::test]
    async fn test_assigning_translations_destroys_absent_on_save() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en", "fr"]).await;

        record.set_translations(vec![entry("en", "only")]).unwrap();
        db.save(&mut record, &ctx).await.unwrap();

        let id = record.id().unwrap();
        assert_eq!(db.count_translations(&model, id).await.unwrap(), 1);
        assert_eq!(record.translations().len(), 1);
        assert!(record.translation(&locale("fr")).is_none());
        assert!(record.is_persisted());
    }

    #[tokio::test]
    async fn test_assigning_no_translations_cascades() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        record.set_translations(Vec::new()).unwrap();
        db.save(&mut record, &ctx).await.unwrap();

        assert!(record.is_destroyed());
        assert!(db.find(&model, record.id().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_save_leaves_record_unsaved() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();

        let mut record = model.new_record();
        record.translation_or_build(&locale("de")).set("title", "Titel");
        let error = db.save(&mut record, &ctx).await.expect_err("Should fail");

        assert!(error
            .report()
            .unwrap()
            .contains("locale", ValidationErrorKind::Inclusion));
        assert!(record.is_new_record());
        assert!(record.translations()[0].is_new_record());
    }

    #[tokio::test]
    async fn test_duplicate_stored_locale_fails_uniqueness() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let record = saved_with(&db, &model, &ctx, &["en"]).await;
        let id = record.id().unwrap();

        let mut first = db.find(&model, id).await.unwrap();
        let mut second = db.find(&model, id).await.unwrap();
        first.translation_or_build(&locale("fr")).set("title", "un");
        second.translation_or_build(&locale("fr")).set("title", "deux");

        db.save(&mut first, &ctx).await.expect("First save wins");
        let error = db.save(&mut second, &ctx).await.expect_err("Second should fail");
        assert!(error
            .report()
            .unwrap()
            .contains("locale", ValidationErrorKind::Uniqueness));
        assert_eq!(db.count_translations(&model, id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lost_race_maps_unique_constraint_to_uniqueness() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let record = saved_with(&db, &model, &ctx, &["en"]).await;
        let id = record.id().unwrap();

        let mut first = db.find(&model, id).await.unwrap();
        let mut second = db.find(&model, id).await.unwrap();

        // The stored en row becomes fr; second still holds it as en.
        first
            .translation_mut(&locale("en"))
            .unwrap()
            .set_locale(Some(locale("fr")));
        db.save(&mut first, &ctx).await.expect("First save wins");

        second
            .set_in("title", "deux", &locale("fr"))
            .expect("Should set");
        let before = second.translated_locales();
        let error = db.save(&mut second, &ctx).await.expect_err("Second should fail");

        assert!(matches!(error, Error::Validation(_)));
        assert!(error
            .report()
            .unwrap()
            .contains("locale", ValidationErrorKind::Uniqueness));
        assert_eq!(second.translated_locales(), before);
        assert!(second.translation(&locale("fr")).unwrap().is_new_record());
        assert_eq!(db.count_translations(&model, id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_translation_only() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        record.translation_or_build(&locale("fr")).set("title", "titre");
        db.save_translation(&mut record, &locale("fr"), &ctx)
            .await
            .expect("Should save translation");

        assert!(record.translation(&locale("fr")).unwrap().is_persisted());
        assert_eq!(
            db.count_translations(&model, record.id().unwrap()).await.unwrap(),
            2
        );
    }

    // ==================== Touch Tests ====================

    #[tokio::test]
    async fn test_touch_updates_parent() {
        let model = Model::builder("pages")
            .translates("title", ColumnType::Text)
            .touch(true)
            .build()
            .unwrap();
        let db = create_test_db(&model).await;
        let ctx = context();

        let mut record = model.new_record();
        record.set("title", "first", &ctx).unwrap();
        db.save(&mut record, &ctx).await.unwrap();
        let created = record.updated_at().expect("Should be stamped on create");

        record.set("title", "second", &ctx).unwrap();
        db.save(&mut record, &ctx).await.unwrap();
        let touched = record.updated_at().unwrap();
        assert!(touched >= created);

        let found = db.find(&model, record.id().unwrap()).await.unwrap();
        assert!(found.updated_at().is_some());
    }

    #[tokio::test]
    async fn test_no_touch_by_default() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let record = saved_with(&db, &model, &ctx, &["en"]).await;
        assert!(record.updated_at().is_none());
    }

    // ==================== Destroy Tests ====================

    #[tokio::test]
    async fn test_destroy_last_translation_destroys_record() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        let removed = db.destroy_translation(&mut record, &locale("en")).await.unwrap();
        assert!(removed);
        assert!(record.is_destroyed());
        assert!(matches!(
            db.find(&model, record.id().unwrap()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_one_of_two_translations() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en", "fr"]).await;

        db.destroy_translation(&mut record, &locale("en")).await.unwrap();
        assert!(!record.is_destroyed());
        assert_eq!(record.translations().len(), 1);
        assert!(db.find(&model, record.id().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_last_translation_without_cascade() {
        let model = Model::builder("products")
            .translates("title", ColumnType::Text)
            .destroy_model_without_translation(false)
            .build()
            .unwrap();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        db.destroy_translation(&mut record, &locale("en")).await.unwrap();
        assert!(!record.is_destroyed());
        assert!(db.find(&model, record.id().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_missing_translation_is_noop() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        let removed = db.destroy_translation(&mut record, &locale("fr")).await.unwrap();
        assert!(!removed);
        assert!(!record.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroy_record_removes_translations() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en", "fr"]).await;
        let id = record.id().unwrap();

        db.destroy(&mut record).await.expect("Should destroy");
        assert!(record.is_destroyed());
        assert!(!record.is_being_destroyed());
        assert_eq!(db.count_translations(&model, id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_destroy_missing_record() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let record = saved_with(&db, &model, &ctx, &["en"]).await;
        let mut stale = db.find(&model, record.id().unwrap()).await.unwrap();
        let mut current = record;

        db.destroy(&mut current).await.unwrap();
        let result = db.destroy(&mut stale).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(!stale.is_being_destroyed());
    }

    // ==================== Reload Tests ====================

    #[tokio::test]
    async fn test_reload_discards_changes() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;

        record.set("title", "unsaved", &ctx).unwrap();
        record.translation_or_build(&locale("fr"));
        db.reload(&mut record).await.unwrap();

        assert_eq!(record.get("title", &ctx).unwrap(), Value::from("title en"));
        assert_eq!(record.translations().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_missing_record() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        let mut record = saved_with(&db, &model, &ctx, &["en"]).await;
        let mut copy = record.clone();

        db.destroy(&mut record).await.unwrap();
        assert!(matches!(db.reload(&mut copy).await, Err(Error::NotFound { .. })));
        assert!(matches!(
            db.reload_translations(&mut copy).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_translated_locales_across_records() {
        let model = products();
        let db = create_test_db(&model).await;
        let ctx = context();
        saved_with(&db, &model, &ctx, &["en"]).await;
        saved_with(&db, &model, &ctx, &["en", "fr"]).await;

        let expected: BTreeSet<_> = [locale("en"), locale("fr")].into_iter().collect();
        assert_eq!(db.translated_locales(&model).await.unwrap(), expected);
    }
}
