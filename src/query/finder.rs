//! Method-style dynamic finders.
//!
//! Names such as `find_by_title_and_permalink` are parsed once into a
//! `DynamicFinder`, then executed with positional arguments.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::i18n::LocaleContext;
use crate::model::Model;
use crate::query::{Criteria, Query};
use crate::record::Record;
use crate::value::Value;
use regex::Regex;
use std::sync::{Arc, OnceLock};

static FINDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn finder_regex() -> &'static Regex {
    FINDER_REGEX.get_or_init(|| {
        Regex::new(r"^find_(by|last_by|all_by|or_initialize_by|or_create_by)_([a-z0-9_]+)$")
            .expect("Invalid regex")
    })
}

/// What a finder returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderKind {
    First,
    Last,
    All,
    FirstOrInitialize,
    FirstOrCreate,
}

/// Result of executing a `DynamicFinder`.
#[derive(Debug, Clone)]
pub enum FinderOutcome {
    One(Option<Record>),
    Many(Vec<Record>),
    Record(Record),
}

impl FinderOutcome {
    /// Flatten into a list of records.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::One(record) => record.into_iter().collect(),
            Self::Many(records) => records,
            Self::Record(record) => vec![record],
        }
    }
}

/// A parsed finder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFinder {
    kind: FinderKind,
    attributes: Vec<String>,
}

impl DynamicFinder {
    /// Parse a finder name. Returns `None` when `name` is not a finder.
    ///
    /// # Example
    /// ```
    /// use capito::query::{DynamicFinder, FinderKind};
    ///
    /// let finder = DynamicFinder::parse("find_by_title_and_permalink").unwrap();
    /// assert_eq!(finder.kind(), FinderKind::First);
    /// assert_eq!(finder.attributes(), ["title", "permalink"]);
    /// ```
    pub fn parse(name: &str) -> Option<Self> {
        let captures = finder_regex().captures(name)?;
        let kind = match &captures[1] {
            "by" => FinderKind::First,
            "last_by" => FinderKind::Last,
            "all_by" => FinderKind::All,
            "or_initialize_by" => FinderKind::FirstOrInitialize,
            _ => FinderKind::FirstOrCreate,
        };

        let attributes: Vec<String> = captures[2].split("_and_").map(str::to_string).collect();
        if attributes.iter().any(|a| a.is_empty() || a.starts_with('_') || a.ends_with('_')) {
            return None;
        }
        Some(Self { kind, attributes })
    }

    pub fn kind(&self) -> FinderKind {
        self.kind
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Split the attribute names into `(translated, untranslated)`.
    pub fn partition<'a>(&'a self, model: &Model) -> (Vec<&'a str>, Vec<&'a str>) {
        self.attributes
            .iter()
            .map(String::as_str)
            .partition(|name| model.is_translated(name))
    }

    /// Pair the attribute names with positional `args`.
    pub fn criteria(&self, args: Vec<Value>) -> Result<Criteria> {
        if args.len() != self.attributes.len() {
            return Err(Error::FinderArity {
                expected: self.attributes.len(),
                given: args.len(),
            });
        }
        Ok(self.attributes.iter().zip(args).collect())
    }

    /// Run the finder against `model` in the context's current locale.
    pub async fn execute(
        &self,
        model: &Arc<Model>,
        args: Vec<Value>,
        db: &Database,
        ctx: &LocaleContext,
    ) -> Result<FinderOutcome> {
        let criteria = self.criteria(args)?;
        let query = Query::new(Arc::clone(model), ctx);

        let outcome = match self.kind {
            FinderKind::First => FinderOutcome::One(query.find_by(criteria, db).await?),
            FinderKind::Last => {
                FinderOutcome::One(query.where_eq(criteria)?.last(db).await?)
            }
            FinderKind::All => FinderOutcome::Many(query.where_eq(criteria)?.all(db).await?),
            FinderKind::FirstOrInitialize => {
                FinderOutcome::Record(query.find_or_initialize_by(criteria, db).await?)
            }
            FinderKind::FirstOrCreate => {
                FinderOutcome::Record(query.find_or_create_by(criteria, db, ctx).await?)
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::{Locale, LocaleDefaults};
    use crate::value::ColumnType;

    fn products() -> Arc<Model> {
        Model::builder("products")
            .column("permalink", ColumnType::Text)
            .column("hidden", ColumnType::Bool)
            .translates("title", ColumnType::Text)
            .build()
            .expect("Should build model")
    }

    fn context() -> LocaleContext {
        let en = Locale::parse("en").unwrap();
        LocaleContext::new(LocaleDefaults::new(en, []))
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_prefixes() {
        let cases = [
            ("find_by_title", FinderKind::First),
            ("find_last_by_title", FinderKind::Last),
            ("find_all_by_title", FinderKind::All),
            ("find_or_initialize_by_title", FinderKind::FirstOrInitialize),
            ("find_or_create_by_title", FinderKind::FirstOrCreate),
        ];
        for (name, kind) in cases {
            let finder = DynamicFinder::parse(name).expect("Should parse");
            assert_eq!(finder.kind(), kind, "{}", name);
            assert_eq!(finder.attributes(), ["title"]);
        }
    }

    #[test]
    fn test_parse_multiple_attributes() {
        let finder = DynamicFinder::parse("find_all_by_title_and_hidden").unwrap();
        assert_eq!(finder.attributes(), ["title", "hidden"]);
    }

    #[test]
    fn test_parse_rejects_non_finders() {
        assert!(DynamicFinder::parse("title").is_none());
        assert!(DynamicFinder::parse("find_by_").is_none());
        assert!(DynamicFinder::parse("find_by_title_and_").is_none());
        assert!(DynamicFinder::parse("find_first_by_title").is_none());
    }

    #[test]
    fn test_partition() {
        let finder = DynamicFinder::parse("find_by_title_and_permalink").unwrap();
        let (translated, untranslated) = finder.partition(&products());
        assert_eq!(translated, vec!["title"]);
        assert_eq!(untranslated, vec!["permalink"]);
    }

    #[test]
    fn test_criteria_arity() {
        let finder = DynamicFinder::parse("find_by_title_and_permalink").unwrap();
        let result = finder.criteria(vec![Value::from("foo")]);
        assert!(matches!(
            result,
            Err(Error::FinderArity {
                expected: 2,
                given: 1
            })
        ));

        let criteria = finder
            .criteria(vec![Value::from("foo"), Value::from("bar")])
            .unwrap();
        assert_eq!(criteria.len(), 2);
    }

    // ==================== Execution Tests ====================

    #[tokio::test]
    async fn test_execute_find_by_translated_attribute() {
        let db = Database::connect("sqlite::memory:", 1).await.unwrap();
        let model = products();
        db.create_tables(&model).await.unwrap();
        let ctx = context();

        let mut record = model.new_record();
        record.set("title", "foo", &ctx).unwrap();
        record.set("permalink", "foo-1", &ctx).unwrap();
        db.save(&mut record, &ctx).await.unwrap();

        let finder = DynamicFinder::parse("find_by_title_and_permalink").unwrap();
        let outcome = finder
            .execute(&model, vec![Value::from("foo"), Value::from("foo-1")], &db, &ctx)
            .await
            .unwrap();
        let records = outcome.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), record.id());
    }

    #[tokio::test]
    async fn test_execute_find_or_create() {
        let db = Database::connect("sqlite::memory:", 1).await.unwrap();
        let model = products();
        db.create_tables(&model).await.unwrap();
        let ctx = context();

        let finder = DynamicFinder::parse("find_or_create_by_title").unwrap();
        let FinderOutcome::Record(created) = finder
            .execute(&model, vec![Value::from("new")], &db, &ctx)
            .await
            .unwrap()
        else {
            panic!("Expected a record");
        };
        assert!(created.is_persisted());
        assert_eq!(created.get("title", &ctx).unwrap(), Value::from("new"));
    }
}
