//! Query building for translatable models.
//!
//! # Architecture
//!
//! - `Scope`: plain parameterized query over one entity table, with an
//!   optional inner join to its translations table
//! - `Criteria`: ordered filter map (`key -> value` or `key -> any of values`)
//! - `rewriter`: `Query`, the translation-aware decorator around `Scope`
//! - `finder`: method-style dynamic finders (`find_by_title_and_permalink`)

pub mod finder;
pub mod rewriter;

use crate::model::normalize_key;
use crate::value::Value;

pub use finder::{DynamicFinder, FinderKind, FinderOutcome};
pub use rewriter::{parse_translated_conditions, Query};

/// Expected value(s) for one filter key.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    Value(Value),
    AnyOf(Vec<Value>),
}

/// Ordered filter map. Keys tolerate a leading `:`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    entries: Vec<(String, Expected)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, Expected::Value(value.into()));
        self
    }

    /// Require `key` to equal one of `values`.
    pub fn any_of<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.insert(key, Expected::AnyOf(values));
        self
    }

    /// Add or replace the expectation for `key`.
    pub fn insert(&mut self, key: &str, expected: Expected) {
        let key = normalize_key(key);
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = expected,
            None => self.entries.push((key.to_string(), expected)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Expected> {
        let key = normalize_key(key);
        self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expected)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Criteria {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut criteria = Criteria::new();
        for (key, value) in iter {
            criteria.insert(key.as_ref(), Expected::Value(value.into()));
        }
        criteria
    }
}

/// Comparison applied to one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    NotEq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
}

impl Predicate {
    pub(crate) fn matching(expected: &Expected) -> Self {
        match expected {
            Expected::Value(v) => Self::Eq(v.clone()),
            Expected::AnyOf(vs) => Self::In(vs.clone()),
        }
    }

    pub(crate) fn excluding(expected: &Expected) -> Self {
        match expected {
            Expected::Value(v) => Self::NotEq(v.clone()),
            Expected::AnyOf(vs) => Self::NotIn(vs.clone()),
        }
    }
}

/// A predicate on a table-qualified column.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub table: String,
    pub column: String,
    pub predicate: Predicate,
}

impl Condition {
    pub fn new(table: &str, column: &str, predicate: Predicate) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            predicate,
        }
    }

    pub fn qualified_column(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }

    /// Render as a SQL fragment, appending bound values to `params`.
    pub(crate) fn render(&self, params: &mut Vec<Value>) -> String {
        let column = self.qualified_column();
        match &self.predicate {
            Predicate::Eq(Value::Null) => format!("{} IS NULL", column),
            Predicate::Eq(value) => {
                params.push(value.clone());
                format!("{} = ?", column)
            }
            Predicate::NotEq(value) => {
                params.push(value.clone());
                format!("{} IS NOT ?", column)
            }
            Predicate::In(values) if values.is_empty() => "0 = 1".to_string(),
            Predicate::In(values) => {
                params.extend(values.iter().cloned());
                format!("{} IN ({})", column, placeholders(values.len()))
            }
            Predicate::NotIn(values) if values.is_empty() => "1 = 1".to_string(),
            Predicate::NotIn(values) => {
                params.extend(values.iter().cloned());
                format!(
                    "({} IS NULL OR {} NOT IN ({}))",
                    column,
                    column,
                    placeholders(values.len())
                )
            }
        }
    }
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Inner join from the entity table to its translations table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub foreign_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Plain query over one entity table. All conditions are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    table: String,
    join: Option<Join>,
    conditions: Vec<Condition>,
    order: Option<Order>,
    limit: Option<i64>,
}

impl Scope {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            join: None,
            conditions: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn joined(&self) -> Option<&Join> {
        self.join.as_ref()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an inner join; joining the same table twice is a no-op.
    pub fn join(mut self, table: &str, foreign_key: &str) -> Self {
        if self.join.as_ref().map(|j| j.table.as_str()) != Some(table) {
            self.join = Some(Join {
                table: table.to_string(),
                foreign_key: foreign_key.to_string(),
            });
        }
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Conditions that target `table`.
    pub fn conditions_on<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Condition> {
        self.conditions.iter().filter(move |c| c.table == table)
    }

    fn render_from(&self) -> String {
        match &self.join {
            Some(join) => format!(
                "FROM {table} INNER JOIN {joined} ON {joined}.{fk} = {table}.id",
                table = self.table,
                joined = join.table,
                fk = join.foreign_key
            ),
            None => format!("FROM {}", self.table),
        }
    }

    fn render_where(&self, params: &mut Vec<Value>) -> String {
        if self.conditions.is_empty() {
            return String::new();
        }
        let clauses: Vec<String> = self.conditions.iter().map(|c| c.render(params)).collect();
        format!(" WHERE {}", clauses.join(" AND "))
    }

    /// SQL selecting the matching entity ids, in order.
    pub fn select_ids_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT DISTINCT {}.id {}{}",
            self.table,
            self.render_from(),
            self.render_where(&mut params)
        );
        if let Some(order) = self.order {
            sql.push_str(&format!(" ORDER BY {}.id {}", self.table, order.sql()));
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(limit));
        }
        (sql, params)
    }

    /// SQL probing whether anything matches.
    pub fn exists_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT 1 {}{} LIMIT 1",
            self.render_from(),
            self.render_where(&mut params)
        );
        (sql, params)
    }

    /// SQL counting distinct matching entities.
    pub fn count_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT COUNT(DISTINCT {}.id) {}{}",
            self.table,
            self.render_from(),
            self.render_where(&mut params)
        );
        (sql, params)
    }
}
