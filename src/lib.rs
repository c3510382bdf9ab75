//! Locale-specific attributes for relational records.
//!
//! A model declares which attributes are translated. Each record keeps one
//! translation row per locale, reads and writes those attributes in the
//! current locale of a `LocaleContext`, and can be filtered by them as if
//! they were ordinary columns.

pub mod config;
pub mod db;
pub mod error;
pub mod i18n;
pub mod model;
pub mod query;
pub mod record;
pub mod translation;
pub mod value;

pub use db::Database;
pub use error::{Error, ErrorReport, Result, ValidationError, ValidationErrorKind};
pub use i18n::{Locale, LocaleContext, LocaleDefaults};
pub use model::{Model, ModelBuilder, TranslationOptions};
pub use query::{Criteria, Query};
pub use record::{AttributeMap, Record};
pub use translation::Translation;
pub use value::{ColumnType, Value};
