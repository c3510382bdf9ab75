//! Error types shared by the translation layer and the store.

use crate::i18n::Locale;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by records, queries and the store.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(ErrorReport),

    #[error("{table} record {id} not found")]
    NotFound { table: String, id: i64 },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid locale: '{value}'")]
    InvalidLocale { value: String },

    #[error("Unknown attribute '{name}' for {model}")]
    UnknownAttribute { model: String, name: String },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Invalid model declaration: {message}")]
    Declaration { message: String },

    #[error("Finder expects {expected} arguments, got {given}")]
    FinderArity { expected: usize, given: usize },
}

impl Error {
    pub(crate) fn unknown_attribute(model: &str, name: &str) -> Self {
        Self::UnknownAttribute {
            model: model.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn declaration(message: impl Into<String>) -> Self {
        Self::Declaration {
            message: message.into(),
        }
    }

    /// The structured report, if this is a validation failure.
    pub fn report(&self) -> Option<&ErrorReport> {
        match self {
            Self::Validation(report) => Some(report),
            _ => None,
        }
    }
}

/// The rule a field failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Presence,
    Inclusion,
    Uniqueness,
    Invalid,
}

impl ValidationErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Presence => "can't be blank",
            Self::Inclusion => "is not included in the list",
            Self::Uniqueness => "has already been taken",
            Self::Invalid => "is invalid",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A single failed rule on a single field.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{field} {kind}")]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

/// Errors carried by one invalid translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationErrors {
    pub locale: Option<Locale>,
    pub errors: Vec<ValidationError>,
}

/// Aggregated validation state of an entity and its translations.
///
/// The entity's generic "translations is invalid" entry never appears in
/// `base`; it is replaced by one entry per invalid translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub base: Vec<ValidationError>,
    pub translations: Vec<TranslationErrors>,
}

impl ErrorReport {
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.translations.is_empty()
    }

    /// Check whether any entry (entity or translation level) matches.
    pub fn contains(&self, field: &str, kind: ValidationErrorKind) -> bool {
        let matches = |e: &ValidationError| e.field == field && e.kind == kind;
        self.base.iter().any(matches)
            || self
                .translations
                .iter()
                .any(|t| t.errors.iter().any(matches))
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.base.iter().map(ToString::to_string).collect();
        for entry in &self.translations {
            let locale = entry
                .locale
                .as_ref()
                .map(Locale::as_str)
                .unwrap_or("<none>");
            for error in &entry.errors {
                parts.push(format!("translation [{}] {}", locale, error));
            }
        }
        f.write_str(&parts.join(", "))
    }
}
