use crate::i18n::{Locale, LocaleDefaults, PROCESS_DEFAULT_LOCALE};
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub max_connections: u32,

    // Locales
    pub default_locale: Locale,
    pub available_locales: Vec<Locale>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let default_locale = std::env::var("CAPITO_DEFAULT_LOCALE")
            .unwrap_or_else(|_| PROCESS_DEFAULT_LOCALE.to_string());
        let default_locale = Locale::parse(&default_locale)
            .context("CAPITO_DEFAULT_LOCALE is not a valid locale")?;

        let available_locales = match std::env::var("CAPITO_AVAILABLE_LOCALES") {
            Ok(raw) => parse_locale_list(&raw)
                .context("CAPITO_AVAILABLE_LOCALES contains an invalid locale")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            // Database
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),

            // Locales
            default_locale,
            available_locales,
        })
    }

    /// Locale defaults for contexts created from this configuration.
    pub fn locale_defaults(&self) -> LocaleDefaults {
        LocaleDefaults::new(
            self.default_locale.clone(),
            self.available_locales.iter().cloned(),
        )
    }
}

/// Parse a comma-separated locale list, skipping empty entries.
fn parse_locale_list(raw: &str) -> crate::Result<Vec<Locale>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Locale::parse)
        .collect()
}
