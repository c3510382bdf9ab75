//! Locale handling for translated attributes.
//!
//! # Architecture
//!
//! - `locale`: canonical `Locale` token, accepted in any case or separator style
//! - `defaults`: fallback default locale and available-locale set
//! - `context`: per-task `LocaleContext` with scoped overrides
//!
//! # Example
//!
//! ```
//! use capito::{Locale, LocaleContext, LocaleDefaults};
//!
//! let en = Locale::parse("en").unwrap();
//! let fr = Locale::parse("fr").unwrap();
//! let mut ctx = LocaleContext::new(LocaleDefaults::new(en.clone(), [fr.clone()]));
//!
//! let inside = ctx.with_locale(fr.clone(), |ctx| ctx.current_locale());
//! assert_eq!(inside, fr);
//! assert_eq!(ctx.current_locale(), en);
//! ```

mod context;
mod defaults;
mod locale;

pub use context::LocaleContext;
pub use defaults::{LocaleDefaults, PROCESS_DEFAULT_LOCALE};
pub use locale::Locale;
