//! Predicate languages
//!
//! The tracer filter and conditional breakpoints are written as predicates in
//! a named language. A filter string may carry a `language:` prefix; without
//! one it is read as `simple`.

mod header;
mod simple;

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use sy_common::Exchange;
use tracing::debug;

use crate::error::EngineError;
use crate::Result;

pub use header::HeaderLanguage;
pub use simple::SimpleLanguage;

/// Language used when a filter has no prefix
pub const DEFAULT_LANGUAGE: &str = "simple";

pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> Result<bool>;

    /// The expression this predicate was created from
    fn expression(&self) -> &str;
}

pub trait Language: Send + Sync {
    fn name(&self) -> &str;

    fn create_predicate(&self, expression: &str) -> Result<Arc<dyn Predicate>>;
}

pub struct LanguageRegistry {
    languages: DashMap<String, Arc<dyn Language>>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LanguageRegistry {
    /// Registry without any language
    pub fn empty() -> Self {
        Self {
            languages: DashMap::new(),
        }
    }

    /// Registry with `simple` and `header`
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(SimpleLanguage));
        registry.register(Arc::new(HeaderLanguage));
        registry
    }

    pub fn register(&self, language: Arc<dyn Language>) {
        debug!(language = language.name(), "Registered predicate language");
        self.languages.insert(language.name().to_string(), language);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Language>> {
        self.languages
            .get(name)
            .map(|l| l.value().clone())
            .ok_or_else(|| EngineError::UnknownLanguage(name.to_string()))
    }

    pub fn create_predicate(&self, language: &str, expression: &str) -> Result<Arc<dyn Predicate>> {
        self.resolve(language)?.create_predicate(expression)
    }

    /// Create a predicate from `language:expression`, or from a bare simple
    /// expression
    pub fn parse_filter(&self, filter: &str) -> Result<Arc<dyn Predicate>> {
        match prefix_regex().captures(filter) {
            Some(caps) => {
                let language = caps.get(1).map_or("", |m| m.as_str());
                let expression = caps.get(2).map_or("", |m| m.as_str());
                self.create_predicate(language, expression)
            }
            None => self.create_predicate(DEFAULT_LANGUAGE, filter),
        }
    }
}

fn prefix_regex() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"(?s)^\s*([A-Za-z][A-Za-z0-9_-]*):(.*)$").expect("language prefix regex is valid")
    })
}
