use std::sync::Arc;

use serde_json::Value;
use sy_common::Exchange;

use super::{Language, Predicate};
use crate::error::EngineError;
use crate::Result;

/// Matches when the named header is present and truthy
pub struct HeaderLanguage;

impl Language for HeaderLanguage {
    fn name(&self) -> &str {
        "header"
    }

    fn create_predicate(&self, expression: &str) -> Result<Arc<dyn Predicate>> {
        let name = expression.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidExpression {
                language: "header".to_string(),
                expression: expression.to_string(),
                reason: "header name is empty".to_string(),
            });
        }
        Ok(Arc::new(HeaderPredicate {
            name: name.to_string(),
        }))
    }
}

struct HeaderPredicate {
    name: String,
}

impl Predicate for HeaderPredicate {
    fn matches(&self, exchange: &Exchange) -> Result<bool> {
        Ok(match exchange.message().header(&self.name) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            Some(_) => true,
        })
    }

    fn expression(&self) -> &str {
        &self.name
    }
}
