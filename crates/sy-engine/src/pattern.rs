//! Id pattern matching for the tracer's trace pattern
//!
//! Each pattern matches an id when it is equal to it, when it matches as a
//! wildcard (`*` any run, `?` one character), or when it matches as a full
//! regular expression. A set matches when any of its patterns matches.

use regex::Regex;

#[derive(Debug, Clone)]
struct CompiledPattern {
    raw: String,
    wildcard: Option<Regex>,
    regex: Option<Regex>,
}

impl CompiledPattern {
    fn compile(raw: &str) -> Self {
        let wildcard = if raw.contains('*') || raw.contains('?') {
            Regex::new(&wildcard_to_regex(raw)).ok()
        } else {
            None
        };
        // Not every pattern is a valid regex; those fall back to the other forms
        let regex = Regex::new(&format!("^(?:{})$", raw)).ok();
        Self {
            raw: raw.to_string(),
            wildcard,
            regex,
        }
    }

    fn matches(&self, name: &str) -> bool {
        if self.raw == name {
            return true;
        }
        if self.wildcard.as_ref().is_some_and(|re| re.is_match(name)) {
            return true;
        }
        self.regex.as_ref().is_some_and(|re| re.is_match(name))
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

impl PatternSet {
    /// Parse a comma separated list, trimming entries and dropping empty ones
    pub fn parse(csv: &str) -> Self {
        let patterns = sy_config::split_csv(Some(csv))
            .iter()
            .map(|p| CompiledPattern::compile(p))
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn as_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.raw.clone()).collect()
    }
}
