//! The `simple` predicate language
//!
//! Grammar:
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := operand ( op operand )?
//! op      := == | != | > | < | >= | <= | contains | not contains
//!          | starts with | ends with | regex
//! operand := ${variable} | 'text' | "text" | number | true | false | null | word
//! ```
//! Variables: `body`, `header.X`, `exchangeProperty.X`, `exchangeId`,
//! `routeId`, `exception.message`. An operand on its own is tested for
//! truthiness.

use std::cmp::Ordering;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use sy_common::{Body, Exchange};

use super::{Language, Predicate};
use crate::error::EngineError;
use crate::Result;

pub struct SimpleLanguage;

impl Language for SimpleLanguage {
    fn name(&self) -> &str {
        "simple"
    }

    fn create_predicate(&self, expression: &str) -> Result<Arc<dyn Predicate>> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(expression, "unexpected trailing input"));
        }
        Ok(Arc::new(SimplePredicate {
            expression: expression.to_string(),
            expr,
        }))
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidExpression {
        language: "simple".to_string(),
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Num(f64),
    Word(String),
    Op(&'static str),
    And,
    Or,
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>' | '&' | '|')
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match (c, next) {
            ('$', Some('{')) => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| invalid(expression, "unclosed ${"))?;
                let name: String = chars[start..end].iter().collect();
                tokens.push(Token::Var(name.trim().to_string()));
                i = end + 1;
            }
            ('\'', _) | ('"', _) => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|p| start + p)
                    .ok_or_else(|| invalid(expression, "unterminated string literal"))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            ('&', Some('&')) => {
                tokens.push(Token::And);
                i += 2;
            }
            ('|', Some('|')) => {
                tokens.push(Token::Or);
                i += 2;
            }
            ('=', Some('=')) => {
                tokens.push(Token::Op("=="));
                i += 2;
            }
            ('!', Some('=')) => {
                tokens.push(Token::Op("!="));
                i += 2;
            }
            ('>', Some('=')) => {
                tokens.push(Token::Op(">="));
                i += 2;
            }
            ('<', Some('=')) => {
                tokens.push(Token::Op("<="));
                i += 2;
            }
            ('>', _) => {
                tokens.push(Token::Op(">"));
                i += 1;
            }
            ('<', _) => {
                tokens.push(Token::Op("<"));
                i += 1;
            }
            _ if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| invalid(expression, format!("bad number '{}'", text)))?;
                tokens.push(Token::Num(number));
            }
            _ if is_operator_char(c) => {
                return Err(invalid(expression, format!("unexpected '{}'", c)));
            }
            _ => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && !is_operator_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// Syntax Tree
// ============================================================================

#[derive(Debug, Clone)]
enum Variable {
    Body,
    Header(String),
    Property(String),
    ExchangeId,
    RouteId,
    ExceptionMessage,
}

impl Variable {
    fn parse(expression: &str, name: &str) -> Result<Self> {
        let prefixed = |prefixes: &[&str]| {
            prefixes
                .iter()
                .find_map(|p| name.strip_prefix(p))
                .filter(|rest| !rest.is_empty())
                .map(str::to_string)
        };

        match name {
            "body" | "in.body" => return Ok(Variable::Body),
            "exchangeId" | "id" => return Ok(Variable::ExchangeId),
            "routeId" => return Ok(Variable::RouteId),
            "exception.message" => return Ok(Variable::ExceptionMessage),
            _ => {}
        }
        if let Some(header) = prefixed(&["header.", "headers.", "in.header.", "in.headers."]) {
            return Ok(Variable::Header(header));
        }
        if let Some(property) = prefixed(&["exchangeProperty."]) {
            return Ok(Variable::Property(property));
        }
        Err(invalid(expression, format!("unknown variable '{}'", name)))
    }

    fn resolve(&self, exchange: &Exchange) -> Value {
        match self {
            Variable::Body => match exchange.message().body() {
                Body::Json(v) => v.clone(),
                body => body.as_text().map(Value::String).unwrap_or(Value::Null),
            },
            Variable::Header(name) => exchange.message().header(name).cloned().unwrap_or(Value::Null),
            Variable::Property(name) => exchange.property(name).cloned().unwrap_or(Value::Null),
            Variable::ExchangeId => Value::String(exchange.id().to_string()),
            Variable::RouteId => exchange
                .route_id()
                .map(|r| Value::String(r.to_string()))
                .unwrap_or(Value::Null),
            Variable::ExceptionMessage => exchange
                .failure()
                .map(|f| Value::String(f.message.clone()))
                .unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Var(Variable),
    Literal(Value),
}

impl Operand {
    fn resolve(&self, exchange: &Exchange) -> Value {
        match self {
            Operand::Var(v) => v.resolve(exchange),
            Operand::Literal(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex(Option<Regex>),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(Operand, Op, Operand),
    Truthy(Operand),
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_compare()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_compare()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = match *op {
                    "==" => Op::Eq,
                    "!=" => Op::Ne,
                    ">" => Op::Gt,
                    "<" => Op::Lt,
                    ">=" => Op::Ge,
                    _ => Op::Le,
                };
                self.pos += 1;
                op
            }
            Some(Token::Word(word)) => {
                let word = word.to_ascii_lowercase();
                self.pos += 1;
                match word.as_str() {
                    "contains" => Op::Contains,
                    "regex" => Op::Regex(None),
                    "not" => {
                        self.expect_word("contains")?;
                        Op::NotContains
                    }
                    "starts" => {
                        self.expect_word("with")?;
                        Op::StartsWith
                    }
                    "ends" => {
                        self.expect_word("with")?;
                        Op::EndsWith
                    }
                    other => {
                        return Err(invalid(self.expression, format!("unknown operator '{}'", other)))
                    }
                }
            }
            _ => return Ok(Expr::Truthy(left)),
        };

        let right = self.parse_operand()?;
        let op = match (op, &right) {
            (Op::Regex(_), Operand::Literal(Value::String(pattern))) => {
                let regex = Regex::new(pattern)
                    .map_err(|e| invalid(self.expression, format!("bad regex: {}", e)))?;
                Op::Regex(Some(regex))
            }
            (op, _) => op,
        };
        Ok(Expr::Compare(left, op, right))
    }

    fn expect_word(&mut self, expected: &str) -> Result<()> {
        match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(expected) => Ok(()),
            _ => Err(invalid(self.expression, format!("expected '{}'", expected))),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Var(name)) => Ok(Operand::Var(Variable::parse(self.expression, &name)?)),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Word(w)) => Ok(Operand::Literal(match w.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => Value::String(w),
            })),
            _ => Err(invalid(self.expression, "expected an operand")),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

struct SimplePredicate {
    expression: String,
    expr: Expr,
}

impl Predicate for SimplePredicate {
    fn matches(&self, exchange: &Exchange) -> Result<bool> {
        evaluate(&self.expr, exchange)
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

fn evaluate(expr: &Expr, exchange: &Exchange) -> Result<bool> {
    match expr {
        Expr::Or(l, r) => Ok(evaluate(l, exchange)? || evaluate(r, exchange)?),
        Expr::And(l, r) => Ok(evaluate(l, exchange)? && evaluate(r, exchange)?),
        Expr::Truthy(operand) => Ok(truthy(&operand.resolve(exchange))),
        Expr::Compare(left, op, right) => {
            let l = left.resolve(exchange);
            let r = right.resolve(exchange);
            compare(&l, op, &r)
        }
    }
}

fn compare(l: &Value, op: &Op, r: &Value) -> Result<bool> {
    Ok(match op {
        Op::Eq => loosely_equal(l, r),
        Op::Ne => !loosely_equal(l, r),
        Op::Gt => ordering(l, r) == Some(Ordering::Greater),
        Op::Lt => ordering(l, r) == Some(Ordering::Less),
        Op::Ge => matches!(ordering(l, r), Some(Ordering::Greater | Ordering::Equal)),
        Op::Le => matches!(ordering(l, r), Some(Ordering::Less | Ordering::Equal)),
        Op::Contains => contains(l, r),
        Op::NotContains => !contains(l, r),
        Op::StartsWith => !l.is_null() && text(l).starts_with(&text(r)),
        Op::EndsWith => !l.is_null() && text(l).ends_with(&text(r)),
        Op::Regex(Some(regex)) => !l.is_null() && regex.is_match(&text(l)),
        Op::Regex(None) => {
            let regex = Regex::new(&text(r))
                .map_err(|e| EngineError::PredicateEvaluation(format!("bad regex: {}", e)))?;
            !l.is_null() && regex.is_match(&text(l))
        }
    })
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => match (number(l), number(r)) {
            (Some(a), Some(b)) => a == b,
            _ => text(l) == text(r),
        },
    }
}

fn ordering(l: &Value, r: &Value) -> Option<Ordering> {
    if l.is_null() || r.is_null() {
        return None;
    }
    match (number(l), number(r)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(text(l).cmp(&text(r))),
    }
}

fn contains(l: &Value, r: &Value) -> bool {
    match l {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, r)),
        other => text(other).contains(&text(r)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}
