//! Guard expression evaluation.
//!
//! Guards are boolean expressions over the instance context and the event
//! payload. The expression language supports:
//!
//! - `ctx.field`, `ctx.field.nested` - context field access
//! - `evt.field` - event payload field access, `evt` - the whole payload
//! - `true`, `false`, `null`, numbers and `"strings"` as literals
//! - `a == b`, `a != b` - equality
//! - `a > b`, `a >= b`, `a < b`, `a <= b` - numeric ordering
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control
//!
//! A bare operand must evaluate to a boolean: `ctx.approved` is true only
//! when `approved` is `true`. Anything else is a non-boolean result, which
//! makes the guard fail closed. An ordering comparison on something that is
//! not a number is a runtime error, which makes the guard pass.

use crate::chart::{Context, Guard};
use crate::error::CoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Operand of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Path into the context.
    Ctx(String),
    /// Path into the event payload; empty means the whole payload.
    Evt(String),
    Literal(Value),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    /// Operand that must be a boolean.
    Value(Operand),
    /// Binary comparison.
    Compare(Operand, CmpOp, Operand),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

/// Why a guard could not produce a boolean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvalError {
    /// A bare operand resolved to something other than a boolean.
    NonBoolean(String),
    /// An ordering comparison on a non-number.
    TypeMismatch(String),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected input at '{}'", &s[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// The expression `true`.
    pub fn always() -> Self {
        GuardExpr::Value(Operand::Literal(Value::Bool(true)))
    }

    /// Evaluates the expression against a context and an event payload.
    pub fn evaluate(&self, ctx: &Context, event: &Value) -> Result<bool, GuardEvalError> {
        match self {
            GuardExpr::Value(op) => match resolve(op, ctx, event) {
                Value::Bool(b) => Ok(b),
                other => Err(GuardEvalError::NonBoolean(format!(
                    "{} is {}",
                    describe(op),
                    other
                ))),
            },
            GuardExpr::Compare(left, op, right) => {
                let a = resolve(left, ctx, event);
                let b = resolve(right, ctx, event);
                match op {
                    CmpOp::Eq => Ok(values_equal(&a, &b)),
                    CmpOp::Ne => Ok(!values_equal(&a, &b)),
                    _ => {
                        let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                            return Err(GuardEvalError::TypeMismatch(format!(
                                "cannot order {} and {}",
                                a, b
                            )));
                        };
                        Ok(match op {
                            CmpOp::Gt => x > y,
                            CmpOp::Ge => x >= y,
                            CmpOp::Lt => x < y,
                            _ => x <= y,
                        })
                    }
                }
            }
            GuardExpr::And(left, right) => {
                Ok(left.evaluate(ctx, event)? && right.evaluate(ctx, event)?)
            }
            GuardExpr::Or(left, right) => {
                Ok(left.evaluate(ctx, event)? || right.evaluate(ctx, event)?)
            }
            GuardExpr::Not(inner) => Ok(!inner.evaluate(ctx, event)?),
        }
    }
}

fn resolve(op: &Operand, ctx: &Context, event: &Value) -> Value {
    match op {
        Operand::Literal(v) => v.clone(),
        Operand::Ctx(path) => {
            let mut parts = path.split('.');
            let head = parts.next().and_then(|p| ctx.get(p));
            match head {
                Some(v) => get_field(v, parts),
                None => Value::Null,
            }
        }
        Operand::Evt(path) if path.is_empty() => event.clone(),
        Operand::Evt(path) => get_field(event, path.split('.')),
    }
}

fn get_field<'a>(root: &Value, parts: impl Iterator<Item = &'a str>) -> Value {
    let mut current = root;
    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn describe(op: &Operand) -> String {
    match op {
        Operand::Ctx(path) => format!("ctx.{}", path),
        Operand::Evt(path) if path.is_empty() => "evt".to_string(),
        Operand::Evt(path) => format!("evt.{}", path),
        Operand::Literal(v) => v.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

/// Simple recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            self.skip_whitespace();
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(CoreError::InvalidGuard {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        let left = self.parse_operand()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            CmpOp::Eq
        } else if self.peek_str("!=") {
            CmpOp::Ne
        } else if self.peek_str(">=") {
            CmpOp::Ge
        } else if self.peek_str("<=") {
            CmpOp::Le
        } else if self.peek_char() == Some('>') {
            CmpOp::Gt
        } else if self.peek_char() == Some('<') {
            CmpOp::Lt
        } else {
            return Ok(GuardExpr::Value(left));
        };
        self.pos += match op {
            CmpOp::Gt | CmpOp::Lt => 1,
            _ => 2,
        };

        let right = self.parse_operand()?;
        Ok(GuardExpr::Compare(left, op, right))
    }

    fn parse_operand(&mut self) -> Result<Operand, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('"') => return self.parse_string_value().map(Operand::Literal),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                return self.parse_number().map(Operand::Literal)
            }
            _ => {}
        }

        let word = self.parse_word();
        match word {
            "" => Err(CoreError::InvalidGuard {
                reason: format!("expected operand at '{}'", &self.input[self.pos..]),
            }),
            "true" => Ok(Operand::Literal(Value::Bool(true))),
            "false" => Ok(Operand::Literal(Value::Bool(false))),
            "null" => Ok(Operand::Literal(Value::Null)),
            "evt" => Ok(Operand::Evt(String::new())),
            _ => {
                if let Some(path) = word.strip_prefix("ctx.") {
                    Self::check_path(path).map(|p| Operand::Ctx(p.to_string()))
                } else if let Some(path) = word.strip_prefix("evt.") {
                    Self::check_path(path).map(|p| Operand::Evt(p.to_string()))
                } else {
                    Err(CoreError::InvalidGuard {
                        reason: format!("field must start with 'ctx.' or 'evt.', got '{}'", word),
                    })
                }
            }
        }
    }

    fn check_path(path: &str) -> Result<&str, CoreError> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(CoreError::InvalidGuard {
                reason: format!("invalid field path '{}'", path),
            });
        }
        Ok(path)
    }

    fn parse_word(&mut self) -> &'a str {
        let input = self.input;
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        &input[start..self.pos]
    }

    fn parse_string_value(&mut self) -> Result<Value, CoreError> {
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '"' {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Value::String(s.to_string()));
            }
            self.pos += c.len_utf8();
        }

        Err(CoreError::InvalidGuard {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let num_str = &self.input[start..self.pos];
        let invalid = || CoreError::InvalidGuard {
            reason: format!("invalid number: '{}'", num_str),
        };
        if let Ok(i) = num_str.parse::<i64>() {
            return Ok(Value::from(i));
        }
        let f = num_str.parse::<f64>().map_err(|_| invalid())?;
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(invalid)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// A parsed expression bound as a transition guard.
#[derive(Debug, Clone)]
pub struct CompiledGuard {
    source: String,
    expr: GuardExpr,
}

impl CompiledGuard {
    pub fn new(source: impl Into<String>, expr: GuardExpr) -> Self {
        Self {
            source: source.into(),
            expr,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &GuardExpr {
        &self.expr
    }
}

impl Guard for CompiledGuard {
    fn check(&self, ctx: &Context, event: &Value) -> bool {
        match self.expr.evaluate(ctx, event) {
            Ok(result) => result,
            Err(GuardEvalError::NonBoolean(reason)) => {
                tracing::debug!("Guard '{}' not boolean: {}", self.source, reason);
                false
            }
            Err(GuardEvalError::TypeMismatch(reason)) => {
                tracing::warn!("Guard '{}' failed to evaluate, allowing: {}", self.source, reason);
                true
            }
        }
    }
}

/// Resolves guard text into a guard: inline expression first, then the named
/// guard table. Text that resolves to neither yields a guard that always
/// passes. Empty text means no guard.
pub fn resolve_guard(text: &str, named: &BTreeMap<String, String>) -> Option<Arc<dyn Guard>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(expr) = GuardExpr::parse(text) {
        return Some(Arc::new(CompiledGuard::new(text, expr)));
    }

    if let Some(body) = named.get(text) {
        match GuardExpr::parse(body) {
            Ok(expr) => return Some(Arc::new(CompiledGuard::new(text, expr))),
            Err(e) => tracing::warn!("Named guard '{}' does not parse: {}", text, e),
        }
    } else {
        tracing::warn!("Guard '{}' is neither an expression nor a named guard", text);
    }

    Some(Arc::new(CompiledGuard::new(text, GuardExpr::always())))
}
