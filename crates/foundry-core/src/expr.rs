//! Condition expressions.
//!
//! Conditions are parsed once, at load time, into an [`Expr`] tree and then
//! evaluated against a [`Scope`] by structural recursion. The surface syntax
//! is a small function-call language:
//!
//! ```text
//! and(eq(parameters.buildWindows, true), ne(variables['Build.Reason'], 'Schedule'))
//! in(parameters.quality, 'insider', 'stable')
//! not(parameters.skipTests)
//! ```
//!
//! Evaluation is pure: the same scope always yields the same result.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("malformed expression `{input}` at offset {offset}: {message}")]
    Parse {
        input: String,
        offset: usize,
        message: String,
    },
    #[error("unknown reference `{0}`")]
    UnknownReference(String),
}

/// A runtime value produced by parameters, variables, and literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    String(String),
}

impl Value {
    /// Booleans are themselves; strings are true unless empty or `false`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        }
    }

    /// Equality used by `eq`, `ne` and `in`.
    ///
    /// Strings compare ASCII case-insensitively. A boolean compared with a
    /// string matches the string's `true`/`false` spelling.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
                s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
            }
            (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Null => Value::String(String::new()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

/// A named operand resolved from the run snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Parameter(String),
    Variable(String),
}

impl Reference {
    pub fn name(&self) -> &str {
        match self {
            Reference::Parameter(name) | Reference::Variable(name) => name,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Parameter(name) => write!(f, "parameters.{}", name),
            Reference::Variable(name) => write!(f, "variables.{}", name),
        }
    }
}

/// Resolves references during evaluation.
pub trait Scope {
    fn lookup(&self, reference: &Reference) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    In(Box<Expr>, Vec<Expr>),
}

impl Expr {
    /// Parse an expression. A surrounding `${{ ... }}` wrapper is accepted.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed);

        let tokens = tokenize(body)?;
        let mut parser = Parser {
            input: body,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_expr()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(parse_error(
                body,
                *offset,
                format!("unexpected trailing {}", token.describe()),
            ));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean using value truthiness.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        Ok(self.value(scope)?.is_truthy())
    }

    /// Evaluate to a value. `and` and `or` short-circuit left to right.
    pub fn value(&self, scope: &dyn Scope) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(reference) => scope
                .lookup(reference)
                .ok_or_else(|| ExprError::UnknownReference(reference.to_string())),
            Expr::Eq(left, right) => {
                let left = left.value(scope)?;
                Ok(Value::Bool(left.loosely_equals(&right.value(scope)?)))
            }
            Expr::Ne(left, right) => {
                let left = left.value(scope)?;
                Ok(Value::Bool(!left.loosely_equals(&right.value(scope)?)))
            }
            Expr::And(operands) => {
                for operand in operands {
                    if !operand.evaluate(scope)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(operands) => {
                for operand in operands {
                    if operand.evaluate(scope)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate(scope)?)),
            Expr::In(needle, candidates) => {
                let needle = needle.value(scope)?;
                for candidate in candidates {
                    if needle.loosely_equals(&candidate.value(scope)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
        }
    }

    /// Every reference in the tree, in source order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(reference) => out.push(reference),
            Expr::Eq(left, right) | Expr::Ne(left, right) => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expr::And(operands) | Expr::Or(operands) => {
                for operand in operands {
                    operand.collect_references(out);
                }
            }
            Expr::Not(inner) => inner.collect_references(out),
            Expr::In(needle, candidates) => {
                needle.collect_references(out);
                for candidate in candidates {
                    candidate.collect_references(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn call(f: &mut fmt::Formatter<'_>, name: &str, args: &[&Expr]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (idx, arg) in args.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", arg)?;
            }
            f.write_str(")")
        }

        match self {
            Expr::Literal(Value::Bool(b)) => write!(f, "{}", b),
            Expr::Literal(Value::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Ref(reference) => write!(f, "{}", reference),
            Expr::Eq(left, right) => call(f, "eq", &[left.as_ref(), right.as_ref()]),
            Expr::Ne(left, right) => call(f, "ne", &[left.as_ref(), right.as_ref()]),
            Expr::And(operands) => call(f, "and", &operands.iter().collect::<Vec<_>>()),
            Expr::Or(operands) => call(f, "or", &operands.iter().collect::<Vec<_>>()),
            Expr::Not(inner) => call(f, "not", &[inner.as_ref()]),
            Expr::In(needle, candidates) => {
                let mut args = vec![needle.as_ref()];
                args.extend(candidates.iter());
                call(f, "in", &args)
            }
        }
    }
}

/// A parsed activation condition, keeping its source text for display.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.trim().to_string(),
            expr: Expr::parse(source)?,
        })
    }

    pub fn literal(value: bool) -> Self {
        Self {
            source: value.to_string(),
            expr: Expr::Literal(Value::Bool(value)),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        self.expr.evaluate(scope)
    }
}

/// Authoring form of a condition: a YAML boolean or an expression string.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ConditionSource {
    Bool(bool),
    Text(String),
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ConditionSource::deserialize(deserializer)? {
            ConditionSource::Bool(value) => Ok(Condition::literal(value)),
            ConditionSource::Text(text) => {
                Condition::parse(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl JsonSchema for Condition {
    fn schema_name() -> String {
        "Condition".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        <ConditionSource as JsonSchema>::json_schema(generator)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier `{}`", name),
            Token::Str(s) => format!("string '{}'", s),
            Token::Number(n) => format!("number {}", n),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::LBracket => "`[`".to_string(),
            Token::RBracket => "`]`".to_string(),
            Token::Comma => "`,`".to_string(),
        }
    }
}

fn parse_error(input: &str, offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Parse {
        input: input.to_string(),
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((offset, token));
            i += 1;
            continue;
        }

        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            // '' inside a literal is an escaped quote
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(parse_error(input, offset, "unterminated string literal")),
                    Some(&(_, '\'')) => {
                        if matches!(chars.get(i + 1), Some(&(_, '\''))) {
                            text.push('\'');
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    }
                    Some(&(_, ch)) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((offset, Token::Str(text)));
        } else if c.is_ascii_digit()
            || (c == '-' && matches!(chars.get(i + 1), Some((_, d)) if d.is_ascii_digit()))
        {
            let start = i;
            i += 1;
            while matches!(chars.get(i), Some((_, d)) if d.is_ascii_digit() || *d == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            tokens.push((offset, Token::Number(text)));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while matches!(chars.get(i), Some((_, d)) if d.is_ascii_alphanumeric() || matches!(*d, '_' | '.' | '-'))
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            tokens.push((offset, Token::Ident(text)));
        } else {
            return Err(parse_error(
                input,
                offset,
                format!("unexpected character `{}`", c),
            ));
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Result<(usize, Token), ExprError> {
        match self.tokens.get(self.pos) {
            Some(entry) => {
                self.pos += 1;
                Ok(entry.clone())
            }
            None => Err(parse_error(
                self.input,
                self.input.len(),
                "unexpected end of expression",
            )),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let (offset, token) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(parse_error(
                self.input,
                offset,
                format!("expected {}, found {}", expected.describe(), token.describe()),
            ))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let (offset, token) = self.next()?;
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Number(n) => Ok(Expr::Literal(Value::String(n))),
            Token::Ident(name) => self.parse_ident(offset, name),
            other => Err(parse_error(
                self.input,
                offset,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn parse_ident(&mut self, offset: usize, name: String) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            return self.parse_call(offset, &name);
        }
        if name.eq_ignore_ascii_case("true") {
            return Ok(Expr::Literal(Value::Bool(true)));
        }
        if name.eq_ignore_ascii_case("false") {
            return Ok(Expr::Literal(Value::Bool(false)));
        }

        let (root, rest) = match name.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (name.as_str(), None),
        };
        let make: fn(String) -> Reference = match root {
            "parameters" => Reference::Parameter,
            "variables" => Reference::Variable,
            _ => {
                return Err(parse_error(
                    self.input,
                    offset,
                    format!("unknown identifier `{}`", name),
                ));
            }
        };

        match rest {
            Some("") => Err(parse_error(
                self.input,
                offset,
                format!("missing name after `{}.`", root),
            )),
            Some(key) => Ok(Expr::Ref(make(key.to_string()))),
            None => {
                self.expect(Token::LBracket)?;
                let (key_offset, key) = self.next()?;
                let Token::Str(key) = key else {
                    return Err(parse_error(
                        self.input,
                        key_offset,
                        format!("expected quoted name, found {}", key.describe()),
                    ));
                };
                self.expect(Token::RBracket)?;
                Ok(Expr::Ref(make(key)))
            }
        }
    }

    fn parse_call(&mut self, offset: usize, name: &str) -> Result<Expr, ExprError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.parse_expr()?);
                let (sep_offset, sep) = self.next()?;
                match sep {
                    Token::Comma => continue,
                    Token::RParen => break,
                    other => {
                        return Err(parse_error(
                            self.input,
                            sep_offset,
                            format!("expected `,` or `)`, found {}", other.describe()),
                        ));
                    }
                }
            }
        }

        let function = name.to_ascii_lowercase();
        let arity_error = |expected: &str, found: usize| {
            parse_error(
                self.input,
                offset,
                format!("{} expects {}, found {}", function, expected, found),
            )
        };

        match function.as_str() {
            "eq" | "ne" => {
                let found = args.len();
                let [left, right]: [Expr; 2] = args
                    .try_into()
                    .map_err(|_| arity_error("2 arguments", found))?;
                let (left, right) = (Box::new(left), Box::new(right));
                Ok(if function == "eq" {
                    Expr::Eq(left, right)
                } else {
                    Expr::Ne(left, right)
                })
            }
            "and" | "or" => {
                if args.len() < 2 {
                    return Err(arity_error("at least 2 arguments", args.len()));
                }
                Ok(if function == "and" {
                    Expr::And(args)
                } else {
                    Expr::Or(args)
                })
            }
            "not" => {
                let found = args.len();
                let [inner]: [Expr; 1] = args
                    .try_into()
                    .map_err(|_| arity_error("1 argument", found))?;
                Ok(Expr::Not(Box::new(inner)))
            }
            "in" => {
                if args.len() < 2 {
                    return Err(arity_error("at least 2 arguments", args.len()));
                }
                let mut args = args.into_iter();
                let needle = args
                    .next()
                    .ok_or_else(|| arity_error("at least 2 arguments", 0))?;
                Ok(Expr::In(Box::new(needle), args.collect()))
            }
            _ => Err(parse_error(
                self.input,
                offset,
                format!("unknown function `{}`", name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapScope(BTreeMap<Reference, Value>);

    impl MapScope {
        fn with(mut self, reference: Reference, value: impl Into<Value>) -> Self {
            self.0.insert(reference, value.into());
            self
        }
    }

    impl Scope for MapScope {
        fn lookup(&self, reference: &Reference) -> Option<Value> {
            self.0.get(reference).cloned()
        }
    }

    fn param(name: &str) -> Reference {
        Reference::Parameter(name.to_string())
    }

    fn var(name: &str) -> Reference {
        Reference::Variable(name.to_string())
    }

    #[test]
    fn test_parse_nested_calls() {
        let expr = Expr::parse(
            "and(eq(parameters.buildWindows, true), ne(variables['Build.Reason'], 'Schedule'))",
        )
        .unwrap();

        assert_eq!(
            expr,
            Expr::And(vec![
                Expr::Eq(
                    Box::new(Expr::Ref(param("buildWindows"))),
                    Box::new(Expr::Literal(Value::Bool(true))),
                ),
                Expr::Ne(
                    Box::new(Expr::Ref(var("Build.Reason"))),
                    Box::new(Expr::Literal(Value::String("Schedule".to_string()))),
                ),
            ])
        );
    }

    #[test]
    fn test_dotted_variable_reference() {
        let expr = Expr::parse("variables.Build.SourceBranchName").unwrap();
        assert_eq!(expr, Expr::Ref(var("Build.SourceBranchName")));
    }

    #[test]
    fn test_template_wrapper_is_accepted() {
        let expr = Expr::parse("${{ not(parameters.skip) }}").unwrap();
        assert_eq!(expr, Expr::Not(Box::new(Expr::Ref(param("skip")))));
    }

    #[test]
    fn test_evaluate_any_windows_target() {
        let expr = Expr::parse(
            "or(eq(parameters.win32, true), eq(parameters.win32arm64, true))",
        )
        .unwrap();
        let scope = MapScope::default()
            .with(param("win32"), false)
            .with(param("win32arm64"), true);

        assert!(expr.evaluate(&scope).unwrap());
    }

    #[test]
    fn test_and_short_circuits_before_unknown_reference() {
        let expr = Expr::parse("and(false, parameters.missing)").unwrap();
        assert_eq!(expr.evaluate(&MapScope::default()), Ok(false));

        let expr = Expr::parse("or(true, variables.missing)").unwrap();
        assert_eq!(expr.evaluate(&MapScope::default()), Ok(true));
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let expr = Expr::parse("eq(parameters.quality, 'stable')").unwrap();
        assert_eq!(
            expr.evaluate(&MapScope::default()),
            Err(ExprError::UnknownReference("parameters.quality".to_string()))
        );
    }

    #[test]
    fn test_in_and_case_insensitive_equality() {
        let expr = Expr::parse("in(parameters.quality, 'insider', 'stable')").unwrap();
        let scope = MapScope::default().with(param("quality"), "Stable");
        assert!(expr.evaluate(&scope).unwrap());

        let scope = MapScope::default().with(param("quality"), "exploration");
        assert!(!expr.evaluate(&scope).unwrap());
    }

    #[test]
    fn test_boolean_against_string_spelling() {
        let expr = Expr::parse("eq(variables.publish, true)").unwrap();
        let scope = MapScope::default().with(var("publish"), "True");
        assert!(expr.evaluate(&scope).unwrap());
    }

    #[test]
    fn test_truthiness_of_bare_values() {
        assert!(Value::from("yes").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from("FALSE").is_truthy());
        assert!(!Value::Bool(false).is_truthy());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let expr = Expr::parse("and(parameters.a, not(eq(variables.b, 'x')))").unwrap();
        let scope = MapScope::default()
            .with(param("a"), true)
            .with(var("b"), "y");

        let first = expr.evaluate(&scope);
        for _ in 0..100 {
            assert_eq!(expr.evaluate(&scope), first);
        }
    }

    #[test]
    fn test_malformed_expressions() {
        for input in [
            "",
            "eq(parameters.a)",
            "and(true)",
            "not(true, false)",
            "eq(parameters.a, 'unterminated)",
            "frobnicate(true, false)",
            "eq(parameters.a, true) extra",
            "build.reason",
            "variables[Build]",
            "eq(parameters., true)",
        ] {
            assert!(
                matches!(Expr::parse(input), Err(ExprError::Parse { .. })),
                "expected parse error for {:?}",
                input
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        let source = "and(in(parameters.q, 'a', 'it''s'), not(variables.Build.Reason), -1)";
        let expr = Expr::parse(source).unwrap();
        let reparsed = Expr::parse(&expr.to_string()).unwrap();
        assert_eq!(expr, reparsed);
    }

    #[test]
    fn test_references_in_source_order() {
        let expr = Expr::parse("or(eq(parameters.a, variables.b), parameters.c)").unwrap();
        let names: Vec<String> = expr.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(names, vec!["parameters.a", "variables.b", "parameters.c"]);
    }

    #[test]
    fn test_condition_from_yaml() {
        #[derive(Deserialize)]
        struct Holder {
            condition: Condition,
        }

        let holder: Holder = serde_yaml::from_str("condition: false").unwrap();
        assert_eq!(holder.condition.expr(), &Expr::Literal(Value::Bool(false)));

        let holder: Holder =
            serde_yaml::from_str("condition: \"eq(parameters.snap, true)\"").unwrap();
        assert_eq!(holder.condition.source(), "eq(parameters.snap, true)");

        assert!(serde_yaml::from_str::<Holder>("condition: \"eq(\"").is_err());
    }
}
