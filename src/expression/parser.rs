//! Token grammar: a parameter value is literal text with embedded
//! `${source(key)}` tokens, each optionally piped through named
//! transformation functions, e.g. `${dictionary('env')|upper|trim}` or
//! `${dictionary('count')|add(1)}`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::ResolveError;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("token pattern is valid"));

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").expect("call pattern is valid")
});

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\s*\((.*)\))?$").expect("function pattern is valid")
});

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Literal(String),
    Token(Token),
}

/// One `${source(key)|fn|...}` occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub source: String,
    pub key: String,
    pub pipeline: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Value>,
}

impl Expression {
    /// Whether the whole parameter is exactly one token. Such parameters
    /// keep the resolved value's JSON type instead of stringifying.
    pub fn single_token(&self) -> Option<&Token> {
        match self.parts.as_slice() {
            [Part::Token(token)] => Some(token),
            _ => None,
        }
    }
}

/// Whether a raw parameter contains any expression token.
pub fn contains_token(raw: &str) -> bool {
    TOKEN_RE.is_match(raw)
}

/// Parse a raw parameter value into literal and token parts.
pub fn parse_expression(raw: &str) -> Result<Expression, ResolveError> {
    let mut parts = Vec::new();
    let mut last_end = 0;

    for capture in TOKEN_RE.captures_iter(raw) {
        let whole = capture.get(0).ok_or_else(|| syntax(raw))?;
        let inner = capture.get(1).ok_or_else(|| syntax(raw))?;

        if whole.start() > last_end {
            parts.push(Part::Literal(raw[last_end..whole.start()].to_string()));
        }
        parts.push(Part::Token(parse_token(inner.as_str())?));
        last_end = whole.end();
    }

    if last_end < raw.len() {
        parts.push(Part::Literal(raw[last_end..].to_string()));
    }
    if parts.is_empty() {
        parts.push(Part::Literal(String::new()));
    }

    Ok(Expression { parts })
}

fn syntax(detail: &str) -> ResolveError {
    ResolveError::Syntax(detail.to_string())
}

fn parse_token(inner: &str) -> Result<Token, ResolveError> {
    let segments = split_unquoted(inner, '|');
    let mut segments = segments.iter().map(|s| s.trim());

    let head = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| syntax(inner))?;
    let call = CALL_RE.captures(head).ok_or_else(|| syntax(head))?;
    let source = call[1].to_string();
    let key = unquote(call[2].trim());
    if key.is_empty() {
        return Err(syntax(head));
    }

    let mut pipeline = Vec::new();
    for segment in segments {
        if segment.is_empty() {
            return Err(syntax(inner));
        }
        let captures = FUNCTION_RE.captures(segment).ok_or_else(|| syntax(segment))?;
        let name = captures[1].to_string();
        let args = match captures.get(2) {
            Some(raw_args) if !raw_args.as_str().trim().is_empty() => {
                split_unquoted(raw_args.as_str(), ',')
                    .iter()
                    .map(|a| parse_argument(a.trim()))
                    .collect()
            }
            _ => Vec::new(),
        };
        pipeline.push(FunctionCall { name, args });
    }

    Ok(Token {
        source,
        key,
        pipeline,
    })
}

/// Split on `sep`, ignoring separators inside single or double quotes.
fn split_unquoted(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                current.push(c);
                quote = Some(c);
            }
            None if c == sep => {
                out.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    out.push(current);
    out
}

fn unquote(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

fn parse_argument(raw: &str) -> Value {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
