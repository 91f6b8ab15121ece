//! Expression evaluation for task parameter binding.
//!
//! A parameter value is either a literal or a string containing one or more
//! `${source(key)}` tokens, optionally piped through transformation
//! functions: `${dictionary('env')|upper}`. Tokens dispatch to the
//! [`SourceResolver`] registered for their source name. An unresolvable
//! token is fatal for the task and never retried.

mod functions;
mod parser;
mod resolver;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use parser::{contains_token, parse_expression, Expression, FunctionCall, Part, Token};
pub use resolver::{DictionaryResolver, SecretsResolver, SourceResolver};

/// Expression-level errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid expression: {0}")]
    Syntax(String),
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("Key not found in source '{source_name}': {key}")]
    NotFound { source_name: String, key: String },
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Function '{function}' expects {expected} argument(s), got {got}")]
    FunctionArgument {
        function: String,
        expected: String,
        got: usize,
    },
    #[error("Type error in function '{function}': {detail}")]
    Type { function: String, detail: String },
    #[error("Source '{source_name}' failed: {detail}")]
    Source { source_name: String, detail: String },
}

/// What a resolver miss on a key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKeyBehavior {
    /// Fail parameter resolution (default).
    #[default]
    Error,
    /// Resolve the token to null (empty string when embedded in text).
    Null,
}

/// Evaluates parameter expressions against a set of named source resolvers.
pub struct ExpressionEvaluator {
    resolvers: HashMap<String, Arc<dyn SourceResolver>>,
    missing_key: MissingKeyBehavior,
}

impl ExpressionEvaluator {
    pub fn new(missing_key: MissingKeyBehavior) -> Self {
        Self {
            resolvers: HashMap::new(),
            missing_key,
        }
    }

    pub fn register(&mut self, resolver: Arc<dyn SourceResolver>) {
        self.resolvers.insert(resolver.name().to_string(), resolver);
    }

    /// Evaluate a raw parameter value. A parameter that is exactly one token
    /// keeps the resolved value's JSON type; tokens embedded in longer text
    /// stringify into the surrounding literal.
    pub async fn evaluate(
        &self,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        let expr = parse_expression(raw)?;

        if let Some(token) = expr.single_token() {
            return self.evaluate_token(token, cancel).await;
        }

        let mut out = String::new();
        for part in &expr.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Token(token) => {
                    let value = self.evaluate_token(token, cancel).await?;
                    out.push_str(&functions::stringify(&value));
                }
            }
        }
        Ok(Value::String(out))
    }

    async fn evaluate_token(
        &self,
        token: &Token,
        cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        let resolver = self
            .resolvers
            .get(&token.source)
            .ok_or_else(|| ResolveError::UnknownSource(token.source.clone()))?;

        let mut value = match resolver.resolve(&token.key, cancel).await {
            Err(ResolveError::NotFound { .. })
                if self.missing_key == MissingKeyBehavior::Null =>
            {
                Value::Null
            }
            other => other?,
        };

        for call in &token.pipeline {
            value = functions::apply(call, value)?;
        }
        Ok(value)
    }
}
