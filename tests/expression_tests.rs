//! Expression evaluation through the public API.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use conveyor::expression::DictionaryResolver;
use conveyor::{
    ExecutionContext, ExpressionEvaluator, MissingKeyBehavior, ResolveError, SecretsResolver,
    StaticSecretProvider, WorkflowDefinition,
};

fn context_with(vars: Vec<(&str, Value)>) -> ExecutionContext {
    let def: WorkflowDefinition = serde_json::from_value(json!({
        "id": "wf",
        "tasks": [{"id": "t", "plugin_type": "noop", "operation": "run"}],
    }))
    .unwrap();
    ExecutionContext::seed(
        &def,
        vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    )
    .unwrap()
}

fn evaluator(vars: Vec<(&str, Value)>) -> ExpressionEvaluator {
    let mut evaluator = ExpressionEvaluator::new(MissingKeyBehavior::Error);
    evaluator.register(Arc::new(DictionaryResolver::new(context_with(vars))));
    evaluator.register(Arc::new(SecretsResolver::new(Arc::new(
        StaticSecretProvider::new(HashMap::from([(
            "db_password".to_string(),
            "hunter2".to_string(),
        )])),
    ))));
    evaluator
}

#[tokio::test]
async fn test_dictionary_pipeline_resolution() {
    let evaluator = evaluator(vec![("env", json!("prod"))]);
    let cancel = CancellationToken::new();

    assert_eq!(
        evaluator
            .evaluate("${dictionary('env')|upper}", &cancel)
            .await
            .unwrap(),
        json!("PROD")
    );
    assert_eq!(
        evaluator
            .evaluate("${dictionary('env')|upper|substring(0, 2)}", &cancel)
            .await
            .unwrap(),
        json!("PR")
    );
}

#[tokio::test]
async fn test_missing_key_is_error() {
    let evaluator = evaluator(vec![]);
    let err = evaluator
        .evaluate("${dictionary('missing')}", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));
}

#[tokio::test]
async fn test_secrets_source() {
    let evaluator = evaluator(vec![]);
    assert_eq!(
        evaluator
            .evaluate(
                "postgres://app:${secrets('db_password')}@db:5432/app",
                &CancellationToken::new()
            )
            .await
            .unwrap(),
        json!("postgres://app:hunter2@db:5432/app")
    );
}

#[tokio::test]
async fn test_math_pipeline_keeps_number_type() {
    let evaluator = evaluator(vec![("count", json!(4))]);
    let value = evaluator
        .evaluate("${dictionary('count')|mul(5)|add(2)}", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(value, json!(22));
}

#[tokio::test]
async fn test_arity_mismatch_reported() {
    let evaluator = evaluator(vec![("env", json!("prod"))]);
    let err = evaluator
        .evaluate("${dictionary('env')|substring}", &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ResolveError::FunctionArgument { function, got, .. } => {
            assert_eq!(function, "substring");
            assert_eq!(got, 0);
        }
        other => panic!("Expected FunctionArgument, got {:?}", other),
    }
}
