use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use conveyor::{
    parse_definition, DefinitionFormat, Engine, PluginError, PluginInvoker,
};

/// Demo connector that logs its invocation and echoes the parameters back.
struct EchoInvoker;

#[async_trait]
impl PluginInvoker for EchoInvoker {
    async fn invoke(
        &self,
        operation: &str,
        parameters: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<Value, PluginError> {
        tracing::info!(operation, ?parameters, "echo invocation");
        Ok(serde_json::json!({ "operation": operation, "parameters": parameters }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: conveyor <workflow.yaml|workflow.json>");
        std::process::exit(2);
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("failed to read {}: {}", path, e);
            std::process::exit(1);
        }
    };
    let format = if path.ends_with(".json") {
        DefinitionFormat::Json
    } else {
        DefinitionFormat::Yaml
    };
    let definition = match parse_definition(&content, format) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let engine = match Engine::builder()
        .plugin("echo", Arc::new(EchoInvoker))
        .build()
        .await
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    match engine.submit("local", definition, HashMap::new()).await {
        Ok(handle) => {
            let status = handle.wait().await;
            tracing::info!(execution_id = %handle.execution_id(), ?status, "execution finished");
            if let Ok(snapshot) = engine.status(handle.execution_id()).await {
                println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
    engine.shutdown();
}
