//! Single-task execution: parameter resolution, plugin invocation under a
//! timeout, and retry with backoff.
//!
//! Parameter resolution failures are fatal for the task and never retried;
//! the backoff policy applies only to plugin invocation failures and
//! timeouts. Cancellation is checked before each attempt: a cancelled task
//! reports [`TaskError::Cancelled`], which the scheduler records as
//! `Skipped`, not `Failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::definition::{RetryPolicy, TaskDefinition};
use crate::error::TaskError;
use crate::events::{EngineEvent, EventEmitter};
use crate::expression::{
    DictionaryResolver, ExpressionEvaluator, MissingKeyBehavior, SecretsResolver, SourceResolver,
};
use crate::plugin::PluginInvokerRegistry;

/// Everything a worker needs to run one task attempt-series.
pub struct TaskAssignment {
    pub execution_id: String,
    pub task: TaskDefinition,
    pub context: ExecutionContext,
    pub retry: RetryPolicy,
    pub timeout_secs: u64,
    pub cancel: CancellationToken,
    pub secrets: Arc<SecretsResolver>,
}

/// Terminal report for one task attempt-series.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: String,
    /// Invocation attempts actually made (zero when resolution failed).
    pub attempts: u32,
    pub result: Result<Value, TaskError>,
}

pub struct TaskExecutor {
    plugins: Arc<PluginInvokerRegistry>,
    missing_key: MissingKeyBehavior,
    events: EventEmitter,
}

impl TaskExecutor {
    pub fn new(
        plugins: Arc<PluginInvokerRegistry>,
        missing_key: MissingKeyBehavior,
        events: EventEmitter,
    ) -> Self {
        Self {
            plugins,
            missing_key,
            events,
        }
    }

    pub async fn execute(&self, assignment: TaskAssignment) -> TaskOutcome {
        let task_id = assignment.task.id.clone();
        let result = self.execute_inner(&assignment).await;
        match result {
            Ok((attempts, value)) => TaskOutcome {
                task_id,
                attempts,
                result: Ok(value),
            },
            Err((attempts, error)) => TaskOutcome {
                task_id,
                attempts,
                result: Err(error),
            },
        }
    }

    async fn execute_inner(
        &self,
        assignment: &TaskAssignment,
    ) -> Result<(u32, Value), (u32, TaskError)> {
        let task = &assignment.task;

        if assignment.cancel.is_cancelled() {
            return Err((0, TaskError::Cancelled));
        }

        let parameters = self
            .resolve_parameters(assignment)
            .await
            .map_err(|e| (0, e))?;

        let invoker = self
            .plugins
            .get(&task.plugin_type)
            .ok_or_else(|| (0, TaskError::UnknownPlugin(task.plugin_type.clone())))?;

        let max_retries = assignment.retry.max_retries;
        let mut attempts = 0u32;
        let mut last_error: Option<TaskError> = None;

        for attempt in 0..=max_retries {
            // Cooperative cancellation point: in-flight attempts are never
            // preempted, but no new attempt starts once the signal is set.
            if assignment.cancel.is_cancelled() {
                return Err((attempts, TaskError::Cancelled));
            }

            attempts += 1;
            let invocation = invoker.invoke(&task.operation, &parameters, &assignment.cancel);
            let error = match tokio::time::timeout(
                Duration::from_secs(assignment.timeout_secs),
                invocation,
            )
            .await
            {
                Ok(Ok(value)) => return Ok((attempts, value)),
                Ok(Err(e)) => TaskError::PluginInvocation {
                    plugin_type: task.plugin_type.clone(),
                    operation: task.operation.clone(),
                    message: e.to_string(),
                },
                Err(_) => TaskError::Timeout {
                    secs: assignment.timeout_secs,
                },
            };

            let will_retry = attempt < max_retries && error.is_retryable();
            if will_retry {
                let delay = assignment.retry.backoff.delay(attempt);
                self.events
                    .emit(EngineEvent::TaskRetrying {
                        execution_id: assignment.execution_id.clone(),
                        task_id: task.id.clone(),
                        attempt: attempts,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    })
                    .await;
                last_error = Some(error);
                // Non-blocking wait: the worker slot is held, but the
                // runtime thread is free.
                tokio::time::sleep(delay).await;
            } else {
                last_error = Some(error);
                break;
            }
        }

        let last = last_error.unwrap_or_else(|| TaskError::PluginInvocation {
            plugin_type: task.plugin_type.clone(),
            operation: task.operation.clone(),
            message: "unknown error".to_string(),
        });
        let error = if attempts > 1 {
            TaskError::RetryExhausted {
                attempts,
                last: Box::new(last),
            }
        } else {
            last
        };
        Err((attempts, error))
    }

    async fn resolve_parameters(
        &self,
        assignment: &TaskAssignment,
    ) -> Result<HashMap<String, Value>, TaskError> {
        let mut evaluator = ExpressionEvaluator::new(self.missing_key);
        evaluator.register(Arc::new(DictionaryResolver::new(assignment.context.clone())));
        evaluator.register(Arc::clone(&assignment.secrets) as Arc<dyn SourceResolver>);

        let mut resolved = HashMap::new();
        for (name, raw) in &assignment.task.parameters {
            let value = evaluator.evaluate(raw, &assignment.cancel).await?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}
