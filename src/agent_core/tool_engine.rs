//! Tool execution engine.
//!
//! Runs the tool-call batch of one model turn. Each call is resolved,
//! validated against its declared schema and invoked independently; every
//! call yields exactly one `tool_result` message, error-flagged on failure.
//! Calls within a batch run concurrently, each on its own task so a panicking
//! tool only fails its own call, and results come back in issuance order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::{json, Value};
use tokio_util::task::AbortOnDropHandle;

use super::errors::{join_failure_reason, ToolError};
use super::tool_registry::{Tool, ToolResolver};
use crate::inference::types::{Message, ToolCall, ToolResultPayload, ToolSchema};

/// Maximum retry attempts for transient tool errors.
const MAX_RETRIES: u32 = 2;

/// Base delay between retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Retry and timeout policy.
#[derive(Debug, Clone)]
pub struct ToolEngineConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Per-attempt limit. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for ToolEngineConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_base_delay: RETRY_BASE_DELAY,
            call_timeout: None,
        }
    }
}

#[derive(Clone)]
pub struct ToolExecutionEngine {
    resolver: Arc<dyn ToolResolver>,
    config: ToolEngineConfig,
}

impl ToolExecutionEngine {
    pub fn new(resolver: Arc<dyn ToolResolver>) -> Self {
        Self::with_config(resolver, ToolEngineConfig::default())
    }

    pub fn with_config(resolver: Arc<dyn ToolResolver>, config: ToolEngineConfig) -> Self {
        Self { resolver, config }
    }

    /// Execute every call and return one result message per call, in order.
    ///
    /// `declared` is the agent's tool list. When it is non-empty, only
    /// declared names are callable and their schemas take precedence over the
    /// tool's own.
    pub async fn execute_batch(&self, calls: &[ToolCall], declared: &[ToolSchema]) -> Vec<Message> {
        tracing::info!(
            count = calls.len(),
            tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "executing tool batch"
        );
        join_all(calls.iter().map(|call| self.execute_one(call, declared))).await
    }

    async fn execute_one(&self, call: &ToolCall, declared: &[ToolSchema]) -> Message {
        let start = Instant::now();

        // Dropping the handle (turn cancelled) aborts the call.
        let task = {
            let engine = self.clone();
            let call = call.clone();
            let declared = declared.to_vec();
            AbortOnDropHandle::new(tokio::spawn(async move { engine.run(&call, &declared).await }))
        };
        let outcome = task.await.unwrap_or_else(|e| {
            Err(ToolError::Execution {
                tool_name: call.name.clone(),
                reason: join_failure_reason(e),
            })
        });
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (result, is_error) = match outcome {
            Ok(value) => {
                tracing::info!(tool = %call.name, call_id = %call.id, elapsed_ms, "tool succeeded");
                (value, false)
            }
            Err(e) => {
                tracing::warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    elapsed_ms,
                    error = %e,
                    "tool failed"
                );
                (json!({ "error": e.to_string(), "kind": e.kind() }), true)
            }
        };

        Message::tool_result(ToolResultPayload {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
            is_error,
        })
    }

    async fn run(&self, call: &ToolCall, declared: &[ToolSchema]) -> Result<Value, ToolError> {
        let declared_schema = declared.iter().find(|s| s.name == call.name);
        if !declared.is_empty() && declared_schema.is_none() {
            return Err(ToolError::NotFound {
                name: call.name.clone(),
            });
        }

        let tool = self
            .resolver
            .resolve_tool(&call.name)
            .ok_or_else(|| ToolError::NotFound {
                name: call.name.clone(),
            })?;

        let arguments = if call.arguments.is_null() {
            json!({})
        } else {
            call.arguments.clone()
        };

        let schema = declared_schema.unwrap_or_else(|| tool.schema());
        validate_arguments(&call.name, schema, &arguments)?;

        self.invoke_with_retry(&call.name, tool.as_ref(), arguments).await
    }

    async fn invoke_with_retry(
        &self,
        tool_name: &str,
        tool: &dyn Tool,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            let result = match self.config.call_timeout {
                Some(limit) => tokio::time::timeout(limit, tool.execute(arguments.clone()))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ToolError::Timeout {
                            tool_name: tool_name.to_string(),
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }),
                None => tool.execute(arguments.clone()).await,
            };

            match result {
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    tracing::debug!(tool = %tool_name, attempt, error = %e, "retrying tool");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Structural check of arguments against a JSON Schema object.
///
/// Arguments must be an object, every `required` field must be present, and
/// top-level properties with a primitive `type` must match it. Full JSON
/// Schema validation is left to the tool.
pub fn validate_arguments(tool_name: &str, schema: &ToolSchema, arguments: &Value) -> Result<(), ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        tool_name: tool_name.to_string(),
        reason,
    };

    let args = arguments
        .as_object()
        .ok_or_else(|| invalid(format!("expected a JSON object, got {arguments}")))?;

    if let Some(required) = schema.parameters.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }
    }

    if let Some(props) = schema.parameters.get("properties").and_then(Value::as_object) {
        for (key, value) in args {
            let expected = props
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(invalid(format!("field '{key}' should be {expected}")));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
