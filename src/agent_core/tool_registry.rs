//! Tool registry — name → callable-with-schema.
//!
//! Tools are registered under their fully-qualified name (`namespace.tool`).
//! An optional whitelist restricts which registered tools may be resolved;
//! anything outside it resolves to nothing, exactly like an unknown name.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::errors::ToolError;
use crate::inference::types::ToolSchema;

/// An executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> &ToolSchema;

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// The lookup the execution engine consumes.
pub trait ToolResolver: Send + Sync {
    fn resolve_tool(&self, name: &str) -> Option<Arc<dyn Tool>>;
}

type Handler = dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A tool backed by an async closure.
pub struct FunctionTool {
    schema: ToolSchema,
    handler: Box<Handler>,
}

impl FunctionTool {
    pub fn new<F, Fut>(schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            schema,
            handler: Box::new(move |args| handler(args).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.handler)(arguments).await
    }
}

/// Registry of callable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    whitelist: Option<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its schema name, replacing any previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Only names in `allowed` resolve from now on.
    pub fn set_whitelist(&mut self, allowed: HashSet<String>) {
        tracing::info!(
            registered = self.tools.len(),
            allowed = allowed.len(),
            "tool whitelist applied"
        );
        self.whitelist = Some(allowed);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Schemas of every resolvable tool.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tool_names()
            .into_iter()
            .filter(|name| self.is_allowed(name))
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema().clone())
            .collect()
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.whitelist
            .as_ref()
            .map_or(true, |allowed| allowed.contains(name))
    }

    /// Resolve a tool name the way models tend to emit it.
    ///
    /// 1. Exact fully-qualified match.
    /// 2. Unprefixed name (`get_weather` → `weather.get_weather`), only when
    ///    exactly one registered tool has that suffix.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((fq, _)) = self.tools.get_key_value(name) {
            return self.is_allowed(fq).then_some(fq.as_str());
        }

        let suffix = format!(".{name}");
        let mut matches = self
            .tools
            .keys()
            .filter(|fq| fq.ends_with(&suffix) && self.is_allowed(fq));
        let first = matches.next()?;
        if matches.next().is_some() {
            tracing::warn!(tool = %name, "ambiguous unprefixed tool name");
            return None;
        }
        Some(first.as_str())
    }
}

impl ToolResolver for ToolRegistry {
    fn resolve_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let resolved = self.resolve(name)?;
        if resolved != name {
            tracing::debug!(requested = %name, resolved = %resolved, "resolved unprefixed tool name");
        }
        self.tools.get(resolved).cloned()
    }
}
