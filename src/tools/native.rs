//! Process-local table of native tool handlers, looked up by name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::ToolError;
use super::types::ToolCallContext;

/// An in-process tool implementation.
#[async_trait]
pub trait NativeHandler: Send + Sync {
    async fn call(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        args: Value,
    ) -> Result<Value, ToolError>;
}

pub type BoxedFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// Adapter turning an async closure into a [`NativeHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> NativeHandler for FnHandler<F>
where
    F: Fn(ToolCallContext, Value) -> BoxedFuture + Send + Sync,
{
    async fn call(
        &self,
        _token: &CancellationToken,
        ctx: &ToolCallContext,
        args: Value,
    ) -> Result<Value, ToolError> {
        (self.0)(ctx.clone(), args).await
    }
}

/// Built-in handler returning the server clock.
pub struct CurrentTimeHandler;

#[async_trait]
impl NativeHandler for CurrentTimeHandler {
    async fn call(
        &self,
        _token: &CancellationToken,
        _ctx: &ToolCallContext,
        _args: Value,
    ) -> Result<Value, ToolError> {
        let now = chrono::Utc::now();
        Ok(serde_json::json!({
            "unix": now.timestamp(),
            "rfc3339": now.to_rfc3339(),
        }))
    }
}

pub const CURRENT_TIME_HANDLER: &str = "current_time";

// ─── NativeHandlerRegistry ───────────────────────────────────────────────────

#[derive(Default)]
pub struct NativeHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn NativeHandler>>>,
}

impl NativeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(CURRENT_TIME_HANDLER, Arc::new(CurrentTimeHandler));
        registry
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: &str, handler: Arc<dyn NativeHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            if handlers.insert(name.to_string(), handler).is_some() {
                tracing::warn!(handler = name, "native handler replaced");
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn NativeHandler>, ToolError> {
        self.handlers
            .read()
            .ok()
            .and_then(|h| h.get(name).cloned())
            .ok_or(ToolError::HandlerNotRegistered {
                handler: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
