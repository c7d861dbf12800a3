//! Module loader seam.
//!
//! The worker itself never evaluates user code; it resolves a module URL
//! through a [`ModuleLoader`] and invokes the resulting entry point. The
//! loader is the sandbox collaborator's extension point; the binary wires a
//! [`StaticLoader`] carrying the built-in diagnostic modules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use sandpool_core::wire::WireError;

/// Opaque per-invocation evaluation context handed to compute modules.
///
/// Deliberately carries no handles to the host environment: a module can
/// time itself against the context and nothing else.
pub struct ComputeContext {
    started: Instant,
}

impl ComputeContext {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Wall-clock time since the invocation began.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Release context-scoped resources.
    pub(crate) fn finalize(self) {
        let elapsed_ms = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::trace!(elapsed_ms, "Compute context finalized");
    }
}

/// A resolved compute module: one async entry point.
#[async_trait]
pub trait ComputeModule: Send + Sync {
    async fn compute(&self, params: Value, ctx: &ComputeContext) -> Result<Value, WireError>;
}

/// Resolves a module URL to an executable compute entry point.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn resolve(&self, module_url: &str) -> Result<Arc<dyn ComputeModule>, WireError>;
}

/// Loader backed by a fixed registry of modules keyed by URL.
#[derive(Default)]
pub struct StaticLoader {
    modules: HashMap<String, Arc<dyn ComputeModule>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader pre-populated with the built-in diagnostic modules.
    pub fn with_builtins() -> Self {
        let mut loader = Self::new();
        crate::builtins::register_all(&mut loader);
        loader
    }

    /// Register a module under the given URL.
    pub fn register(&mut self, module_url: impl Into<String>, module: Arc<dyn ComputeModule>) {
        self.modules.insert(module_url.into(), module);
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn resolve(&self, module_url: &str) -> Result<Arc<dyn ComputeModule>, WireError> {
        self.modules
            .get(module_url)
            .cloned()
            .ok_or_else(|| WireError {
                name: "ModuleNotFound".into(),
                message: format!("no module registered for {module_url}"),
                status: 404,
            })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl ComputeModule for Doubler {
        async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
            let n = params.as_i64().ok_or_else(|| WireError {
                name: "TypeError".into(),
                message: "params must be a number".into(),
                status: 400,
            })?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn registered_module_resolves_and_runs() {
        let mut loader = StaticLoader::new();
        loader.register("test:double", Arc::new(Doubler));

        let module = loader.resolve("test:double").await.unwrap();
        let ctx = ComputeContext::new();
        let result = module.compute(json!(21), &ctx).await.unwrap();
        assert_eq!(result, json!(42));
        ctx.finalize();
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let loader = StaticLoader::new();
        let err = match loader.resolve("test:missing").await {
            Err(e) => e,
            Ok(_) => panic!("expected ModuleNotFound error"),
        };
        assert_eq!(err.name, "ModuleNotFound");
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn context_measures_elapsed_time() {
        let ctx = ComputeContext::new();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.elapsed() >= Duration::from_millis(20));
        ctx.finalize();
    }
}
