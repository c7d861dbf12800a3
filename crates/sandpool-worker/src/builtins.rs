//! Built-in diagnostic modules under the `builtin:` scheme.
//!
//! These exercise every worker code path: plain results, parameterised
//! results, long-running computation, environment probing, user-level
//! errors, and hard process death for crash-recovery testing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use sandpool_core::wire::WireError;

use crate::loader::{ComputeContext, ComputeModule, StaticLoader};

/// Register every built-in module on the loader.
pub fn register_all(loader: &mut StaticLoader) {
    loader.register("builtin:echo", Arc::new(Echo));
    loader.register("builtin:greet", Arc::new(Greet));
    loader.register("builtin:sleep", Arc::new(Sleep));
    loader.register("builtin:env", Arc::new(EnvProbe));
    loader.register("builtin:fail", Arc::new(Fail));
    loader.register("builtin:exit", Arc::new(Exit));
}

/// Returns its params unchanged.
struct Echo;

#[async_trait]
impl ComputeModule for Echo {
    async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        Ok(params)
    }
}

/// Returns `"Hello, <name>"` for `{"name": <string>}`.
struct Greet;

#[async_trait]
impl ComputeModule for Greet {
    async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| WireError {
                name: "TypeError".into(),
                message: "params.name must be a string".into(),
                status: 400,
            })?;
        Ok(json!(format!("Hello, {name}")))
    }
}

/// Sleeps `{"ms": <int>}` milliseconds. Stands in for long computation.
struct Sleep;

#[async_trait]
impl ComputeModule for Sleep {
    async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(1000);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(json!({ "sleptMs": ms }))
    }
}

/// Reports the environment variables visible to module code. After the
/// startup scrub this must be empty.
struct EnvProbe;

#[async_trait]
impl ComputeModule for EnvProbe {
    async fn compute(&self, _params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        let names: Vec<String> = std::env::vars_os()
            .map(|(key, _)| key.to_string_lossy().into_owned())
            .collect();
        Ok(json!({ "count": names.len(), "names": names }))
    }
}

/// Returns an error built from `{"name", "message", "status"}`.
struct Fail;

#[async_trait]
impl ComputeModule for Fail {
    async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("ComputeError");
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("module failed");
        let status = params
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        Err(WireError {
            name: name.into(),
            message: message.into(),
            status,
        })
    }
}

/// Kills the worker process with `{"code": <int>}`. Fault-injection hook
/// for crash-recovery testing; a real module can never reach this.
struct Exit;

#[async_trait]
impl ComputeModule for Exit {
    async fn compute(&self, params: Value, _ctx: &ComputeContext) -> Result<Value, WireError> {
        let code = params
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(1);
        std::process::exit(code);
    }
}
