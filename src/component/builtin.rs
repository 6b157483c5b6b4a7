//! Built-in handlers
//!
//! Stock component and interceptor handlers available to every manifest.
//! Registered through a factory table so extensions follow the same path.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

use super::{AroundInvoke, HandlerRegistry, InstanceState, Invocation, MethodHandler};
use crate::core::error::{DeployError, DeployResult};

pub const ECHO_HANDLER: &str = "echo";
pub const AUDIT_INTERCEPTOR: &str = "audit";

/// Echo target: replies with its arguments. Useful for wiring checks.
struct EchoHandler;

#[async_trait]
impl MethodHandler for EchoHandler {
    fn id(&self) -> &str {
        ECHO_HANDLER
    }

    fn methods(&self) -> &[&'static str] {
        &["echo", "ping", "init", "shutdown"]
    }

    async fn invoke(
        &self,
        method: &str,
        args: JsonValue,
        state: &InstanceState,
    ) -> DeployResult<JsonValue> {
        match method {
            "echo" => Ok(args),
            "ping" => Ok(json!("pong")),
            "init" => {
                state.set_resource("ready", json!(true));
                Ok(JsonValue::Null)
            }
            "shutdown" => {
                state.set_resource("ready", json!(false));
                Ok(JsonValue::Null)
            }
            other => Err(DeployError::Invocation(format!(
                "no method {other} on handler {ECHO_HANDLER}"
            ))),
        }
    }
}

/// Audit interceptor: logs around the dispatch and counts calls in its
/// instance state under `calls`.
struct AuditInterceptor;

#[async_trait]
impl AroundInvoke for AuditInterceptor {
    fn id(&self) -> &str {
        AUDIT_INTERCEPTOR
    }

    fn methods(&self) -> &[&'static str] {
        &["log"]
    }

    async fn intercept(
        &self,
        _method: &str,
        state: &InstanceState,
        invocation: &mut Invocation<'_>,
    ) -> DeployResult<JsonValue> {
        let calls = state
            .resource("calls")
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        state.set_resource("calls", json!(calls + 1));
        debug!("audit: entering {}", invocation.method());
        let result = invocation.proceed().await;
        match &result {
            Ok(_) => debug!("audit: {} completed", invocation.method()),
            Err(err) => debug!("audit: {} failed: {err}", invocation.method()),
        }
        result
    }
}

type HandlerSetup = fn(&HandlerRegistry);

/// Registration table for the built-in handlers.
static BUILTIN_HANDLERS: Lazy<Vec<HandlerSetup>> = Lazy::new(|| {
    vec![
        |registry| registry.register_target(Arc::new(EchoHandler)),
        |registry| registry.register_interceptor(Arc::new(AuditInterceptor)),
    ]
});

pub(super) fn register_builtins(registry: &HandlerRegistry) {
    for setup in BUILTIN_HANDLERS.iter() {
        setup(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.target(ECHO_HANDLER).is_some());
        assert!(registry.interceptor(AUDIT_INTERCEPTOR).is_some());
    }

    #[tokio::test]
    async fn test_echo_replies_with_args() {
        let registry = HandlerRegistry::with_builtins();
        let echo = registry.target(ECHO_HANDLER).unwrap();
        let state = InstanceState::new();
        let reply = echo
            .invoke("echo", json!({ "n": 1 }), &state)
            .await
            .unwrap();
        assert_eq!(reply, json!({ "n": 1 }));
        assert_eq!(echo.invoke("ping", JsonValue::Null, &state).await.unwrap(), json!("pong"));
    }
}
