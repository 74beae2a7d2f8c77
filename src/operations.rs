//! Operation registry: the seam between the gateway and domain handlers.
//!
//! Handlers receive decrypted, authenticated JSON arguments plus a
//! [`CallContext`] and return JSON. They never see keys or ciphertext.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who is calling, as established by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerKind {
    /// A paired companion client using its session token.
    Session,
    /// A developer using the bearer token and the root key.
    Developer,
    /// A paired peer device using its shared key.
    Peer,
    /// A member of a chat group using the group key.
    Group(String),
}

#[derive(Debug, Clone)]
pub struct CallContext {
    pub client_id: String,
    pub client_ip: String,
    pub caller: CallerKind,
}

/// Decrypted request plaintext: `{"query"|"operation": "...", "variables": {...}}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperationEnvelope {
    #[serde(alias = "query", alias = "op")]
    pub operation: String,
    #[serde(default)]
    pub variables: Value,
}

impl OperationEnvelope {
    pub fn parse(plaintext: &[u8]) -> Result<Self, DomainError> {
        let mut envelope: Self = serde_json::from_slice(plaintext)
            .map_err(|e| DomainError::InvalidArguments(format!("request envelope: {e}")))?;
        envelope.operation = envelope.operation.trim().to_string();
        if envelope.operation.is_empty() {
            return Err(DomainError::InvalidArguments("operation name is empty".into()));
        }
        if envelope.variables.is_null() {
            envelope.variables = Value::Object(Default::default());
        }
        Ok(envelope)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{message}")]
    Failed { message: String, path: Vec<String> },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            path: Vec::new(),
        }
    }

    /// Message shown to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

type Handler =
    Arc<dyn Fn(Value, CallContext) -> BoxFuture<'static, Result<Value, DomainError>> + Send + Sync>;

/// Name → handler table, built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, Handler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in operations (`ping`).
    pub fn with_builtin() -> Self {
        Self::new().register("ping", |_: Value, _ctx| async {
            Ok::<_, DomainError>(PingResponse { pong: true })
        })
    }

    /// Register a typed handler. Arguments are deserialized from the
    /// request variables; the result is serialized back to JSON.
    pub fn register<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, DomainError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |variables: Value, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            let fut: BoxFuture<'static, Result<Value, DomainError>> = Box::pin(async move {
                let args: A = serde_json::from_value(variables)
                    .map_err(|e| DomainError::InvalidArguments(e.to_string()))?;
                let result = handler(args, ctx).await?;
                serde_json::to_value(result).map_err(|e| DomainError::Internal(e.to_string()))
            });
            fut
        });
        if self.handlers.insert(name.to_string(), erased).is_some() {
            tracing::warn!(operation = name, "Operation registered twice, keeping the latest");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the named operation on its own task so a panicking handler
    /// surfaces as an internal error instead of tearing down the connection.
    pub async fn dispatch(
        &self,
        envelope: OperationEnvelope,
        ctx: CallContext,
    ) -> Result<Value, DomainError> {
        let handler = self
            .handlers
            .get(&envelope.operation)
            .cloned()
            .ok_or_else(|| DomainError::UnknownOperation(envelope.operation.clone()))?;

        let operation = envelope.operation;
        let client_id = ctx.client_id.clone();
        let joined = tokio::spawn(handler(envelope.variables, ctx)).await;
        match joined {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(operation = %operation, client_id = %client_id, error = %e, "Operation failed");
                }
                result
            }
            Err(e) => {
                tracing::error!(operation = %operation, client_id = %client_id, error = %e, "Operation task aborted");
                Err(DomainError::Internal(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct PingResponse {
    pong: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext {
            client_id: "c1".into(),
            client_ip: "127.0.0.1".into(),
            caller: CallerKind::Session,
        }
    }

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[test]
    fn envelope_accepts_query_alias() {
        let env = OperationEnvelope::parse(br#"{"query":"ping"}"#).unwrap();
        assert_eq!(env.operation, "ping");
        assert_eq!(env.variables, json!({}));
    }

    #[test]
    fn envelope_rejects_missing_operation() {
        assert!(matches!(
            OperationEnvelope::parse(br#"{"variables":{}}"#),
            Err(DomainError::InvalidArguments(_))
        ));
        assert!(OperationEnvelope::parse(br#"{"operation":"  "}"#).is_err());
        assert!(OperationEnvelope::parse(b"not json").is_err());
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let registry = OperationRegistry::with_builtin();
        let env = OperationEnvelope::parse(br#"{"operation":"ping"}"#).unwrap();
        assert_eq!(registry.dispatch(env, ctx()).await.unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn typed_handler_receives_arguments_and_context() {
        let registry = OperationRegistry::new().register("add", |args: AddArgs, ctx| async move {
            Ok::<_, DomainError>(json!({ "sum": args.a + args.b, "caller": ctx.client_id }))
        });
        let env = OperationEnvelope::parse(br#"{"operation":"add","variables":{"a":2,"b":3}}"#)
            .unwrap();
        assert_eq!(
            registry.dispatch(env, ctx()).await.unwrap(),
            json!({"sum": 5, "caller": "c1"})
        );
    }

    #[tokio::test]
    async fn bad_arguments_are_reported() {
        let registry = OperationRegistry::new()
            .register("add", |args: AddArgs, _| async move { Ok::<_, DomainError>(args.a + args.b) });
        let env = OperationEnvelope::parse(br#"{"operation":"add","variables":{"a":"x"}}"#)
            .unwrap();
        assert!(matches!(
            registry.dispatch(env, ctx()).await,
            Err(DomainError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let env = OperationEnvelope::parse(br#"{"operation":"nope"}"#).unwrap();
        assert!(matches!(
            OperationRegistry::with_builtin().dispatch(env, ctx()).await,
            Err(DomainError::UnknownOperation(_))
        ));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let registry = OperationRegistry::new().register("boom", |_: Value, _| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<_, DomainError>(Value::Null)
        });
        let env = OperationEnvelope::parse(br#"{"operation":"boom"}"#).unwrap();
        let err = registry.dispatch(env, ctx()).await.unwrap_err();
        assert_eq!(err.public_message(), "Internal error");
    }
}
