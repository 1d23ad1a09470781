//! Payload type registry and handler dispatch.
//!
//! Payload types are declared with a flavor: fire-and-forget handlers return
//! nothing, value handlers return a result that becomes the job's data. A
//! type can be declared before (or without) a handler; running such a job
//! fails it rather than failing startup.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::handler::{HandlerError, JobContext, JobHandler, JobPayload, ValueJobHandler};

/// Whether a payload type's handler produces a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    FireAndForget,
    Value,
}

/// Errors raised while resolving or running a handler.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(String),
    #[error("No handler registered for payload type: {0}")]
    HandlerNotRegistered(String),
    #[error("Failed to deserialize {payload_type} payload: {source}")]
    Deserialize {
        payload_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Payload does not match the handler registered for {0}")]
    PayloadMismatch(String),
    #[error("Failed to serialize handler output: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

type Decoded = Box<dyn Any + Send>;
type DecodeFn = fn(&str) -> Result<Decoded, serde_json::Error>;

fn decode<P: JobPayload>(payload: &str) -> Result<Decoded, serde_json::Error> {
    Ok(Box::new(serde_json::from_str::<P>(payload)?))
}

struct PayloadTypeEntry {
    kind: PayloadKind,
    decode: DecodeFn,
}

/// A payload that resolved to a known type and deserialized.
pub struct ResolvedPayload {
    payload_type: String,
    kind: PayloadKind,
    value: Decoded,
}

impl ResolvedPayload {
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }
}

trait ErasedHandler: Send + Sync {
    fn call(&self, payload: Decoded, ctx: JobContext)
    -> BoxFuture<'static, Result<Option<Value>, DispatchError>>;
}

struct FireAndForget<P, H> {
    handler: Arc<H>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: JobPayload, H: JobHandler<P>> ErasedHandler for FireAndForget<P, H> {
    fn call(
        &self,
        payload: Decoded,
        ctx: JobContext,
    ) -> BoxFuture<'static, Result<Option<Value>, DispatchError>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let payload = payload
                .downcast::<P>()
                .map_err(|_| DispatchError::PayloadMismatch(P::PAYLOAD_TYPE.to_string()))?;
            handler.handle(*payload, ctx).await?;
            Ok(None)
        })
    }
}

struct Valued<P, H> {
    handler: Arc<H>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: JobPayload, H: ValueJobHandler<P>> ErasedHandler for Valued<P, H> {
    fn call(
        &self,
        payload: Decoded,
        ctx: JobContext,
    ) -> BoxFuture<'static, Result<Option<Value>, DispatchError>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let payload = payload
                .downcast::<P>()
                .map_err(|_| DispatchError::PayloadMismatch(P::PAYLOAD_TYPE.to_string()))?;
            let output = handler.handle(*payload, ctx).await?;
            let value = serde_json::to_value(output).map_err(DispatchError::Serialize)?;
            Ok(Some(value))
        })
    }
}

/// Registry of payload types and their handlers; also the dispatcher.
///
/// Lookups are by the persisted `payload_type` string. Registration takes
/// `&self`, so handlers can be added while the scheduler is running.
#[derive(Default)]
pub struct JobHandlerRegistry {
    payload_types: RwLock<HashMap<String, PayloadTypeEntry>>,
    handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
    value_handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare_kind<P: JobPayload>(&self, kind: PayloadKind) {
        let mut types = self
            .payload_types
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = types.insert(
            P::PAYLOAD_TYPE.to_string(),
            PayloadTypeEntry {
                kind,
                decode: decode::<P>,
            },
        );
        if let Some(previous) = previous
            && previous.kind != kind
        {
            tracing::warn!(
                payload_type = P::PAYLOAD_TYPE,
                ?kind,
                "Payload type redeclared with a different flavor"
            );
        }
    }

    /// Declare a fire-and-forget payload type without a handler.
    pub fn declare<P: JobPayload>(&self) {
        self.declare_kind::<P>(PayloadKind::FireAndForget);
    }

    /// Declare a value-producing payload type without a handler.
    pub fn declare_value<P: JobPayload>(&self) {
        self.declare_kind::<P>(PayloadKind::Value);
    }

    /// Register the handler for a fire-and-forget payload type.
    pub fn register<P, H>(&self, handler: H)
    where
        P: JobPayload,
        H: JobHandler<P>,
    {
        self.declare::<P>();
        let erased: Arc<dyn ErasedHandler> = Arc::new(FireAndForget {
            handler: Arc::new(handler),
            _payload: PhantomData::<fn() -> P>,
        });
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(P::PAYLOAD_TYPE.to_string(), erased);
        if replaced.is_some() {
            tracing::warn!(payload_type = P::PAYLOAD_TYPE, "Replaced existing handler");
        }
    }

    /// Register the handler for a value-producing payload type.
    pub fn register_value<P, H>(&self, handler: H)
    where
        P: JobPayload,
        H: ValueJobHandler<P>,
    {
        self.declare_value::<P>();
        let erased: Arc<dyn ErasedHandler> = Arc::new(Valued {
            handler: Arc::new(handler),
            _payload: PhantomData::<fn() -> P>,
        });
        let replaced = self
            .value_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(P::PAYLOAD_TYPE.to_string(), erased);
        if replaced.is_some() {
            tracing::warn!(payload_type = P::PAYLOAD_TYPE, "Replaced existing value handler");
        }
    }

    pub fn payload_kind(&self, payload_type: &str) -> Option<PayloadKind> {
        self.payload_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payload_type)
            .map(|entry| entry.kind)
    }

    pub fn has_handler(&self, payload_type: &str) -> bool {
        match self.payload_kind(payload_type) {
            Some(kind) => self.handler_for(payload_type, kind).is_some(),
            None => false,
        }
    }

    /// All declared payload types, sorted.
    pub fn payload_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .payload_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    fn handler_for(&self, payload_type: &str, kind: PayloadKind) -> Option<Arc<dyn ErasedHandler>> {
        let map = match kind {
            PayloadKind::FireAndForget => &self.handlers,
            PayloadKind::Value => &self.value_handlers,
        };
        map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payload_type)
            .cloned()
    }

    /// Look up `payload_type` and deserialize `payload` into it.
    pub fn resolve(&self, payload_type: &str, payload: &str) -> Result<ResolvedPayload, DispatchError> {
        let (kind, decode) = {
            let types = self
                .payload_types
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = types
                .get(payload_type)
                .ok_or_else(|| DispatchError::UnknownPayloadType(payload_type.to_string()))?;
            (entry.kind, entry.decode)
        };

        let value = decode(payload).map_err(|source| DispatchError::Deserialize {
            payload_type: payload_type.to_string(),
            source,
        })?;

        Ok(ResolvedPayload {
            payload_type: payload_type.to_string(),
            kind,
            value,
        })
    }

    /// Run the handler for an already resolved payload.
    ///
    /// Fire-and-forget handlers yield `None`. A panic inside the handler is
    /// caught and reported as [`DispatchError::Panicked`].
    pub async fn dispatch(
        &self,
        resolved: ResolvedPayload,
        ctx: JobContext,
    ) -> Result<Option<Value>, DispatchError> {
        let handler = self
            .handler_for(&resolved.payload_type, resolved.kind)
            .ok_or_else(|| DispatchError::HandlerNotRegistered(resolved.payload_type.clone()))?;

        match AssertUnwindSafe(handler.call(resolved.value, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked(panic_message(&*panic))),
        }
    }

    /// Resolve and run in one step.
    pub async fn call_handler(
        &self,
        payload_type: &str,
        payload: &str,
        ctx: JobContext,
    ) -> Result<Option<Value>, DispatchError> {
        let resolved = self.resolve(payload_type, payload)?;
        self.dispatch(resolved, ctx).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;
    use queue_core::{JobId, StoreError};
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::JobDataSink;

    struct NullSink;

    impl JobDataSink for NullSink {
        fn write_data(
            &self,
            _job_id: JobId,
            _data: Option<String>,
        ) -> BoxFuture<'_, Result<bool, StoreError>> {
            Box::pin(async { Ok(true) })
        }
    }

    fn ctx() -> JobContext {
        JobContext::new(
            JobId::new(),
            "default",
            CancellationToken::new(),
            Arc::new(NullSink),
        )
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl JobPayload for Add {
        const PAYLOAD_TYPE: &'static str = "tests.Add";
    }

    struct AddHandler;

    impl ValueJobHandler<Add> for AddHandler {
        type Output = i64;

        async fn handle(&self, payload: Add, _ctx: JobContext) -> Result<i64, HandlerError> {
            Ok(payload.a + payload.b)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl JobPayload for Ping {
        const PAYLOAD_TYPE: &'static str = "tests.Ping";
    }

    struct Explode;

    impl JobHandler<Ping> for Explode {
        async fn handle(&self, _payload: Ping, _ctx: JobContext) -> Result<(), HandlerError> {
            panic!("kaboom");
        }
    }

    #[tokio::test]
    async fn value_handler_result_is_returned() {
        let registry = JobHandlerRegistry::new();
        registry.register_value::<Add, _>(AddHandler);

        assert_eq!(registry.payload_kind("tests.Add"), Some(PayloadKind::Value));
        let value = registry
            .call_handler("tests.Add", r#"{"a":2,"b":40}"#, ctx())
            .await
            .unwrap();
        assert_eq!(value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn closure_handlers_yield_no_value() {
        let registry = JobHandlerRegistry::new();
        registry.register::<Ping, _>(|_: Ping, _: JobContext| async { Ok::<(), HandlerError>(()) });

        let value = registry.call_handler("tests.Ping", "null", ctx()).await.unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn unknown_type_and_bad_payload_fail_resolution() {
        let registry = JobHandlerRegistry::new();
        registry.register_value::<Add, _>(AddHandler);

        assert!(matches!(
            registry.resolve("tests.Nope", "{}"),
            Err(DispatchError::UnknownPayloadType(t)) if t == "tests.Nope"
        ));
        assert!(matches!(
            registry.resolve("tests.Add", r#"{"a":"x"}"#),
            Err(DispatchError::Deserialize { .. })
        ));
    }

    #[tokio::test]
    async fn declared_type_without_handler_fails_at_dispatch() {
        let registry = JobHandlerRegistry::new();
        registry.declare::<Ping>();
        assert!(!registry.has_handler("tests.Ping"));

        let resolved = registry.resolve("tests.Ping", "null").unwrap();
        let err = registry.dispatch(resolved, ctx()).await.unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotRegistered(_)));
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let registry = JobHandlerRegistry::new();
        registry.register::<Ping, _>(Explode);

        let err = registry
            .call_handler("tests.Ping", "null", ctx())
            .await
            .unwrap_err();
        match err {
            DispatchError::Panicked(message) => assert_eq!(message, "kaboom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn payload_types_are_listed() {
        let registry = JobHandlerRegistry::new();
        registry.declare::<Ping>();
        registry.register_value::<Add, _>(AddHandler);
        assert_eq!(registry.payload_types(), vec!["tests.Add", "tests.Ping"]);
    }
}
