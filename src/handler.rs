//! Type-erased callback storage: message handlers, the two middleware
//! pipelines and the lifecycle listeners.

use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ack::AckSender;
use crate::adapter::Adapter;
use crate::socket::{DisconnectReason, Socket};

/// Result of a middleware stage. The first error short-circuits the chain.
pub(crate) type MiddlewareRes = Result<(), Box<dyn Display + Send>>;

/// Connect-time middleware, run before a socket joins its namespace.
pub(crate) type BoxedConnectMiddleware<A> =
    Arc<dyn Fn(Arc<Socket<A>>) -> BoxFuture<'static, MiddlewareRes> + Send + Sync>;

/// Event-time middleware, run before an inbound event reaches handlers.
pub(crate) type BoxedEventMiddleware<A> = Arc<
    dyn Fn(Arc<Socket<A>>, Cow<'static, str>, Value) -> BoxFuture<'static, MiddlewareRes>
        + Send
        + Sync,
>;

/// Listener invoked when a socket is accepted into a namespace.
pub(crate) type ConnectListener<A> = Arc<dyn Fn(Arc<Socket<A>>) + Send + Sync>;

/// One-shot lifecycle listener (`disconnecting` / `disconnect`).
pub(crate) type LifecycleHandler<A> = Box<dyn FnOnce(Arc<Socket<A>>, DisconnectReason) + Send>;

/// Listener for namespace-scoped errors reported to this socket.
pub(crate) type ErrorHandler<A> = Arc<dyn Fn(Arc<Socket<A>>, String) + Send + Sync>;

pub(crate) type BoxedMessageHandler<A> = Box<dyn MessageCaller<A>>;

pub(crate) trait MessageCaller<A: Adapter>: Send + Sync + 'static {
    fn call(
        &self,
        s: Arc<Socket<A>>,
        v: Value,
        b: Vec<Bytes>,
        ack_id: Option<i64>,
    ) -> Result<(), serde_json::Error>;
}

pub(crate) struct MessageHandler<Param, F> {
    param: std::marker::PhantomData<Param>,
    handler: F,
}

impl<Param, F> MessageHandler<Param, F> {
    pub(crate) fn boxed<A>(handler: F) -> Box<Self>
    where
        Param: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<Socket<A>>, Param, Vec<Bytes>, AckSender<A>) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
        A: Adapter,
    {
        Box::new(Self {
            param: std::marker::PhantomData,
            handler,
        })
    }
}

impl<Param, F, A> MessageCaller<A> for MessageHandler<Param, F>
where
    Param: DeserializeOwned + Send + Sync + 'static,
    F: Fn(Arc<Socket<A>>, Param, Vec<Bytes>, AckSender<A>) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
    A: Adapter,
{
    fn call(
        &self,
        s: Arc<Socket<A>>,
        v: Value,
        b: Vec<Bytes>,
        ack_id: Option<i64>,
    ) -> Result<(), serde_json::Error> {
        // Unwrap single-argument payloads so plain types deserialize
        // directly.
        let v = match v {
            Value::Array(v) if v.len() == 1 => v.into_iter().next().unwrap_or(Value::Null),
            v => v,
        };
        let v: Param = serde_json::from_value(v)?;
        let ack = AckSender::new(s.clone(), ack_id);
        let fut = (self.handler)(s, v, b, ack);
        tokio::spawn(fut);
        Ok(())
    }
}
