use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Per-model request logic plugged into a [`Worker`](crate::Worker).
///
/// The worker runs `handle_request` once per inbound message, and several
/// invocations may be in flight at the same time.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError>;

    /// Body published to the reply address when `handle_request` fails.
    ///
    /// `None` drops the message without replying.
    fn error_reply(&self, _error: &HandlerError) -> Option<Value> {
        None
    }
}

#[async_trait]
impl<H> RequestHandler for Box<H>
where
    H: RequestHandler + ?Sized,
{
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError> {
        (**self).handle_request(params).await
    }

    fn error_reply(&self, error: &HandlerError) -> Option<Value> {
        (**self).error_reply(error)
    }
}

/// Replies with the request params unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError> {
        Ok(params)
    }
}

pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure over raw JSON params.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError> {
        (self.f)(params).await
    }
}

pub struct TypedHandler<F, Req> {
    f: F,
    _request: PhantomData<fn(Req)>,
}

/// Wraps an async closure taking a deserialized request type.
///
/// Params that do not deserialize into `Req` fail with
/// [`HandlerError::InvalidParams`] before the closure runs.
pub fn typed_handler<F, Fut, Req, Resp>(f: F) -> TypedHandler<F, Req>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    TypedHandler {
        f,
        _request: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> RequestHandler for TypedHandler<F, Req>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(params)
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;

        let response = (self.f)(request).await?;

        serde_json::to_value(response).map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

/// Publishes `{"error": "<message>"}` when the inner handler fails.
pub struct WithErrorReplies<H> {
    inner: H,
}

pub fn with_error_replies<H: RequestHandler>(inner: H) -> WithErrorReplies<H> {
    WithErrorReplies { inner }
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for WithErrorReplies<H> {
    async fn handle_request(&self, params: Value) -> Result<Value, HandlerError> {
        self.inner.handle_request(params).await
    }

    fn error_reply(&self, error: &HandlerError) -> Option<Value> {
        Some(json!({ "error": error.to_string() }))
    }
}
