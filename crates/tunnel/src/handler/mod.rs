//! The seam between the tunnel and application code.
//!
//! A server side tunnel endpoint rebuilds an `http::Request` from the reassembled envelope and hands it
//! to a [`Handler`]; the client side endpoint is itself a [`Handler`], so application code can call a
//! remote service the same way it would call a local one.
//!
//! Bodies crossing the tunnel are always fully buffered, so the request body is a [`TunnelRequest`]
//! rather than a type parameter.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use http_body_util::Full;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

/// A request after it was reassembled on the serving side of a tunnel.
pub type TunnelRequest = Request<Full<Bytes>>;

/// Handles requests arriving through a tunnel.
///
/// The error is carried across awaits on tokio worker threads before it is mapped to a problem
/// response, hence the `Send` bound.
#[async_trait]
pub trait Handler: Send + Sync {
    type RespBody: Body;
    type Error: Into<Box<dyn Error + Send + Sync>> + Send;

    async fn call(&self, req: TunnelRequest) -> Result<Response<Self::RespBody>, Self::Error>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    type RespBody = H::RespBody;
    type Error = H::Error;

    async fn call(&self, req: TunnelRequest) -> Result<Response<Self::RespBody>, Self::Error> {
        (**self).call(req).await
    }
}

/// A [`Handler`] backed by an async closure, see [`make_handler`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<RespBody, Err, F, Fut> Handler for HandlerFn<F>
where
    RespBody: Body,
    F: Fn(TunnelRequest) -> Fut + Send + Sync,
    Err: Into<Box<dyn Error + Send + Sync>> + Send,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send,
{
    type RespBody = RespBody;
    type Error = Err;

    async fn call(&self, req: TunnelRequest) -> Result<Response<Self::RespBody>, Self::Error> {
        (self.f)(req).await
    }
}

pub fn make_handler<F, RespBody, Err, Fut>(f: F) -> HandlerFn<F>
where
    RespBody: Body,
    Err: Into<Box<dyn Error + Send + Sync>> + Send,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send,
    F: Fn(TunnelRequest) -> Fut + Send + Sync,
{
    HandlerFn { f }
}
