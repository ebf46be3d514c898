//! The method direction of the tunnel: inbound transport messages become http requests.
//!
//! # Architecture
//!
//! Per correlation id a request goes `Received -> Reassembling -> Routed -> Invoking -> Responding -> Sent`:
//!
//! - every request chunk is fed to the [`Reassembler`]; in call mode a non-final chunk is answered with an `Ack`
//! - the completed envelope is rebuilt into an `http::Request` and handed to the local [`Handler`]
//! - the response is encoded into an envelope and chunked again under the same correlation id
//! - in call mode the first reply chunk answers the final request chunk and the rest are pulled from the
//!   [`ReplyOutbox`] with `Next` frames; in event mode every reply chunk is published to the request's `reply_to`
//!
//! A call reply stays in the outbox until the caller aborts or it goes idle, so a redelivered final chunk or
//! `Next` is answered again from the outbox without invoking the handler twice.
//!
//! Failures of one message never escape as transport errors: a malformed stream, an undecodable envelope or
//! a handler fault is answered with a problem details response.

use crate::outbox::ReplyOutbox;
use crate::problem::ProblemDetails;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use micro_tunnel::codec::{ChunkEncoder, FrameCodec, Reassembler, ReassemblyLimits};
use micro_tunnel::config::TunnelConfig;
use micro_tunnel::handler::Handler;
use micro_tunnel::protocol::{
    ChunkedMessage, CodecError, Frame, JsonSerializer, ProtocolError, RequestEnvelope, ResponseEnvelope, Serializer,
};
use micro_tunnel::sweep::{Sweep, spawn_sweeper};
use micro_tunnel::transport::{CallHandler, EventHandler, Transport, TransportError};
use std::any::type_name;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

/// Serves tunneled requests with a local http [`Handler`].
pub struct TunnelServer<H, S = JsonSerializer> {
    handler: H,
    transport: Arc<dyn Transport>,
    serializer: S,
    encoder: ChunkEncoder,
    requests: Arc<Reassembler>,
    outbox: Arc<ReplyOutbox>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

/// An encoded response envelope and where it goes.
struct Reply {
    reply_to: Option<String>,
    envelope: Bytes,
}

impl<H> TunnelServer<H, JsonSerializer> {
    pub fn new(handler: H, transport: Arc<dyn Transport>, config: &TunnelConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            handler,
            transport,
            serializer: JsonSerializer,
            encoder: ChunkEncoder::from_config(config),
            requests: Arc::new(Reassembler::new(ReassemblyLimits::from(config))),
            outbox: Arc::new(ReplyOutbox::new(config.idle_timeout(), config.max_in_flight())),
            sweep_interval: config.sweep_interval(),
            _stop_on_drop: shutdown.clone().drop_guard(),
            shutdown,
        }
    }
}

impl<H, S> fmt::Debug for TunnelServer<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelServer")
            .field("handler", &type_name::<H>())
            .field("in_flight", &self.in_flight())
            .field("pending_replies", &self.pending_replies())
            .finish_non_exhaustive()
    }
}

impl<H, S> TunnelServer<H, S> {
    pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> TunnelServer<H, S2> {
        TunnelServer {
            handler: self.handler,
            transport: self.transport,
            serializer,
            encoder: self.encoder,
            requests: self.requests,
            outbox: self.outbox,
            sweep_interval: self.sweep_interval,
            shutdown: self.shutdown,
            _stop_on_drop: self._stop_on_drop,
        }
    }

    /// Requests currently being reassembled
    pub fn in_flight(&self) -> usize {
        self.requests.in_flight()
    }

    /// Replies waiting to be pulled
    pub fn pending_replies(&self) -> usize {
        self.outbox.len()
    }

    /// Stops the background sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl<H, S> TunnelServer<H, S>
where
    H: Handler + 'static,
    H::RespBody: Send,
    <H::RespBody as Body>::Data: Send,
    <H::RespBody as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
    S: Serializer,
{
    /// Wraps the server for registration and starts its background sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Arc<Self> {
        let targets = vec![self.requests.clone() as Arc<dyn Sweep>, self.outbox.clone() as Arc<dyn Sweep>];
        spawn_sweeper(targets, self.sweep_interval, self.shutdown.clone());
        Arc::new(self)
    }

    /// Receives calls addressed to `target`.
    pub fn serve_calls(self: &Arc<Self>, target: &str) {
        debug!(call_target = target, "serve calls");
        self.transport.on_call_received(target, Arc::clone(self) as Arc<dyn CallHandler>);
    }

    /// Receives requests published on `topic`.
    pub fn serve_events(self: &Arc<Self>, topic: &str) {
        debug!(topic, "serve events");
        self.transport.subscribe(topic, Arc::clone(self) as Arc<dyn EventHandler>);
    }

    /// Spawns a second sweep task on `interval`, stopped together with the server.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let targets = vec![self.requests.clone() as Arc<dyn Sweep>, self.outbox.clone() as Arc<dyn Sweep>];
        spawn_sweeper(targets, interval, self.shutdown.clone())
    }

    /// Feeds one request chunk; returns the reply once the request is complete.
    async fn accept(&self, chunk: ChunkedMessage) -> Option<Result<Reply, CodecError>> {
        let correlation_id = chunk.correlation_id.clone();
        trace!(correlation_id = %correlation_id, sequence = chunk.sequence_number, len = chunk.payload.len(), "request chunk");

        match self.requests.feed(chunk) {
            Ok(None) => None,
            Ok(Some(payload)) => Some(self.dispatch(&correlation_id, payload).await),
            Err(e) => {
                warn!(correlation_id = %correlation_id, cause = %e, "reject request stream");
                let response = ProblemDetails::new(protocol_status(&e)).with_detail(&e).into_response();
                Some(self.encode_reply(None, response))
            }
        }
    }

    async fn dispatch(&self, correlation_id: &str, payload: Bytes) -> Result<Reply, CodecError> {
        let envelope = match RequestEnvelope::decode(payload, &self.serializer) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(correlation_id, cause = %e, "undecodable request envelope");
                return self.encode_reply(None, ProblemDetails::new(StatusCode::BAD_REQUEST).with_detail(e).into_response());
            }
        };

        let reply_to = envelope.head.reply_to.clone();
        let request = match envelope.into_request() {
            Ok(request) => request,
            Err(e) => {
                warn!(correlation_id, cause = %e, "invalid request head");
                return self.encode_reply(reply_to, ProblemDetails::new(StatusCode::BAD_REQUEST).with_detail(e).into_response());
            }
        };

        debug!(correlation_id, method = %request.method(), uri = %request.uri(), "dispatch tunneled request");
        let response = match self.handler.call(request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                match body.collect().await {
                    Ok(collected) => Response::from_parts(parts, collected.to_bytes()),
                    Err(e) => {
                        let e: Box<dyn Error + Send + Sync> = e.into();
                        error!(correlation_id, cause = %e, "response body failed");
                        ProblemDetails::new(StatusCode::INTERNAL_SERVER_ERROR).with_detail(e).into_response()
                    }
                }
            }
            Err(e) => {
                let e: Box<dyn Error + Send + Sync> = e.into();
                error!(correlation_id, cause = %e, "handler failed");
                ProblemDetails::new(StatusCode::INTERNAL_SERVER_ERROR).with_detail(e).into_response()
            }
        };

        self.encode_reply(reply_to, response)
    }

    fn encode_reply(&self, reply_to: Option<String>, response: Response<Bytes>) -> Result<Reply, CodecError> {
        let envelope = ResponseEnvelope::from_response(response).encode(&self.serializer)?;
        Ok(Reply { reply_to, envelope })
    }

    fn reply_chunks(&self, correlation_id: &str, envelope: Bytes) -> Result<Vec<ChunkedMessage>, CodecError> {
        self.encoder.fitted(self.transport.max_message_size(), correlation_id).encode(correlation_id, envelope)
    }

    /// Answers a request chunk sent as a call.
    async fn answer_chunk(&self, chunk: ChunkedMessage) -> Frame {
        let correlation_id = chunk.correlation_id.clone();
        let sequence_number = chunk.sequence_number;

        let is_last = chunk.is_last;
        let reply = match self.accept(chunk).await {
            Some(reply) => reply,
            None if is_last => return self.answer_again(correlation_id),
            None => return Frame::ack(correlation_id, sequence_number),
        };

        let chunks = match reply.and_then(|reply| self.reply_chunks(&correlation_id, reply.envelope)) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(correlation_id = %correlation_id, cause = %e, "reply could not be encoded");
                return Frame::abort(correlation_id, e.to_string());
            }
        };

        let Some(first) = chunks.first().cloned() else {
            return Frame::abort(correlation_id, "empty reply");
        };
        self.outbox.stash(correlation_id, chunks);
        Frame::Chunk(first)
    }

    /// Answers a final request chunk of a request that already completed.
    fn answer_again(&self, correlation_id: String) -> Frame {
        match self.outbox.pull(&correlation_id, 0) {
            Some(first) => {
                debug!(correlation_id = %correlation_id, "final chunk redelivered, answer from outbox");
                Frame::Chunk(first)
            }
            None => {
                warn!(correlation_id = %correlation_id, "final chunk redelivered, reply no longer available");
                Frame::abort(correlation_id, "reply no longer available")
            }
        }
    }

    async fn publish_reply(&self, topic: &str, correlation_id: &str, envelope: Bytes) {
        let chunks = match self.reply_chunks(correlation_id, envelope) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(correlation_id, cause = %e, "reply could not be encoded");
                return;
            }
        };

        trace!(correlation_id, topic, chunks = chunks.len(), "publish reply");
        for chunk in chunks {
            let message = match FrameCodec::encode_frame(&Frame::Chunk(chunk)) {
                Ok(message) => message,
                Err(e) => {
                    error!(correlation_id, cause = %e, "reply chunk could not be framed");
                    return;
                }
            };
            if let Err(e) = self.transport.publish(topic, message).await {
                warn!(correlation_id, topic, cause = %e, "reply publish failed");
                return;
            }
        }
    }
}

fn protocol_status(e: &ProtocolError) -> StatusCode {
    match e {
        ProtocolError::TooManyInFlight { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProtocolError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[async_trait]
impl<H, S> CallHandler for TunnelServer<H, S>
where
    H: Handler + 'static,
    H::RespBody: Send,
    <H::RespBody as Body>::Data: Send,
    <H::RespBody as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
    S: Serializer,
{
    async fn on_call(&self, method: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        let frame = match FrameCodec::decode_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(method, cause = %e, "undecodable call");
                return FrameCodec::encode_frame(&Frame::abort("", e.to_string())).map_err(TransportError::remote);
            }
        };

        let reply = match frame {
            Frame::Chunk(chunk) => self.answer_chunk(chunk).await,
            Frame::Next { correlation_id, sequence_number } => match self.outbox.pull(&correlation_id, sequence_number) {
                Some(chunk) => Frame::Chunk(chunk),
                None => {
                    warn!(correlation_id = %correlation_id, sequence = sequence_number, "pull of unknown reply chunk");
                    Frame::abort(correlation_id, "no such reply chunk")
                }
            },
            Frame::Abort { correlation_id, reason } => {
                debug!(correlation_id = %correlation_id, reason = %reason, "caller aborted");
                self.requests.abandon(&correlation_id);
                self.outbox.remove(&correlation_id);
                Frame::ack(correlation_id, 0)
            }
            Frame::Ack { correlation_id, .. } => Frame::abort(correlation_id, "unexpected ack"),
        };

        FrameCodec::encode_frame(&reply).map_err(TransportError::remote)
    }
}

#[async_trait]
impl<H, S> EventHandler for TunnelServer<H, S>
where
    H: Handler + 'static,
    H::RespBody: Send,
    <H::RespBody as Body>::Data: Send,
    <H::RespBody as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
    S: Serializer,
{
    async fn on_event(&self, topic: &str, payload: Bytes) {
        let chunk = match FrameCodec::decode_frame(&payload) {
            Ok(Frame::Chunk(chunk)) => chunk,
            Ok(Frame::Abort { correlation_id, reason }) => {
                debug!(correlation_id = %correlation_id, reason = %reason, "publisher aborted");
                self.requests.abandon(&correlation_id);
                return;
            }
            Ok(frame) => {
                trace!(topic, kind = frame.kind(), "ignore frame");
                return;
            }
            Err(e) => {
                warn!(topic, cause = %e, "undecodable event");
                return;
            }
        };

        let correlation_id = chunk.correlation_id.clone();
        match self.accept(chunk).await {
            None => {}
            Some(Ok(Reply { reply_to: Some(reply_to), envelope })) => {
                self.publish_reply(&reply_to, &correlation_id, envelope).await;
            }
            Some(Ok(Reply { reply_to: None, .. })) => {
                debug!(correlation_id = %correlation_id, "no reply topic, response dropped");
            }
            Some(Err(e)) => {
                error!(correlation_id = %correlation_id, cause = %e, "reply could not be encoded");
            }
        }
    }
}
