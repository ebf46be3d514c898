//! The event direction of the tunnel: outbound http requests become transport messages.
//!
//! # Architecture
//!
//! For every request the client allocates a correlation id, registers a pending call with the configured
//! deadline and sends the chunked request envelope:
//!
//! - [`DeliveryMode::Call`]: each chunk is a call; the reply arrives as call responses, later reply chunks
//!   are pulled with `Next` frames
//! - [`DeliveryMode::Event`]: each chunk is published; reply chunks arrive as events on the reply topic and
//!   are matched to the pending call by correlation id, in any order relative to other calls
//!
//! Dropping the future returned by [`TunnelClient::send`] cancels the pending call and abandons the reply
//! reassembly; chunks that arrive afterwards are dropped.

use crate::problem::ProblemDetails;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use micro_tunnel::codec::{ChunkEncoder, FrameCodec, Reassembler, ReassemblyLimits};
use micro_tunnel::config::TunnelConfig;
use micro_tunnel::correlation::{CallFault, CorrelationError, CorrelationIds, CorrelationTable};
use micro_tunnel::handler::Handler;
use micro_tunnel::protocol::{
    ChunkedMessage, CodecError, Frame, JsonSerializer, ProtocolError, RequestEnvelope, ResponseEnvelope, Serializer,
};
use micro_tunnel::sweep::{Sweep, spawn_sweeper};
use micro_tunnel::transport::{EventHandler, Transport, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

/// How request chunks travel to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Every chunk is a call to `target`
    Call { target: String },
    /// Every chunk is published to `request_topic`; replies are published to `reply_topic`, no reply topic
    /// means fire-and-forget
    Event { request_topic: String, reply_topic: Option<String> },
}

impl DeliveryMode {
    pub fn call<S: Into<String>>(target: S) -> Self {
        Self::Call { target: target.into() }
    }

    pub fn event<S: Into<String>, R: Into<String>>(request_topic: S, reply_topic: R) -> Self {
        Self::Event { request_topic: request_topic.into(), reply_topic: Some(reply_topic.into()) }
    }

    pub fn fire_and_forget<S: Into<String>>(request_topic: S) -> Self {
        Self::Event { request_topic: request_topic.into(), reply_topic: None }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport failure: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("call timed out")]
    Timeout,

    #[error("call was cancelled")]
    Cancelled,

    #[error("broken reply: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error(transparent)]
    Duplicate(#[from] CorrelationError),

    #[error("request could not be encoded: {source}")]
    Encode {
        #[from]
        source: CodecError,
    },
}

impl From<CallFault> for ClientError {
    fn from(fault: CallFault) -> Self {
        match fault {
            CallFault::Timeout => Self::Timeout,
            CallFault::Cancelled => Self::Cancelled,
            CallFault::Protocol { source } => Self::Protocol { source },
        }
    }
}

impl ClientError {
    /// Status of the problem response standing in for this error; `None` for transport failures, which
    /// are reported as errors instead.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transport { .. } => None,
            Self::Timeout => Some(StatusCode::GATEWAY_TIMEOUT),
            Self::Cancelled => Some(StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)),
            Self::Protocol { .. } => Some(StatusCode::BAD_GATEWAY),
            Self::Duplicate(_) | Self::Encode { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

/// Sends http requests through the tunnel.
pub struct TunnelClient<S = JsonSerializer> {
    transport: Arc<dyn Transport>,
    mode: DeliveryMode,
    serializer: S,
    encoder: ChunkEncoder,
    call_deadline: Duration,
    sweep_interval: Duration,
    ids: CorrelationIds,
    pending: Arc<CorrelationTable<ResponseEnvelope>>,
    replies: Arc<Reassembler>,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

/// Cancels the pending call of a request whose future was dropped before it resolved.
struct InFlight<'a> {
    pending: &'a CorrelationTable<ResponseEnvelope>,
    replies: &'a Reassembler,
    correlation_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let cancelled = self.pending.cancel(self.correlation_id);
        if cancelled || !self.replies.is_closed(self.correlation_id) {
            self.replies.abandon(self.correlation_id);
        }
        if cancelled {
            debug!(correlation_id = self.correlation_id, "request abandoned");
        }
    }
}

impl TunnelClient<JsonSerializer> {
    pub fn new(transport: Arc<dyn Transport>, mode: DeliveryMode, config: &TunnelConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            transport,
            mode,
            serializer: JsonSerializer,
            encoder: ChunkEncoder::from_config(config),
            call_deadline: config.call_deadline(),
            sweep_interval: config.sweep_interval(),
            ids: CorrelationIds::new(),
            pending: Arc::new(CorrelationTable::new()),
            replies: Arc::new(Reassembler::new(ReassemblyLimits::from(config))),
            _stop_on_drop: shutdown.clone().drop_guard(),
            shutdown,
        }
    }
}

impl<S> fmt::Debug for TunnelClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelClient")
            .field("mode", &self.mode)
            .field("call_deadline", &self.call_deadline)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<S> TunnelClient<S> {
    pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> TunnelClient<S2> {
        TunnelClient {
            transport: self.transport,
            mode: self.mode,
            serializer,
            encoder: self.encoder,
            call_deadline: self.call_deadline,
            sweep_interval: self.sweep_interval,
            ids: self.ids,
            pending: self.pending,
            replies: self.replies,
            shutdown: self.shutdown,
            _stop_on_drop: self._stop_on_drop,
        }
    }

    pub fn with_ids(mut self, ids: CorrelationIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn mode(&self) -> &DeliveryMode {
        &self.mode
    }

    /// Calls still awaiting their reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Stops the background sweep; pending calls no longer time out afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl<S: Serializer> TunnelClient<S> {
    /// Wraps the client, subscribes to the reply topic if there is one and starts the background sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Arc<Self> {
        let targets = vec![self.pending.clone() as Arc<dyn Sweep>, self.replies.clone() as Arc<dyn Sweep>];
        spawn_sweeper(targets, self.sweep_interval, self.shutdown.clone());

        let client = Arc::new(self);
        if let DeliveryMode::Event { reply_topic: Some(reply_topic), .. } = &client.mode {
            debug!(reply_topic = %reply_topic, "subscribe to replies");
            client.transport.subscribe(reply_topic, Arc::clone(&client) as Arc<dyn EventHandler>);
        }
        client
    }

    /// Sends `request` and waits for its response.
    ///
    /// Failures of the exchange itself are errors; whatever the remote answered, including problem
    /// responses, is returned as a response.
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ClientError> {
        let correlation_id = self.ids.next_id();
        let mut waiter = self.pending.register(correlation_id.clone(), Instant::now() + self.call_deadline)?;
        let _in_flight = InFlight { pending: &self.pending, replies: &self.replies, correlation_id: &correlation_id };

        let reply_to = match &self.mode {
            DeliveryMode::Event { reply_topic, .. } => reply_topic.clone(),
            DeliveryMode::Call { .. } => None,
        };
        let method = request.uri().path().to_string();
        let envelope = RequestEnvelope::from_request(request, reply_to).encode(&self.serializer)?;
        let chunks = self.encoder.fitted(self.transport.max_message_size(), &correlation_id).encode(&correlation_id, envelope)?;
        trace!(correlation_id = %correlation_id, method = %method, chunks = chunks.len(), "send request");

        let envelope = match &self.mode {
            DeliveryMode::Call { target } => {
                tokio::select! {
                    outcome = &mut waiter => outcome?,
                    exchanged = self.exchange(target, &method, &correlation_id, chunks) => {
                        exchanged?;
                        waiter.await?
                    }
                }
            }
            DeliveryMode::Event { request_topic, reply_topic } => {
                self.publish(request_topic, chunks).await?;
                if reply_topic.is_none() {
                    let mut accepted = Response::new(Bytes::new());
                    *accepted.status_mut() = StatusCode::ACCEPTED;
                    return Ok(accepted);
                }
                waiter.await?
            }
        };

        Ok(envelope.into_response()?)
    }

    /// Like [`TunnelClient::send`], but gives up with [`ClientError::Cancelled`] once `cancel` fires.
    pub async fn send_with_cancel(&self, request: Request<Bytes>, cancel: CancellationToken) -> Result<Response<Bytes>, ClientError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.send(request) => result,
        }
    }

    async fn publish(&self, topic: &str, chunks: Vec<ChunkedMessage>) -> Result<(), ClientError> {
        for chunk in chunks {
            self.transport.publish(topic, FrameCodec::encode_frame(&Frame::Chunk(chunk))?).await?;
        }
        Ok(())
    }

    async fn call_frame(&self, target: &str, method: &str, frame: &Frame) -> Result<Frame, ClientError> {
        let response = self.transport.send_call(target, method, FrameCodec::encode_frame(frame)?).await?;
        Ok(FrameCodec::decode_frame(&response)?)
    }

    /// Sends the request chunks as calls, then pulls the reply until it is complete.
    async fn exchange(&self, target: &str, method: &str, correlation_id: &str, chunks: Vec<ChunkedMessage>) -> Result<(), ClientError> {
        let mut reply = None;
        for chunk in chunks {
            let (sequence, is_last) = (chunk.sequence_number, chunk.is_last);
            match self.call_frame(target, method, &Frame::Chunk(chunk)).await? {
                Frame::Ack { .. } if !is_last => continue,
                Frame::Chunk(first) => {
                    reply = Some(first);
                    break;
                }
                Frame::Abort { correlation_id, reason } => return Err(ProtocolError::aborted(correlation_id, reason).into()),
                other => {
                    let reason = format!("unexpected {} in response to chunk {sequence}", other.kind());
                    return Err(ProtocolError::inconsistent_chunk(correlation_id, reason).into());
                }
            }
        }

        let Some(mut chunk) = reply else {
            return Err(ProtocolError::inconsistent_chunk(correlation_id, "request finished without a reply").into());
        };
        loop {
            let (next, is_last) = (chunk.sequence_number + 1, chunk.is_last);
            if self.ingest(chunk)? || is_last {
                return Ok(());
            }
            chunk = match self.call_frame(target, method, &Frame::next(correlation_id, next)).await? {
                Frame::Chunk(chunk) => chunk,
                Frame::Abort { correlation_id, reason } => return Err(ProtocolError::aborted(correlation_id, reason).into()),
                other => {
                    let reason = format!("unexpected {} in response to pull of chunk {next}", other.kind());
                    return Err(ProtocolError::inconsistent_chunk(correlation_id, reason).into());
                }
            };
        }
    }

    /// Feeds one reply chunk, completes the pending call once the reply is whole.
    fn ingest(&self, chunk: ChunkedMessage) -> Result<bool, ProtocolError> {
        let correlation_id = chunk.correlation_id.clone();
        if !self.pending.contains(&correlation_id) {
            trace!(correlation_id = %correlation_id, sequence = chunk.sequence_number, "drop reply chunk of settled call");
            return Ok(false);
        }

        let Some(payload) = self.replies.feed(chunk)? else {
            return Ok(false);
        };
        let envelope = ResponseEnvelope::decode(payload, &self.serializer)?;
        debug!(correlation_id = %correlation_id, status = envelope.head.status, "reply complete");
        Ok(self.pending.complete(&correlation_id, envelope))
    }
}

#[async_trait]
impl<S: Serializer> EventHandler for TunnelClient<S> {
    async fn on_event(&self, topic: &str, payload: Bytes) {
        match FrameCodec::decode_frame(&payload) {
            Ok(Frame::Chunk(chunk)) => {
                let correlation_id = chunk.correlation_id.clone();
                if let Err(e) = self.ingest(chunk) {
                    warn!(correlation_id = %correlation_id, cause = %e, "broken reply stream");
                    self.pending.fail(&correlation_id, CallFault::from(e));
                }
            }
            Ok(Frame::Abort { correlation_id, reason }) => {
                warn!(correlation_id = %correlation_id, reason = %reason, "server aborted the reply");
                self.replies.abandon(&correlation_id);
                self.pending.fail(&correlation_id, CallFault::from(ProtocolError::aborted(&correlation_id, reason)));
            }
            Ok(frame) => trace!(topic, kind = frame.kind(), "ignore frame"),
            Err(e) => warn!(topic, cause = %e, "undecodable reply"),
        }
    }
}

/// The client as an http handler: remote failures become problem responses, transport failures stay errors.
#[async_trait]
impl<S: Serializer> Handler for TunnelClient<S> {
    type RespBody = Full<Bytes>;
    type Error = ClientError;

    async fn call(&self, req: Request<Full<Bytes>>) -> Result<Response<Self::RespBody>, Self::Error> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        match self.send(Request::from_parts(parts, body)).await {
            Ok(response) => Ok(response.map(Full::new)),
            Err(e) => match e.status() {
                Some(status) => {
                    debug!(cause = %e, %status, "answer failed call with a problem");
                    Ok(ProblemDetails::new(status).with_detail(&e).into_response().map(Full::new))
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_tunnel::transport::{CallHandler, MemoryTransport};
    use mockall::mock;

    mock! {
        Transport {}

        #[async_trait]
        impl Transport for Transport {
            async fn send_call(&self, target: &str, method: &str, payload: Bytes) -> Result<Bytes, TransportError>;
            async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
            fn on_call_received(&self, target: &str, handler: Arc<dyn CallHandler>);
            fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>);
            fn max_message_size(&self) -> usize;
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::builder()
            .call_deadline(Duration::from_millis(100))
            .sweep_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn request() -> Request<Bytes> {
        Request::builder().method("POST").uri("/widgets").body(Bytes::from_static(b"{}")).unwrap()
    }

    fn mock_transport(answer: Frame) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_max_message_size().return_const(64 * 1024_usize);
        transport
            .expect_send_call()
            .returning(move |_, _, _| Ok(FrameCodec::encode_frame(&answer).unwrap()));
        transport
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_unreachable_stays_an_error() {
        let mut transport = MockTransport::new();
        transport.expect_max_message_size().return_const(64 * 1024_usize);
        transport.expect_send_call().times(2).returning(|target, _, _| Err(TransportError::unreachable(target)));

        let client = TunnelClient::new(Arc::new(transport), DeliveryMode::call("svc"), &config()).start();
        assert!(matches!(client.send(request()).await, Err(ClientError::Transport { .. })));

        let result = client.call(Request::new(Full::new(Bytes::new()))).await;
        assert!(matches!(result, Err(ClientError::Transport { .. })));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_abort_is_a_bad_gateway() {
        let client =
            TunnelClient::new(Arc::new(mock_transport(Frame::abort("x", "nope"))), DeliveryMode::call("svc"), &config()).start();

        let response = client.call(Request::new(Full::new(Bytes::new()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem.status, 502);
        assert!(problem.detail.unwrap().contains("nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_acknowledged_final_chunk_is_a_protocol_error() {
        let client = TunnelClient::new(Arc::new(mock_transport(Frame::ack("x", 0))), DeliveryMode::call("svc"), &config()).start();
        assert!(matches!(client.send(request()).await, Err(ClientError::Protocol { .. })));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let transport = Arc::new(MemoryTransport::new(64 * 1024));
        let client = TunnelClient::new(transport, DeliveryMode::event("requests", "replies"), &config()).start();

        let start = Instant::now();
        assert!(matches!(client.send(request()).await, Err(ClientError::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(110), "{elapsed:?}");

        let response = client.call(Request::new(Full::new(Bytes::new()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let transport = Arc::new(MemoryTransport::new(64 * 1024));
        let client = TunnelClient::new(transport, DeliveryMode::event("requests", "replies"), &config()).start();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert!(matches!(client.send_with_cancel(request(), cancel).await, Err(ClientError::Cancelled)));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_is_cancelled() {
        let transport = Arc::new(MemoryTransport::new(64 * 1024));
        let client = TunnelClient::new(transport, DeliveryMode::event("requests", "replies"), &config()).start();

        let send = client.send(request());
        assert!(tokio::time::timeout(Duration::from_millis(20), send).await.is_err());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_fire_and_forget_is_accepted() {
        let mut transport = MockTransport::new();
        transport.expect_max_message_size().return_const(64 * 1024_usize);
        transport.expect_publish().times(1).returning(|_, _| Ok(()));

        let client = TunnelClient::new(Arc::new(transport), DeliveryMode::fire_and_forget("requests"), &config()).start();
        let response = client.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_debug_output() {
        let mut transport = MockTransport::new();
        transport.expect_max_message_size().return_const(64 * 1024_usize);
        let client = TunnelClient::new(Arc::new(transport), DeliveryMode::call("svc"), &config());

        let debug = format!("{client:?}");
        assert!(debug.starts_with("TunnelClient {"));
        assert!(debug.contains("svc"));
        assert!(debug.contains("in_flight: 0"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ClientError::Timeout.status(), Some(StatusCode::GATEWAY_TIMEOUT));
        assert_eq!(ClientError::Cancelled.status().map(|s| s.as_u16()), Some(499));
        assert_eq!(ClientError::from(ProtocolError::malformed_frame("x")).status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(ClientError::from(TransportError::Closed).status(), None);
    }
}
