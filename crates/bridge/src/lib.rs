//! Tunnel endpoints for http services reachable only through a message transport.
//!
//! A [`TunnelClient`] turns outbound http requests into chunked transport messages, a [`TunnelServer`]
//! turns them back into requests for a local [`Handler`](micro_tunnel::handler::Handler) and sends the
//! response the same way. Both sides speak the frame format of [`micro_tunnel`].
//!
//! The [`router`] module maps method, path and api version to typed service methods; wrapped in a
//! [`RoutedHandler`] it becomes the handler of a server.
//!
//! ```no_run
//! use bytes::Bytes;
//! use micro_bridge::router::{MethodRouter, Routes, Service};
//! use micro_bridge::{DeliveryMode, RoutedHandler, TunnelClient, TunnelServer};
//! use micro_tunnel::config::TunnelConfig;
//! use micro_tunnel::transport::MemoryTransport;
//! use std::sync::Arc;
//!
//! struct Clock;
//!
//! impl Service for Clock {
//!     fn routes(routes: &mut Routes<Self>) {
//!         routes.get("/now", |_: Arc<Clock>, _: serde_json::Value| async { Ok::<_, String>(42_u64) });
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TunnelConfig::default();
//! let transport = Arc::new(MemoryTransport::new(64 * 1024));
//!
//! let router = MethodRouter::builder().register(Arc::new(Clock), &[]).build()?;
//! let server = TunnelServer::new(RoutedHandler::new(Arc::new(router)), transport.clone(), &config).start();
//! server.serve_calls("clock");
//!
//! let client = TunnelClient::new(transport, DeliveryMode::call("clock"), &config).start();
//! let response = client.send(http::Request::get("/now").body(Bytes::new())?).await?;
//! assert_eq!(response.body().as_ref(), b"42");
//! # Ok(())
//! # }
//! ```

mod client;
mod outbox;
mod problem;
mod routed;
mod server;

pub mod router;

pub use client::ClientError;
pub use client::DeliveryMode;
pub use client::TunnelClient;
pub use outbox::ReplyOutbox;
pub use problem::PROBLEM_JSON;
pub use problem::ProblemDetails;
pub use routed::RoutedHandler;
pub use server::TunnelServer;
