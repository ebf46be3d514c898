use bytes::Bytes;
use futures::future::join_all;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use micro_bridge::router::{MethodRouter, Routes, Service};
use micro_bridge::{ClientError, DeliveryMode, ProblemDetails, RoutedHandler, TunnelClient, TunnelServer};
use micro_tunnel::config::TunnelConfig;
use micro_tunnel::handler::make_handler;
use micro_tunnel::protocol::API_VERSION_HEADER;
use micro_tunnel::transport::MemoryTransport;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

fn payload(len: usize) -> Bytes {
    let mut bytes = vec![0; len];
    StdRng::seed_from_u64(7).fill_bytes(&mut bytes);
    bytes.into()
}

fn config() -> TunnelConfig {
    TunnelConfig::builder().max_chunk_size(MAX_MESSAGE_SIZE).build().unwrap()
}

/// Starts a server echoing every body back with `201 Created`, counting the requests it handled.
fn echo_server(transport: &Arc<MemoryTransport>, config: &TunnelConfig) -> Arc<AtomicUsize> {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let handler = make_handler(move |req: Request<Full<Bytes>>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let mut response = Response::new(req.into_body());
            *response.status_mut() = StatusCode::CREATED;
            Ok::<_, Infallible>(response)
        }
    });

    let server = TunnelServer::new(handler, transport.clone(), config).start();
    server.serve_calls("echo");
    server.serve_events("echo.requests");
    handled
}

fn upload(body: Bytes) -> Request<Bytes> {
    Request::builder().method("PUT").uri("/blobs/large").body(body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_body_over_calls() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = config();
    let handled = echo_server(&transport, &config);
    let client = TunnelClient::new(transport.clone(), DeliveryMode::call("echo"), &config).start();

    let body = payload(5 * 1024 * 1024);
    let response = client.send(upload(body.clone())).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.into_body() == body);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(transport.largest_message() <= MAX_MESSAGE_SIZE);
    assert!(transport.messages() > 2 * (5 * 1024 * 1024 / MAX_MESSAGE_SIZE));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_body_over_events() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = config();
    let handled = echo_server(&transport, &config);
    let client =
        TunnelClient::new(transport.clone(), DeliveryMode::event("echo.requests", "echo.replies"), &config).start();

    let body = payload(5 * 1024 * 1024);
    let response = client.send(upload(body.clone())).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.into_body() == body);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(transport.largest_message() <= MAX_MESSAGE_SIZE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivered_events_are_handled_once() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE).with_event_redelivery());
    let config = config();
    let handled = echo_server(&transport, &config);
    let client =
        TunnelClient::new(transport.clone(), DeliveryMode::event("echo.requests", "echo.replies"), &config).start();

    for _ in 0..3 {
        let body = payload(200 * 1024);
        let response = client.send(upload(body.clone())).await.unwrap();
        assert!(response.into_body() == body);
    }
    assert_eq!(handled.load(Ordering::SeqCst), 3);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_stay_apart() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = config();
    let handled = echo_server(&transport, &config);
    let by_call = TunnelClient::new(transport.clone(), DeliveryMode::call("echo"), &config).start();
    let by_event =
        TunnelClient::new(transport.clone(), DeliveryMode::event("echo.requests", "echo.replies"), &config).start();

    let bodies = (1..=16).map(|n| payload(n * 40 * 1024)).collect::<Vec<_>>();
    let sends = bodies.iter().enumerate().map(|(n, body)| {
        let client = if n % 2 == 0 { Arc::clone(&by_call) } else { Arc::clone(&by_event) };
        let body = body.clone();
        async move { client.send(upload(body)).await }
    });

    for (response, body) in join_all(sends).await.into_iter().zip(&bodies) {
        assert!(response.unwrap().into_body() == *body);
    }
    assert_eq!(handled.load(Ordering::SeqCst), bodies.len());
    assert_eq!(by_call.in_flight() + by_event.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fire_and_forget() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = config();
    let handled = echo_server(&transport, &config);
    let client = TunnelClient::new(transport.clone(), DeliveryMode::fire_and_forget("echo.requests"), &config).start();

    let response = client.send(upload(payload(100 * 1024))).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.body().is_empty());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(client.in_flight(), 0);
}

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

struct Greeter;

impl Service for Greeter {
    fn routes(routes: &mut Routes<Self>) {
        routes.post("/greet/{name}", |_: Arc<Self>, args: Greeting| async move {
            Ok::<_, String>(format!("hello {}", args.name))
        });
    }
}

struct GreeterV2;

impl Service for GreeterV2 {
    fn routes(routes: &mut Routes<Self>) {
        routes.post("/greet/{name}", |_: Arc<Self>, args: Greeting| async move {
            Ok::<_, String>(format!("hi {}, welcome back", args.name))
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_versioned_routes_through_the_tunnel() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = config();
    let router = MethodRouter::builder()
        .register(Arc::new(Greeter), &[])
        .register(Arc::new(GreeterV2), &["2.0"])
        .build()
        .unwrap();
    let server = TunnelServer::new(RoutedHandler::new(Arc::new(router)), transport.clone(), &config).start();
    server.serve_calls("greeter");
    let client = TunnelClient::new(transport, DeliveryMode::call("greeter"), &config).start();

    let request = Request::post("/greet/ada").body(Bytes::new()).unwrap();
    let response = client.send(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), br#""hello ada""#);

    let request = Request::post("/greet/ada").header(API_VERSION_HEADER, "2.0").body(Bytes::new()).unwrap();
    let response = client.send(request).await.unwrap();
    assert_eq!(response.body().as_ref(), br#""hi ada, welcome back""#);

    let request = Request::post("/greet/ada?api-version=3.0").body(Bytes::new()).unwrap();
    let response = client.send(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let problem: ProblemDetails = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(problem.status, 404);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_server_times_out() {
    let transport = Arc::new(MemoryTransport::new(MAX_MESSAGE_SIZE));
    let config = TunnelConfig::builder()
        .call_deadline(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    let handler = make_handler(|_: Request<Full<Bytes>>| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
    });
    let server = TunnelServer::new(handler, transport.clone(), &config).start();
    server.serve_calls("stalled");
    let client = TunnelClient::new(transport, DeliveryMode::call("stalled"), &config).start();

    let start = Instant::now();
    let result = client.send(upload(Bytes::from_static(b"anyone?"))).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(ClientError::Timeout)));
    assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(120), "{elapsed:?}");
    assert_eq!(client.in_flight(), 0);
}
