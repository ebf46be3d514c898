use bytes::Bytes;
use http::Request;
use micro_bridge::router::{MethodRouter, Routes, Service};
use micro_bridge::{DeliveryMode, RoutedHandler, TunnelClient, TunnelServer};
use micro_tunnel::config::TunnelConfig;
use micro_tunnel::protocol::API_VERSION_HEADER;
use micro_tunnel::transport::MemoryTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Deserialize)]
struct Lookup {
    id: u64,
}

#[derive(Serialize)]
struct Order {
    id: u64,
    lines: Vec<String>,
}

struct Orders;

impl Service for Orders {
    fn routes(routes: &mut Routes<Self>) {
        routes.get("/orders/{id}", |_: Arc<Self>, lookup: Lookup| async move {
            let lines = (0..2000).map(|n| format!("line {n} of order {}", lookup.id)).collect();
            Ok::<_, String>(Order { id: lookup.id, lines })
        });
    }
}

struct OrdersV2;

impl Service for OrdersV2 {
    fn routes(routes: &mut Routes<Self>) {
        routes.get("/orders/{id}", |_: Arc<Self>, lookup: Lookup| async move {
            Ok::<_, String>(Order { id: lookup.id, lines: vec![] })
        });
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // a small message limit, so the first order needs several chunks
    let transport = Arc::new(MemoryTransport::new(4 * 1024));
    let config = TunnelConfig::default();

    let router = match MethodRouter::builder().register(Arc::new(Orders), &[]).register(Arc::new(OrdersV2), &["2"]).build() {
        Ok(router) => router,
        Err(e) => {
            error!(cause = %e, "invalid routes");
            return;
        }
    };
    let server = TunnelServer::new(RoutedHandler::new(Arc::new(router)), transport.clone(), &config).start();
    server.serve_calls("orders");
    server.serve_events("orders.requests");

    let by_call = TunnelClient::new(transport.clone(), DeliveryMode::call("orders"), &config).start();
    let by_event = TunnelClient::new(transport.clone(), DeliveryMode::event("orders.requests", "orders.replies"), &config).start();

    let requests = [
        (&by_call, Request::get("/orders/7").body(Bytes::new())),
        (&by_event, Request::get("/orders/8").header(API_VERSION_HEADER, "2").body(Bytes::new())),
        (&by_call, Request::get("/invoices/1").body(Bytes::new())),
    ];
    for (client, request) in requests {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                error!(cause = %e, "invalid request");
                continue;
            }
        };
        match client.send(request).await {
            Ok(response) => info!(status = %response.status(), len = response.body().len(), "response"),
            Err(e) => error!(cause = %e, "request failed"),
        }
    }

    info!(messages = transport.messages(), largest = transport.largest_message(), "transport usage");
}
