use crate::problem::ProblemDetails;
use crate::router::MethodRouter;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use micro_tunnel::handler::Handler;
use micro_tunnel::protocol::API_VERSION_HEADER;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, warn};

/// Serves http requests from a [`MethodRouter`].
///
/// The version comes from the `api-version` header, or else the `api-version` query parameter. A result
/// is answered as `200` json, no result as `204`, and routing or invocation failures as problem details.
#[derive(Debug, Clone)]
pub struct RoutedHandler {
    router: Arc<MethodRouter>,
}

impl RoutedHandler {
    pub fn new(router: Arc<MethodRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &MethodRouter {
        &self.router
    }
}

fn requested_version<B>(request: &Request<B>) -> Option<String> {
    if let Some(version) = request.headers().get(API_VERSION_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(version.to_string());
    }
    let query = request.uri().query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find_map(|(name, value)| (name == API_VERSION_HEADER).then_some(value))
}

#[async_trait]
impl Handler for RoutedHandler {
    type RespBody = Full<Bytes>;
    type Error = Infallible;

    async fn call(&self, req: Request<Full<Bytes>>) -> Result<Response<Self::RespBody>, Self::Error> {
        let version = requested_version(&req);
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        let dispatched = self
            .router
            .dispatch(&parts.method, parts.uri.path(), version.as_deref(), parts.uri.query(), &body)
            .await;

        let response = match dispatched {
            Ok(Some(value)) => match serde_json::to_vec(&value) {
                Ok(json) => {
                    let mut response = Response::new(Bytes::from(json));
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()));
                    response
                }
                Err(e) => {
                    error!(cause = %e, "result could not be serialized");
                    ProblemDetails::new(StatusCode::INTERNAL_SERVER_ERROR).with_detail(e).into_response()
                }
            },
            Ok(None) => {
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            Err(e) => {
                warn!(method = %parts.method, path = parts.uri.path(), cause = %e, "dispatch failed");
                ProblemDetails::from(&e).into_response()
            }
        };

        Ok(response.map(Full::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Routes, Service};
    use serde_json::{Value, json};

    struct Greeter;

    impl Service for Greeter {
        fn routes(routes: &mut Routes<Self>) {
            routes
                .post("/greet", |_, args: Value| async move {
                    let name = args["name"].as_str().map(str::to_string).ok_or("name is required")?;
                    Ok::<_, &str>(format!("hello {name}"))
                })
                .post("/forget", |_, _: Value| async { Ok::<(), String>(()) });
        }
    }

    struct GreeterV2;

    impl Service for GreeterV2 {
        fn routes(routes: &mut Routes<Self>) {
            routes.post("/greet", |_, _: Value| async { Ok::<_, String>("hi") });
        }
    }

    fn handler() -> RoutedHandler {
        let router = MethodRouter::builder()
            .register(Arc::new(Greeter), &[])
            .register(Arc::new(GreeterV2), &["v2"])
            .build()
            .unwrap();
        RoutedHandler::new(Arc::new(router))
    }

    async fn call(handler: &RoutedHandler, request: Request<Full<Bytes>>) -> (StatusCode, Bytes) {
        let response = handler.call(request).await.unwrap();
        let status = response.status();
        (status, response.into_body().collect().await.unwrap().to_bytes())
    }

    fn post(uri: &str) -> http::request::Builder {
        Request::builder().method(http::Method::POST).uri(uri)
    }

    #[test]
    fn test_debug_output() {
        assert_eq!(format!("{:?}", handler()), "RoutedHandler { router: MethodRouter { len: 3, .. } }");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_routed_call() {
        let handler = handler();

        let request = post("/greet").body(Full::new(Bytes::from_static(br#"{"name":"ada"}"#))).unwrap();
        let (status, body) = call(&handler, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!("hello ada"));

        let request = post("/forget").body(Full::default()).unwrap();
        assert_eq!(call(&handler, request).await.0, StatusCode::NO_CONTENT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_version_from_header_and_query() {
        let handler = handler();

        let request = post("/greet").header(API_VERSION_HEADER, "v2").body(Full::default()).unwrap();
        assert_eq!(call(&handler, request).await.1, Bytes::from_static(br#""hi""#));

        let request = post("/greet?api-version=v2").body(Full::default()).unwrap();
        assert_eq!(call(&handler, request).await.1, Bytes::from_static(br#""hi""#));

        let request = post("/greet?api-version=v3").body(Full::default()).unwrap();
        assert_eq!(call(&handler, request).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_failures_become_problems() {
        let handler = handler();

        let request = post("/greet").body(Full::new(Bytes::from_static(b"{}"))).unwrap();
        let (status, body) = call(&handler, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem.detail.as_deref(), Some("handler failed: name is required"));

        let request = post("/greet").body(Full::new(Bytes::from_static(b"{oops"))).unwrap();
        assert_eq!(call(&handler, request).await.0, StatusCode::BAD_REQUEST);
    }
}
