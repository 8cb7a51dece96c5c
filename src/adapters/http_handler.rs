use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{StatusCode, Version, header},
    response::Response,
};
use eyre::{Result, WrapErr};
use http_body_util::LengthLimitError;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    core::{
        GatewayProcessor,
        address::{Protocol, ProtocolType},
        exchange::{GatewayRequest, GatewayResponse},
        route::Route,
        route_service::RouteService,
    },
    metrics,
};

/// Path prefix of the built-in admin endpoints; never routed to backends.
pub const ADMIN_PREFIX: &str = "/_meridian";

/// Largest inbound body accepted, in bytes
const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

/// Bridges axum requests into the [`GatewayProcessor`] and serves the admin endpoints.
#[derive(Clone)]
pub struct HttpHandler {
    processor: Arc<GatewayProcessor>,
    max_body: usize,
}

impl HttpHandler {
    pub fn new(processor: Arc<GatewayProcessor>) -> Self {
        Self {
            processor,
            max_body: DEFAULT_MAX_BODY,
        }
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Main request handler
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        let path = req.uri().path();
        if let Some(admin) = path.strip_prefix(ADMIN_PREFIX) {
            return match admin {
                "/health" => self.handle_health(),
                "/routes" => self.handle_routes().await,
                "/pools" => self.handle_pools(),
                "/metrics" => self.handle_metrics(),
                _ => to_axum(GatewayResponse::not_found()),
            };
        }

        let request = match self.to_gateway_request(req, client_addr).await {
            Ok(request) => request,
            Err(status) => {
                let message = match status {
                    StatusCode::PAYLOAD_TOO_LARGE => "Request body too large",
                    _ => "Failed to read request body",
                };
                return http::Response::builder()
                    .status(status)
                    .body(AxumBody::from(message))
                    .wrap_err("Failed to build rejection response");
            }
        };
        to_axum(self.processor.process(request).await)
    }

    /// Buffer the inbound request. Fails with `413` past `max_body` and `400` when the
    /// body stream itself errors.
    async fn to_gateway_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> std::result::Result<GatewayRequest, StatusCode> {
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body).await {
            Ok(body) => body,
            Err(e) if exceeds_length_limit(&e) => {
                tracing::warn!("Rejected inbound request over {} bytes", self.max_body);
                return Err(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                tracing::warn!("Failed to read inbound request body: {}", e);
                return Err(StatusCode::BAD_REQUEST);
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let mut request = GatewayRequest::new(parts.method, path_and_query)
            .with_body(body)
            .with_protocol(inbound_protocol(&parts.headers, parts.version));
        request.headers = parts.headers;
        if let Some(addr) = client_addr {
            request = request.with_remote_addr(addr);
        }
        Ok(request)
    }

    fn handle_health(&self) -> Result<Response<AxumBody>> {
        let routes = self.processor.routes();
        let pools = self.processor.pools().statistics();
        let unhealthy_pools = pools.iter().filter(|p| p.success_rate < 0.8).count();

        let status = if routes.is_empty() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        let body = json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "state": format!("{:?}", routes.state()),
            "routes": routes.len(),
            "pools": { "total": pools.len(), "degraded": unhealthy_pools },
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        to_axum(GatewayResponse::json(status, &body))
    }

    async fn handle_routes(&self) -> Result<Response<AxumBody>> {
        let mut routes = Vec::new();
        for route in self.processor.routes().select_all() {
            routes.push(describe_route(&route).await);
        }
        to_axum(GatewayResponse::json(
            StatusCode::OK,
            &json!({ "routes": routes }),
        ))
    }

    fn handle_pools(&self) -> Result<Response<AxumBody>> {
        let pools = self.processor.pools();
        let factories: Vec<_> = pools
            .factory_statistics()
            .into_iter()
            .map(|(protocol, stats, health)| {
                json!({
                    "protocol": protocol.as_str(),
                    "created": stats.created,
                    "failed": stats.failed,
                    "success_rate": stats.success_rate(),
                    "average_creation_ms": stats.average_creation_time.as_secs_f64() * 1000.0,
                    "health": health.to_string(),
                })
            })
            .collect();
        let body = json!({
            "pools": pools.statistics(),
            "factories": factories,
        });
        to_axum(GatewayResponse::json(StatusCode::OK, &body))
    }

    fn handle_metrics(&self) -> Result<Response<AxumBody>> {
        let body = json!({
            "metrics": metrics::get_current_metrics(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        to_axum(GatewayResponse::json(StatusCode::OK, &body))
    }
}

/// Router sending every path through `handler`.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    let route = move |req: Request| {
        let handler = handler.clone();
        async move {
            let client_addr = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            match handler.handle_request(req, client_addr).await {
                Ok(response) => Ok::<Response<AxumBody>, Infallible>(response),
                Err(e) => {
                    tracing::error!("Request handling error: {:?}", e);
                    let mut response = Response::new(AxumBody::from("Internal Server Error"));
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        }
    };

    Router::new()
        .fallback(route)
        .layer(TraceLayer::new_for_http())
}

fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// WebSocket for upgrade requests, gRPC for `application/grpc*` bodies, HTTP otherwise.
fn inbound_protocol(headers: &header::HeaderMap, version: Version) -> Protocol {
    let is_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if is_upgrade {
        return Protocol::new(ProtocolType::WebSocket, "13");
    }

    let is_grpc = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/grpc"));
    if is_grpc {
        return Protocol::new(ProtocolType::Grpc, "2.0");
    }

    let version = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    };
    Protocol::new(ProtocolType::Http, version)
}

async fn describe_route(route: &Route) -> serde_json::Value {
    let service = route.service();
    let addresses: Vec<_> = service
        .target_addresses()
        .await
        .iter()
        .map(|a| json!({ "uri": a.uri(), "weight": a.weight() }))
        .collect();
    let cache = match service {
        RouteService::Discovery(discovery) => serde_json::to_value(discovery.cache_stats()).ok(),
        RouteService::Config(_) => None,
    };

    json!({
        "id": route.id(),
        "name": route.name(),
        "order": route.order(),
        "enabled": route.is_enabled(),
        "protocol": route.protocol().to_string(),
        "predicates": route.predicates().iter().map(|p| p.name()).collect::<Vec<_>>(),
        "filters": route.filters().filters().iter().map(|f| json!({
            "name": f.name(),
            "phase": f.phase().to_string(),
            "order": f.order(),
        })).collect::<Vec<_>>(),
        "service": {
            "id": service.id(),
            "name": service.name(),
            "type": service.service_type().to_string(),
            "addresses": addresses,
            "cache": cache,
        },
        "strategy": route.strategy().name(),
        "timeouts_ms": {
            "connection": route.timeouts().connection.as_millis() as u64,
            "request": route.timeouts().request.as_millis() as u64,
            "total": route.timeouts().total.as_millis() as u64,
        },
        "metadata": route.metadata(),
    })
}

fn to_axum(response: GatewayResponse) -> Result<Response<AxumBody>> {
    let mut builder = http::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder
        .body(AxumBody::from(response.body))
        .wrap_err("Failed to build response")
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::{RouteManager, route::Route, route_service::ConfigRouteService},
        core::{address::EndpointAddress, predicate::Predicate},
        pool::{ConnectionPoolManager, PoolSettings},
    };

    fn handler_with_routes(routes: Vec<Route>) -> Arc<HttpHandler> {
        let manager = Arc::new(RouteManager::new());
        for route in routes {
            manager.insert(route).unwrap();
        }
        let processor = GatewayProcessor::new(
            manager,
            Arc::new(ConnectionPoolManager::new(PoolSettings::default())),
        );
        processor.init().unwrap();
        processor.start().unwrap();
        Arc::new(HttpHandler::new(Arc::new(processor)))
    }

    fn users_route() -> Route {
        let service = RouteService::Config(ConfigRouteService::new(
            "users",
            "users",
            Protocol::http(),
            vec![EndpointAddress::parse("http://127.0.0.1:9").unwrap()],
        ));
        Route::builder("users", service)
            .predicate(Predicate::path("/users/**"))
            .build()
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404_json() {
        let app = router(handler_with_routes(vec![users_route()]));
        let response = app
            .oneshot(http::Request::builder().uri("/nowhere").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], "E003");
    }

    #[tokio::test]
    async fn test_health_and_routes_endpoints() {
        let app = router(handler_with_routes(vec![users_route()]));

        let response = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/_meridian/health")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/_meridian/routes")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["routes"][0]["id"], "users");
        assert_eq!(body["routes"][0]["service"]["type"], "CONFIG");
        assert_eq!(body["routes"][0]["strategy"], "ROUND_ROBIN");
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let handler = handler_with_routes(vec![users_route()]);
        let app = router(Arc::new((*handler).clone().with_max_body(4)));
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/users/1")
                    .body(AxumBody::from("far too long"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_broken_body_stream_is_400() {
        let app = router(handler_with_routes(vec![users_route()]));
        let chunks = futures_util::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"part")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ]);
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/users/1")
                    .body(AxumBody::from_stream(chunks))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_without_routes_is_unavailable() {
        let app = router(handler_with_routes(Vec::new()));
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/_meridian/health")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_inbound_protocol_detection() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(
            inbound_protocol(&headers, Version::HTTP_2),
            Protocol::new(ProtocolType::Http, "2.0")
        );

        headers.insert(header::CONTENT_TYPE, "application/grpc+proto".parse().unwrap());
        assert_eq!(inbound_protocol(&headers, Version::HTTP_2).kind, ProtocolType::Grpc);

        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert_eq!(
            inbound_protocol(&headers, Version::HTTP_11).kind,
            ProtocolType::WebSocket
        );
    }
}
