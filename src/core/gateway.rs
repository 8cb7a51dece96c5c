//! Request processing pipeline.
//!
//! [`GatewayProcessor`] drives one request through the gateway:
//! match a route → pre-route filters → select an endpoint → acquire a pooled connection →
//! pre-forward filters → backend exchange → post filters → complete. Any failure is attached to
//! the request context (which completes it and runs cleanup), turned into a JSON error response
//! and passed through the route's error filters.
use std::sync::Arc;

use http::{HeaderValue, StatusCode};
use serde_json::json;
use tracing::Instrument;

use crate::{
    core::{
        context::RequestContext,
        exchange::{GatewayRequest, GatewayResponse},
        filter::{FilterOutcome, FilterPhase},
        route::Route,
        route_manager::{RouteManager, RouteResult},
    },
    error::{GatewayError, GatewayResult},
    metrics,
    pool::ConnectionPoolManager,
    tracing_setup::{create_backend_span, create_request_span},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Central request processor. Owns nothing global: the route manager and pool manager are
/// handed in and shared with admin surfaces.
pub struct GatewayProcessor {
    routes: Arc<RouteManager>,
    pools: Arc<ConnectionPoolManager>,
}

impl GatewayProcessor {
    pub fn new(routes: Arc<RouteManager>, pools: Arc<ConnectionPoolManager>) -> Self {
        Self { routes, pools }
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn init(&self) -> RouteResult<()> {
        self.routes.init()
    }

    /// Start matching and the pool sweeper.
    pub fn start(&self) -> RouteResult<()> {
        self.routes.start()?;
        self.pools.start();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.routes.shutdown();
        self.pools.shutdown().await;
    }

    /// Process one request to completion. Always yields a response.
    pub async fn process(&self, request: GatewayRequest) -> GatewayResponse {
        let mut context = RequestContext::new(request);
        let span = create_request_span(
            context.request().method.as_str(),
            &context.request().path,
            context.id(),
        );

        async {
            if let Err(error) = self.dispatch(&mut context).await {
                self.fail(&mut context, error);
            }
            context.mark_complete();
            self.finish(&mut context)
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, context: &mut RequestContext) -> GatewayResult<()> {
        let route = self.routes.match_route(context)?.ok_or_else(|| {
            GatewayError::RouteNotFound {
                method: context.request().method.to_string(),
                path: context.request().path.clone(),
            }
        })?;
        context
            .set_matched_route(route.clone())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let total = route.timeouts().total;
        tokio::time::timeout(total, self.forward(context, &route))
            .await
            .map_err(|_| GatewayError::Timeout {
                phase: "total",
                after: total,
            })?
    }

    async fn forward(&self, context: &mut RequestContext, route: &Arc<Route>) -> GatewayResult<()> {
        if route.filters().execute(FilterPhase::PreRoute, context)? == FilterOutcome::Terminate {
            return Ok(());
        }

        let endpoint = route
            .service()
            .select_target(context, route.strategy())
            .await?;
        context
            .set_selected_endpoint(endpoint.clone())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        {
            let route = route.clone();
            let endpoint = endpoint.clone();
            context.on_complete(move || route.strategy().release(&endpoint));
        }

        let inbound = context.request().protocol.kind;
        if !inbound.can_convert_to(endpoint.protocol()) {
            return Err(GatewayError::ProtocolMismatch {
                inbound,
                target: endpoint.protocol(),
            });
        }

        let connection = self
            .pools
            .get_client_connection(
                &endpoint,
                endpoint.protocol(),
                &route.connection_options(),
                Some(route.timeouts().connection),
            )
            .await?;
        context.set_client_connection(connection.clone());
        {
            let pools = self.pools.clone();
            let connection = connection.clone();
            context.on_complete(move || pools.return_connection(connection));
        }

        if route.filters().execute(FilterPhase::PreForward, context)? == FilterOutcome::Terminate {
            return Ok(());
        }

        let request_timeout = route.timeouts().request;
        let outbound = context.request().clone();
        let exchange = tokio::time::timeout(request_timeout, connection.send(outbound))
            .instrument(create_backend_span(endpoint.uri(), route.id()))
            .await;
        let response = match exchange {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                self.pools.release_connection(connection);
                return Err(GatewayError::Backend {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
            Err(_) => {
                self.pools.release_connection(connection);
                return Err(GatewayError::Timeout {
                    phase: "request",
                    after: request_timeout,
                });
            }
        };
        tracing::debug!(
            "Backend {} answered {} for request {}",
            endpoint,
            response.status,
            context.id()
        );
        context.set_response(response);

        route.filters().execute(FilterPhase::Post, context)?;
        Ok(())
    }

    fn fail(&self, context: &mut RequestContext, error: GatewayError) {
        let kind = error.kind();
        match kind.status() {
            StatusCode::NOT_FOUND => tracing::debug!("Request {} failed: {}", context.id(), error),
            _ => tracing::error!("Request {} failed: {}", context.id(), error),
        }

        // an exchange cut short by the total timeout leaves the connection in an unknown state
        if matches!(error, GatewayError::Timeout { .. })
            && let Some(connection) = context.client_connection()
        {
            self.pools.release_connection(connection.clone());
        }

        context.set_response(error_response(&error, context.id()));
        context.set_error(error);

        if let Some(route) = context.matched_route().cloned()
            && let Err(e) = route.filters().execute(FilterPhase::Error, context)
        {
            tracing::warn!("Error filters of route {} failed: {}", route.id(), e);
        }
    }

    fn finish(&self, context: &mut RequestContext) -> GatewayResponse {
        let mut response = context
            .take_response()
            .unwrap_or_else(|| GatewayResponse::new(StatusCode::BAD_GATEWAY));
        if let Ok(value) = HeaderValue::from_str(context.id()) {
            response.headers.insert(REQUEST_ID_HEADER, value);
        }

        let route_id = context.matched_route().map_or("none", |r| r.id());
        metrics::increment_request_total(route_id, response.status.as_u16());
        response
    }
}

/// JSON body for a failed request.
pub fn error_response(error: &GatewayError, request_id: &str) -> GatewayResponse {
    let kind = error.kind();
    GatewayResponse::json(
        kind.status(),
        &json!({
            "error": {
                "code": kind.code(),
                "type": kind.as_str(),
                "message": error.to_string(),
                "request_id": request_id,
            }
        }),
    )
}
