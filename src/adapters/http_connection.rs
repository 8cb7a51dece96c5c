use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    core::{
        address::{EndpointAddress, ProtocolType},
        exchange::{GatewayRequest, GatewayResponse},
    },
    ports::connection_factory::{
        Connection, ConnectionError, ConnectionFactory, ConnectionOptions, ConnectionResult,
        FactoryStats, FactoryStatsRecorder,
    },
};

const USER_AGENT: &str = "Meridian-Gateway/1.0";

/// Headers that describe the inbound hop and must not be forwarded.
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP/1.1 connection factory using Hyper with Rustls.
///
/// Every [`HttpConnection`] owns a client capped at one idle socket, so a pooled connection
/// maps to at most one kept-alive upstream socket. Sockets are dialed lazily on first send.
pub struct HttpConnectionFactory {
    tls_config: rustls::ClientConfig,
    stats: FactoryStatsRecorder,
}

impl HttpConnectionFactory {
    pub fn new() -> Self {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        Self {
            tls_config,
            stats: FactoryStatsRecorder::default(),
        }
    }

    fn build_client(&self, options: &ConnectionOptions) -> HttpsClient {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(options.connect_timeout));
        http_connector.set_nodelay(true);
        if options.keep_alive {
            http_connector.set_keepalive(Some(options.read_timeout));
        }

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(self.tls_config.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(if options.keep_alive { 1 } else { 0 })
            .build(https_connector)
    }
}

impl Default for HttpConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http
    }

    async fn create_client_connection(
        &self,
        target: &EndpointAddress,
        options: &ConnectionOptions,
    ) -> ConnectionResult<Box<dyn Connection>> {
        let started = Instant::now();
        if target.protocol() != ProtocolType::Http {
            self.stats.record_failed();
            return Err(ConnectionError::UnsupportedProtocol(target.protocol()));
        }

        let connection = HttpConnection {
            target: target.clone(),
            client: self.build_client(options),
            options: options.clone(),
            active: AtomicBool::new(true),
        };
        self.stats.record_created(started.elapsed());
        tracing::debug!("Created HTTP connection to {}", target);
        Ok(Box::new(connection))
    }

    fn stats(&self) -> FactoryStats {
        self.stats.snapshot()
    }
}

pub struct HttpConnection {
    target: EndpointAddress,
    client: HttpsClient,
    options: ConnectionOptions,
    active: AtomicBool,
}

impl HttpConnection {
    fn build_request(&self, request: GatewayRequest) -> ConnectionResult<Request<Full<Bytes>>> {
        let scheme = if self.target.is_secure() { "https" } else { "http" };
        let uri = format!(
            "{}://{}{}",
            scheme,
            self.target.authority(),
            request.path_and_query()
        );

        let mut headers = request.headers;
        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        headers.remove(header::HOST);
        if let Ok(host) = HeaderValue::from_str(&self.target.authority()) {
            headers.insert(header::HOST, host);
        }
        headers
            .entry(header::USER_AGENT)
            .or_insert(HeaderValue::from_static(USER_AGENT));
        if let Some(remote) = request.remote_addr
            && let Ok(value) = HeaderValue::from_str(&remote.ip().to_string())
        {
            headers.append("x-forwarded-for", value);
        }

        let mut outgoing = Request::builder()
            .method(request.method)
            .uri(uri.as_str())
            .version(Version::HTTP_11)
            .body(Full::new(request.body))
            .map_err(|e| ConnectionError::Send {
                target: self.target.to_string(),
                message: e.to_string(),
            })?;
        *outgoing.headers_mut() = headers;
        Ok(outgoing)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn target(&self) -> &EndpointAddress {
        &self.target
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn send(&self, request: GatewayRequest) -> ConnectionResult<GatewayResponse> {
        if !self.is_active() {
            return Err(ConnectionError::Closed {
                id: self.target.to_string(),
            });
        }
        let outgoing = self.build_request(request)?;
        tracing::debug!("Sending {} {}", outgoing.method(), outgoing.uri());

        let response = match timeout(self.options.write_timeout, self.client.request(outgoing)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.active.store(false, Ordering::Release);
                return Err(if e.is_connect() {
                    ConnectionError::Connect {
                        target: self.target.to_string(),
                        message: e.to_string(),
                    }
                } else {
                    ConnectionError::Send {
                        target: self.target.to_string(),
                        message: e.to_string(),
                    }
                });
            }
            Err(_) => {
                self.active.store(false, Ordering::Release);
                return Err(ConnectionError::Timeout {
                    operation: "write",
                    target: self.target.to_string(),
                    after: self.options.write_timeout,
                });
            }
        };

        let (mut parts, body) = response.into_parts();
        // the body is fully buffered; downstream framing is recomputed
        parts.headers.remove(header::TRANSFER_ENCODING);

        let body = match timeout(self.options.read_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                self.active.store(false, Ordering::Release);
                return Err(ConnectionError::Send {
                    target: self.target.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                self.active.store(false, Ordering::Release);
                return Err(ConnectionError::Timeout {
                    operation: "read",
                    target: self.target.to_string(),
                    after: self.options.read_timeout,
                });
            }
        };

        Ok(GatewayResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}
