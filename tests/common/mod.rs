// Shared fakes for the integration tests
#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use meridian::{
    core::{
        address::{EndpointAddress, ProtocolType},
        exchange::{GatewayRequest, GatewayResponse},
    },
    ports::{
        connection_factory::{
            Connection, ConnectionError, ConnectionFactory, ConnectionOptions, ConnectionResult,
            FactoryStats, FactoryStatsRecorder,
        },
        service_registry::{RegistryError, RegistryResult, ServiceInstance, ServiceRegistry},
    },
};

/// Factory whose connections answer every request with `200`, an `x-backend` header naming
/// the target and the forwarded path as body.
#[derive(Default)]
pub struct MockFactory {
    pub opened: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_send: AtomicBool,
    pub latency: Mutex<Option<Duration>>,
    pub connect_latency: Mutex<Option<Duration>>,
    pub seen: Arc<Mutex<Vec<GatewayRequest>>>,
    stats: FactoryStatsRecorder,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock().unwrap() = Some(latency);
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http
    }

    async fn create_client_connection(
        &self,
        target: &EndpointAddress,
        _options: &ConnectionOptions,
    ) -> ConnectionResult<Box<dyn Connection>> {
        let connect_latency = *self.connect_latency.lock().unwrap();
        if let Some(latency) = connect_latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            self.stats.record_failed();
            return Err(ConnectionError::Connect {
                target: target.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.stats.record_created(Duration::from_micros(50));
        Ok(Box::new(MockConnection {
            target: target.clone(),
            active: AtomicBool::new(true),
            fail_send: self.fail_send.load(Ordering::SeqCst),
            latency: *self.latency.lock().unwrap(),
            seen: self.seen.clone(),
        }))
    }

    fn stats(&self) -> FactoryStats {
        self.stats.snapshot()
    }
}

pub struct MockConnection {
    target: EndpointAddress,
    active: AtomicBool,
    fail_send: bool,
    latency: Option<Duration>,
    seen: Arc<Mutex<Vec<GatewayRequest>>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn target(&self) -> &EndpointAddress {
        &self.target
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn send(&self, request: GatewayRequest) -> ConnectionResult<GatewayResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_send {
            return Err(ConnectionError::Send {
                target: self.target.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let body = request.path_and_query();
        self.seen.lock().unwrap().push(request);

        let mut response = GatewayResponse::new(StatusCode::OK).with_body(body);
        response.headers.insert(
            "x-backend",
            HeaderValue::from_str(self.target.uri()).unwrap(),
        );
        Ok(response)
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Registry answering from a mutable list; can be switched to failing.
#[derive(Default)]
pub struct StaticRegistry {
    pub instances: Mutex<Vec<ServiceInstance>>,
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl StaticRegistry {
    pub fn with(instances: Vec<ServiceInstance>) -> Arc<Self> {
        Arc::new(Self {
            instances: Mutex::new(instances),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn select_instances(&self, _service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry is down".to_string()));
        }
        Ok(self.instances.lock().unwrap().clone())
    }
}

pub fn address(uri: &str) -> EndpointAddress {
    EndpointAddress::parse(uri).unwrap()
}

pub fn instance(id: &str, uri: &str) -> ServiceInstance {
    ServiceInstance::new(id, address(uri))
}
