use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    config::models::InstanceDefinition,
    core::address::{AddressResult, EndpointAddress},
    ports::service_registry::{
        NodeStatus, RegistryError, RegistryResult, ServiceInstance, ServiceRegistry,
    },
};

/// Process-local service registry.
///
/// Backs DISCOVERY routes when no external registry is wired in; instances are seeded from
/// configuration and can be changed at runtime.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: scc::HashMap<String, Vec<ServiceInstance>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the `registry` section of the configuration.
    pub fn from_definitions(
        definitions: &HashMap<String, Vec<InstanceDefinition>>,
    ) -> AddressResult<Self> {
        let registry = Self::new();
        for (service, instances) in definitions {
            for definition in instances {
                let mut address = EndpointAddress::parse(&definition.uri)?
                    .with_metadata(definition.metadata.clone());
                if let Some(weight) = definition.weight {
                    address = address.with_weight(weight);
                }
                let mut instance = ServiceInstance::new(definition.id.clone(), address)
                    .with_status(definition.status);
                instance.metadata = definition.metadata.clone();
                registry.register(service, instance);
            }
        }
        Ok(registry)
    }

    /// Add or replace (by instance id) one instance of `service`.
    pub fn register(&self, service: &str, instance: ServiceInstance) {
        tracing::info!(
            "Registering instance {} of service {} at {}",
            instance.instance_id,
            service,
            instance.address
        );
        let mut entry = self.services.entry(service.to_string()).or_default();
        let instances = entry.get_mut();
        instances.retain(|i| i.instance_id != instance.instance_id);
        instances.push(instance);
    }

    /// Remove one instance. Returns whether it was registered.
    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let removed = self
            .services
            .update(service, |_, instances| {
                let before = instances.len();
                instances.retain(|i| i.instance_id != instance_id);
                before != instances.len()
            })
            .unwrap_or(false);
        if removed {
            tracing::info!("Deregistered instance {} of service {}", instance_id, service);
        }
        removed
    }

    pub fn update_status(&self, service: &str, instance_id: &str, status: NodeStatus) -> bool {
        self.services
            .update(service, |_, instances| {
                match instances.iter_mut().find(|i| i.instance_id == instance_id) {
                    Some(instance) => {
                        tracing::debug!(
                            "Instance {} of service {} is now {}",
                            instance_id,
                            service,
                            status
                        );
                        instance.status = status;
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.services.scan(|name, _| ids.push(name.clone()));
        ids.sort();
        ids
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn select_instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        self.services
            .read(service, |_, instances| instances.clone())
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, uri: &str) -> ServiceInstance {
        ServiceInstance::new(id, EndpointAddress::parse(uri).unwrap())
    }

    #[tokio::test]
    async fn test_register_replaces_same_instance_id() {
        let registry = InMemoryServiceRegistry::new();
        registry.register("users", instance("u-1", "http://10.0.0.1:8080"));
        registry.register("users", instance("u-1", "http://10.0.0.2:8080"));
        registry.register("users", instance("u-2", "http://10.0.0.3:8080"));

        let instances = registry.select_instances("users").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address.host(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let registry = InMemoryServiceRegistry::new();
        assert_eq!(
            registry.select_instances("ghost").await,
            Err(RegistryError::UnknownService("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_status_and_deregistration() {
        let registry = InMemoryServiceRegistry::new();
        registry.register("users", instance("u-1", "http://10.0.0.1:8080"));

        assert!(registry.update_status("users", "u-1", NodeStatus::Offline));
        assert!(!registry.update_status("users", "u-9", NodeStatus::Offline));
        let instances = registry.select_instances("users").await.unwrap();
        assert_eq!(instances[0].status, NodeStatus::Offline);

        assert!(registry.deregister("users", "u-1"));
        assert!(!registry.deregister("users", "u-1"));
        assert!(registry.select_instances("users").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_definitions() {
        let definitions = HashMap::from([(
            "catalog".to_string(),
            vec![InstanceDefinition {
                id: "c-1".to_string(),
                uri: "http://10.0.0.9:9000".to_string(),
                status: NodeStatus::Starting,
                weight: Some(7),
                metadata: Default::default(),
            }],
        )]);
        let registry = InMemoryServiceRegistry::from_definitions(&definitions).unwrap();
        assert_eq!(registry.service_ids(), vec!["catalog".to_string()]);

        let instances = registry.select_instances("catalog").await.unwrap();
        assert_eq!(instances[0].status, NodeStatus::Starting);
        assert_eq!(instances[0].address.weight(), 7);
    }
}
