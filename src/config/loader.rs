use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Result, WrapErr, eyre};

use crate::config::models::GatewayConfig;

/// Pick the parser from the file extension. Unknown or missing extensions read as YAML.
fn file_format(path: &Path) -> FileFormat {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    }
}

/// Load the gateway configuration from `config_path`.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);
    if !path.is_file() {
        return Err(eyre!("Configuration file {} does not exist", path.display()));
    }

    let gateway_config: GatewayConfig = Config::builder()
        .add_source(File::new(config_path, file_format(path)))
        .build()
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?
        .try_deserialize()
        .wrap_err_with(|| format!("Malformed gateway configuration in {}", path.display()))?;

    tracing::debug!(
        "Loaded {} route definitions and {} registry services from {}",
        gateway_config.routes.len(),
        gateway_config.registry.len(),
        path.display()
    );
    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::core::route_service::ServiceType;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
routes:
  - id: users
    name: Users
    order: 10
    predicates:
      - type: Path
        args:
          pattern: "/api/users/**"
    filters:
      - type: StripPrefix
        order: 1
        args:
          parts: "1"
    service:
      id: users-svc
      name: users
      type: CONFIG
      addresses:
        - uri: "http://users-1:8080"
        - uri: "http://users-2:8080"
          weight: 50
    load_balance:
      strategy: WEIGHTED_ROUND_ROBIN
    timeouts:
      request: 2s
pool:
  max_connections_per_target: 4
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 1);

        let route = &config.routes[0];
        assert_eq!(route.order, 10);
        assert!(route.enabled);
        assert_eq!(route.protocol.kind, "HTTP");
        assert_eq!(route.service.kind, ServiceType::Config);
        assert_eq!(route.service.addresses[0].weight, 100);
        assert_eq!(route.service.addresses[1].weight, 50);
        assert_eq!(route.timeouts.request.as_deref(), Some("2s"));
        assert_eq!(config.pool.max_connections_per_target, 4);
        assert_eq!(config.pool.idle_timeout, "5m");
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "routes": [
    {
      "id": "catalog",
      "predicates": [{ "type": "Host", "args": { "patterns": "catalog.example.com" } }],
      "service": { "id": "catalog", "name": "catalog", "type": "DISCOVERY" }
    }
  ],
  "registry": {
    "catalog": [
      { "id": "c-1", "uri": "http://10.0.0.1:9000", "status": "HEALTHY" }
    ]
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].service.kind, ServiceType::Discovery);
        assert_eq!(config.registry["catalog"].len(), 1);
        assert_eq!(config.discovery.cache_ttl, "30s");
    }

    #[test]
    fn test_format_follows_extension() {
        assert_eq!(file_format(Path::new("gw.JSON")), FileFormat::Json);
        assert_eq!(file_format(Path::new("gw.toml")), FileFormat::Toml);
        assert_eq!(file_format(Path::new("gw.yml")), FileFormat::Yaml);
        assert_eq!(file_format(Path::new("gateway")), FileFormat::Yaml);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config_sync("/definitely/not/here.yaml").is_err());
    }
}
