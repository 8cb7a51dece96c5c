use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use meridian::{
    adapters::{HttpConnectionFactory, HttpHandler, InMemoryServiceRegistry, router},
    config::{
        GatewayConfig, RouteConverter,
        converter::{discovery_settings, pool_settings},
        loader::load_config,
        validate_gateway_config,
    },
    core::{GatewayProcessor, RouteManager, RouteService},
    metrics,
    pool::ConnectionPoolManager,
    tracing_setup::{self, LogFormat},
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "meridian.yaml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "meridian.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        #[clap(short, long, default_value = "meridian.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        #[clap(short, long, default_value = "meridian.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    tracing_setup::init_tracing(args.log_format, &args.log_level)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics();

    tracing::info!("Loading configuration from {config_path}");
    let config = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let converter = RouteConverter::new();
    validate_gateway_config(&config, converter.predicates(), converter.filters())
        .context("Configuration is invalid")?;

    let processor = Arc::new(build_processor(&config, converter)?);
    processor.init().context("Failed to initialize route manager")?;
    processor.start().context("Failed to start gateway")?;

    if processor.pools().settings().enable_warmup {
        tokio::spawn(warmup_pools(processor.clone()));
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let shutdown = Arc::new(GracefulShutdown::with_timeout(
        processor.pools().settings().shutdown_timeout,
    ));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.run_signal_handler().await }
    });

    for route in processor.routes().select_all() {
        tracing::info!(
            "Configured route {} (order {}) -> {} [{}]",
            route.id(),
            route.order(),
            route.service().name(),
            route.strategy().name()
        );
    }
    tracing::info!("Meridian gateway listening on {}", addr);

    let app = router(Arc::new(HttpHandler::new(processor.clone())));
    let token = shutdown.token();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
    .context("Server error");

    tracing::info!("Listener closed, draining gateway");
    if !shutdown.drain(processor.shutdown()).await {
        tracing::warn!("Gateway shutdown did not finish in time");
    }
    tracing::info!("Graceful shutdown completed");
    served
}

/// Wire the registry, routes and pools described by `config` into a processor.
fn build_processor(config: &GatewayConfig, converter: RouteConverter) -> Result<GatewayProcessor> {
    let registry = InMemoryServiceRegistry::from_definitions(&config.registry)
        .context("Invalid service registry seed")?;
    let (cache_ttl, refresh_timeout) = discovery_settings(config)?;
    let converter = converter
        .with_registry(Arc::new(registry))
        .with_discovery(cache_ttl, refresh_timeout);

    let routes = Arc::new(RouteManager::new());
    routes
        .replace_all(converter.convert_all(config)?)
        .context("Failed to load routes")?;

    let pools = Arc::new(ConnectionPoolManager::new(pool_settings(&config.pool)?));
    pools.register_factory(Arc::new(HttpConnectionFactory::new()));

    Ok(GatewayProcessor::new(routes, pools))
}

/// Open `min_connections_per_target` connections to every static address.
async fn warmup_pools(processor: Arc<GatewayProcessor>) {
    for route in processor.routes().select_all() {
        let RouteService::Config(service) = route.service() else {
            continue;
        };
        for address in service.addresses() {
            let protocol = address.protocol();
            if !processor.pools().supports_protocol(protocol) {
                continue;
            }
            match processor
                .pools()
                .warmup(address, protocol, &route.connection_options(), None)
                .await
            {
                Ok(opened) => tracing::debug!("Warmed up {} connections to {}", opened, address),
                Err(e) => tracing::warn!("Warmup of {} failed: {}", address, e),
            }
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    let converter = RouteConverter::new();
    match validate_gateway_config(&config, converter.predicates(), converter.filters()) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Global Filters: {}", config.global.filters.len());
            println!("   • Registry Services: {}", config.registry.len());
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Every route needs an id, a name and at least one predicate");
            println!("   • CONFIG services list addresses, DISCOVERY services must not");
            println!("   • Durations use humantime units (250ms, 5s, 2m)");
            println!("   • Strategies: ROUND_ROBIN, RANDOM, WEIGHTED_ROUND_ROBIN, LEAST_CONNECTIONS");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Meridian gateway configuration

listen_addr: "127.0.0.1:8080"

global:
  timeouts:
    total: 60s
  filters:
    - type: AddResponseHeader
      args:
        name: x-gateway
        value: meridian

routes:
  # Static backend list
  - id: users
    name: Users API
    order: 10
    predicates:
      - type: Path
        args:
          pattern: "/api/users/**"
    filters:
      - type: StripPrefix
        args:
          parts: "1"
    service:
      id: users
      name: users
      type: CONFIG
      addresses:
        - uri: "http://localhost:3001"
        - uri: "http://localhost:3002"
    load_balance:
      strategy: ROUND_ROBIN

  # Backends resolved through the service registry
  - id: catalog
    name: Catalog API
    order: 20
    predicates:
      - type: Path
        args:
          pattern: "/api/catalog/**"
    service:
      id: catalog
      name: catalog
      type: DISCOVERY
    load_balance:
      strategy: LEAST_CONNECTIONS

registry:
  catalog:
    - id: catalog-1
      uri: "http://localhost:4001"

pool:
  max_connections_per_target: 10
  idle_timeout: 5m
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'meridian serve --config {config_path}' to start the server");
    Ok(())
}
