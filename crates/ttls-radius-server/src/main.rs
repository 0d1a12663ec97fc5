use clap::Parser;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use ttls_radius_server::eap::outer_chain;
use ttls_radius_server::{Config, RadiusServer, ServerConfig, TlsContext, backend_from_users};

/// RADIUS server with EAP-TTLS, PEAP, EAP-GTC and EAP-MD5
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "ttls-radius")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed: {}", e);
                process::exit(1);
            }

            warn!(path = %cli.config_path, error = %e, "Could not load config file");
            info!(path = %cli.config_path, "Creating example configuration");

            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!(error = %e, "Error creating example config");
                process::exit(1);
            }

            info!("Please edit {} and restart the server", cli.config_path);
            process::exit(0);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation failed: {}", e);
        process::exit(1);
    }

    if cli.validate {
        println!("Configuration validated successfully");
        println!("  Listen: {}:{}", config.listen_address, config.listen_port);
        println!("  Clients: {}", config.clients.len());
        println!("  Users: {}", config.users.len());
        println!("  EAP methods: {:?}", config.eap_methods);
        if let Some(vlan) = config.vlan {
            println!("  VLAN: {}", vlan);
        }
        process::exit(0);
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config_path, "Starting ttls-radius");

    // MPPE keys need keying material export
    let tls = if config.uses_tls() {
        let context = match TlsContext::from_pem_files(&config.tls.cert_path, &config.tls.key_path) {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "Failed to load tunnel certificate");
                process::exit(1);
            }
        };
        if let Err(e) = context.check_key_export() {
            error!(error = %e, "TLS keying material export is not available");
            process::exit(1);
        }
        Some(Arc::new(context))
    } else {
        None
    };

    if config.clients.is_empty() {
        warn!("No authorized clients configured, accepting requests from any address");
    } else {
        for client in config.clients.iter().filter(|c| c.enabled) {
            info!(
                address = %client.address,
                name = client.name.as_deref().unwrap_or("(unnamed)"),
                "Authorized client"
            );
        }
    }

    let backend = backend_from_users(&config.users, &config.auth_cache);
    info!(users = config.users.len(), methods = ?config.eap_methods, "Authentication configured");
    let chain = outer_chain(&config, backend, tls);

    let server_config = match ServerConfig::from_config(config, Arc::new(chain)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            process::exit(1);
        }
    };

    let server = match RadiusServer::new(server_config).await {
        Ok(srv) => srv,
        Err(e) => {
            error!(error = %e, "Failed to create server");
            process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        process::exit(1);
    }
}
