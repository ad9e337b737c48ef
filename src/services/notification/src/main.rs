//! Main binary for the notification dispatcher
//!
//! Serves device registration, prompt status, sign-out, health and metrics
//! over HTTP and runs the lock-gated campaign loop in the background.

use notification_service::{
    config::DispatcherConfig, routes::create_router, MemoryDirectory, NotificationService,
};

use anyhow::{Context, Result};
use axum::serve;
use clap::{Arg, ArgAction, Command};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let matches = create_cli().get_matches();
    let config = load_config(&matches)?;
    init_tracing(&config);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    info!("Starting notification service");
    info!(
        host = %config.server.host,
        port = config.server.port,
        environment = %config.environment,
        "Configuration loaded"
    );
    info!(
        sms = config.sms.enabled,
        email = config.email.enabled,
        push_applications = config.push.applications.len(),
        campaigns = config.campaigns.enabled,
        "Enabled channels"
    );

    let state_file = matches.get_one::<PathBuf>("state").cloned();
    let directory = match &state_file {
        Some(path) => Arc::new(
            MemoryDirectory::load(path)
                .await
                .with_context(|| format!("Failed to load state from {}", path.display()))?,
        ),
        None => Arc::new(MemoryDirectory::new()),
    };

    let shutdown = CancellationToken::new();

    let service = NotificationService::new(config.clone(), directory.clone(), shutdown.clone())
        .await
        .context("Failed to initialize notification service")?;

    let campaign_task = service.start_campaigns(shutdown.clone());
    let app = create_router(service.clone());

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", config.server.host))?,
        config.server.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", addr))?;
    info!(%addr, "Listening");

    let server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
            }
        }
    });

    wait_for_shutdown_signal().await;
    shutdown.cancel();

    if let Some(task) = campaign_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Campaign runner did not stop cleanly");
        }
    }
    if let Err(e) = server_task.await {
        error!(error = %e, "HTTP server task panicked");
    }

    if let Some(path) = &state_file {
        directory
            .save(path)
            .await
            .with_context(|| format!("Failed to save state to {}", path.display()))?;
        info!(path = %path.display(), "State saved");
    }

    info!("Notification service stopped");
    Ok(())
}

/// `RUST_LOG` wins over `logging.level` when set.
fn init_tracing(config: &DispatcherConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "notification_service={level},tower_http={level},redis=warn",
            level = config.logging.level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.logging.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if let Err(e) = result {
        eprintln!("Tracing already initialized: {}", e);
    }
}

fn create_cli() -> Command {
    Command::new("notification-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-channel notification dispatcher")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port"),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON directory snapshot loaded at start and saved on shutdown"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .arg(
            Arg::new("no-campaigns")
                .long("no-campaigns")
                .action(ArgAction::SetTrue)
                .help("Do not run the campaign loop"),
        )
}

/// Load configuration from file and environment, then apply CLI overrides
fn load_config(matches: &clap::ArgMatches) -> Result<DispatcherConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(config_file) => DispatcherConfig::load(Some(config_file))
            .with_context(|| format!("Failed to load configuration from {}", config_file))?,
        None => DispatcherConfig::from_env().context("Failed to load configuration")?,
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }

    if let Some(port_str) = matches.get_one::<String>("port") {
        config.server.port = port_str
            .parse()
            .with_context(|| format!("Invalid port number '{}'", port_str))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if matches.get_flag("json-logs") {
        config.logging.json = true;
    }

    if matches.get_flag("no-campaigns") {
        config.campaigns.enabled = false;
    }

    Ok(config)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_create_cli() {
        let cli = create_cli();
        let matches = cli.try_get_matches_from(vec!["notification-server", "--port", "9090"]);
        assert!(matches.is_ok());

        let matches = matches.unwrap();
        assert_eq!(matches.get_one::<String>("port"), Some(&"9090".to_string()));
    }

    #[test]
    #[serial]
    fn test_load_default_config() {
        let matches = create_cli().get_matches_from(vec!["notification-server"]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.server.port, 8086);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_config_with_overrides() {
        let matches = create_cli().get_matches_from(vec![
            "notification-server",
            "--host",
            "0.0.0.0",
            "--port",
            "9999",
            "--json-logs",
            "--no-campaigns",
        ]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9999);
        assert!(config.logging.json);
        assert!(!config.campaigns.enabled);
    }

    #[test]
    #[serial]
    fn test_invalid_port_handling() {
        let matches =
            create_cli().get_matches_from(vec!["notification-server", "--port", "invalid"]);
        assert!(load_config(&matches).is_err());
    }

    #[test]
    #[serial]
    fn test_missing_config_file() {
        let matches = create_cli().get_matches_from(vec![
            "notification-server",
            "--config",
            "/nonexistent/notification.toml",
        ]);
        assert!(load_config(&matches).is_err());
    }
}
