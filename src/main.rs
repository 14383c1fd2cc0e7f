//! OIDC Pipeline - Main entry point
//!
//! Runs the relying party as an HTTP server: sign-in through the configured
//! OpenID Connect provider, cookie sessions and session validation.

use oidc_pipeline::config::Config;
use oidc_pipeline::error::{PipelineError, Result};
use oidc_pipeline::server::{router, serve, unconfigured_router, AppState};
use std::net::SocketAddr;
use oidc_pipeline::startup::StartupResult;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const BANNER: &str = r#"
╔══════════════════════════════════════════════════════════════╗
║                        OIDC Pipeline                         ║
║      Capture, redeem and validate OpenID Connect sessions    ║
╚══════════════════════════════════════════════════════════════╝
"#;

fn setup_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.log_level())));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let config = Config::parse_args();

    // Validate before logging exists; notes are replayed below
    let startup = StartupResult::prepare(&config);

    setup_logging(&config);

    if !config.no_banner && !config.silent {
        eprintln!("{}", BANNER);
    }

    let settings = match startup.finish() {
        Ok(settings) => settings,
        Err(e) => {
            // Keep /health answering; every other request reports the error
            let Ok(addr) = config.bind_addr() else {
                std::process::exit(1);
            };
            warn!("Configuration invalid, serving only /health until it is fixed");
            if let Err(e) = run(addr, unconfigured_router(e.to_string())).await {
                error!("Server error: {}", e);
            }
            std::process::exit(1);
        }
    };

    if !config.no_banner && !config.silent {
        info!("OIDC Issuer: {}", settings.provider.issuer_url);
        info!("Client ID: {}", settings.provider.client_id);
        info!("Scopes: {}", settings.provider.scopes.join(" "));
        info!("Redirect URL: {}", settings.provider.redirect_url);
        eprintln!();
    }

    let addr = settings.bind_addr;
    let app = match AppState::new(settings) {
        Ok(state) => router(state),
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(addr, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run(addr: SocketAddr, app: axum::Router) -> Result<()> {
    let server_handle = tokio::spawn(serve(addr, app));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(PipelineError::Server(format!("Server task panicked: {}", e)));
                }
            }
        }
    }

    Ok(())
}
