//! HTTP server with graceful shutdown
//!
//! The outer layers of every request live here: CORS, request timeout,
//! structured access logging with masked credential headers, request-id
//! assignment/propagation and panic recovery. On SIGTERM/SIGINT in-flight
//! requests drain; open scopes roll back with their connections.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::middleware::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
};

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router
    pub async fn serve(self, app: Router) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .service
            .bind_addr
            .parse()
            .map_err(|_| Error::Config("service.bind_addr is not a socket address".into()))?;

        tracing::info!(
            service = %self.config.service.name,
            %addr,
            environment = %self.config.service.environment,
            "starting"
        );

        // Layers run top to bottom for a request: the last layer added is
        // the outermost.
        let app = app
            .layer(self.build_cors_layer())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(self.config.service.timeout_secs),
            ))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_response(DefaultOnResponse::new().include_headers(true)),
            )
            .layer(sensitive_headers_layer())
            .layer(request_id_propagation_layer())
            .layer(request_id_layer())
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("shutdown complete");
        Ok(())
    }

    fn build_cors_layer(&self) -> CorsLayer {
        if self.config.service.cors_origins.is_empty() {
            return CorsLayer::new();
        }

        let origins: Vec<HeaderValue> = self
            .config
            .service
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(false)
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, draining requests");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, draining requests");
        }
    }
}

/// Initialize the tracing subscriber from configuration
pub fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.clone()));

    let subscriber = fmt().with_env_filter(filter);
    if config.service.environment == "production" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
