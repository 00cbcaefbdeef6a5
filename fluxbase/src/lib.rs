//! # fluxbase
//!
//! Self-hosted backend-as-a-service over PostgreSQL. A uniform HTTP and
//! WebSocket surface for authentication, auto-generated table CRUD,
//! change-data-capture and administration, with database-level access
//! control preserved end to end through row-level security.
//!
//! The load-bearing pipeline is request authorization and session
//! binding: credentials become a typed [`principal::Principal`], the
//! abuse gates decide allow or reject, and the [`scope`] binder opens a
//! transaction carrying the principal's database role and claims so that
//! every statement executes under RLS-enforced privileges. Row changes
//! flow back out through the [`realtime`] pipeline, re-validated against
//! the same policies at delivery time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fluxbase::{config::Config, handlers, server::Server, state::AppState};
//!
//! #[tokio::main]
//! async fn main() -> fluxbase::error::Result<()> {
//!     let config = Config::load()?;
//!     fluxbase::server::init_tracing(&config)?;
//!
//!     let state: Arc<AppState> = AppState::build(config.clone()).await?;
//!     let app = handlers::router(state);
//!
//!     Server::new(config).serve(app).await
//! }
//! ```

pub mod admin;
pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod middleware;
pub mod principal;
pub mod realtime;
pub mod scope;
pub mod server;
pub mod state;
pub mod store;
pub mod token;

pub use error::{Error, Result};
pub use principal::Principal;
pub use state::AppState;
