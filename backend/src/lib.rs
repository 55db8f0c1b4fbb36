//! Remote state endpoint for the Telegram account-linking flow.
//!
//! Serves `GET`/`PUT /state` over one record per linking session, decides
//! which writes are allowed, and pokes the Telegram bot when a linked user
//! asks for a test message.

pub mod configuration;
pub mod server;
pub mod telemetry;

pub use server::config::{AppState, app_router, configure_app};
