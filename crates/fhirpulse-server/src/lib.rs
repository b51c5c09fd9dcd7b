//! HTTP surface and process wiring for fhirpulse.

pub mod api;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod state;

pub use config::AppConfig;
pub use server::{FhirPulseServer, ServerBuilder, build_app};
pub use state::{AppState, build_state, build_state_with_callbacks};
