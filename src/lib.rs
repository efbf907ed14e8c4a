//! Selective routing of chosen services through a proxy tunnel.
//!
//! The crate glues five concerns together: parsing share links and
//! subscriptions into outbound descriptors, synthesizing the tunnel
//! engine's configuration, teaching the resolver and the kernel which
//! destinations belong to watched services, steering marked packets
//! through the tunnel interface, and exposing the whole lifecycle over
//! an HTTP API.

pub mod adapters;
pub mod classify;
pub mod error;
pub mod generator;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod router;
pub mod store;
pub mod subscriptions;
pub mod utils;
pub mod web_handlers;

pub use error::{AppError, Result};
pub use web_handlers::AppState;
