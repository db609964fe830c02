//! Escrow custody service library.
//!
//! Holds buyer funds in per-escrow custody wallets, pays sellers on
//! release (whole or per milestone) and refunds buyers on cancellation,
//! with an append-only audit trail of every custody action.

pub mod config;
pub mod error;

// Custody core
pub mod blockchain;
pub mod custody;
pub mod escrow;
pub mod payments;
pub mod store;

// Outer surfaces
pub mod admin;
pub mod http;
pub mod webhooks;

// Cross-cutting concerns
pub mod audit;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ServiceConfig;
pub use error::{EscrowError, EscrowResult};
pub use escrow::EscrowEngine;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
