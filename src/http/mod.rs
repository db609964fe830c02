//! HTTP Escrow API.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum router, middleware stack)
//!     → request.rs (x-request-id, request span)
//!     → handlers.rs (actor extraction, rate limit, engine call)
//!     → response.rs (EscrowError → status + JSON body)
//! ```

pub mod handlers;
pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use response::ApiError;
pub use server::{AppState, HttpServer};
