//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Master secret → Vault self-test
//!     → Store → Engine → Background tasks → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Stop sweeps
//!     → Flush audit outbox → Save snapshot → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Fail fast: a missing master secret or failed vault self-test is fatal
//! - Listeners start last (traffic only when ready)
//! - Shutdown has a deadline: background tasks still running are abandoned

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown_signal;
