//! Basic library shared by the sync services
//!
//! Provides:
//! - logging initialisation (console + rolling file)
//! - graceful shutdown signal handling
//! - common command-line arguments

pub mod bootstrap_args;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use logging::{init_with_config, LogConfig, LogGuard};
pub use shutdown::{shutdown_on_signal, wait_for_shutdown};
