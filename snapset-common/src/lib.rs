//! # snapset Common
//!
//! Shared utilities for the snapset coordinator and node agent.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use snapset_common::{init_logging, mask_secrets};
//!
//! init_logging("info").unwrap();
//! tracing::info!(command = %mask_secrets("sancli --password=s3cret"), "Running");
//! ```

pub mod logging;
pub mod redact;

pub use logging::{init_logging, init_logging_json, LogFormat};
pub use redact::{mask_secrets, MASK};
