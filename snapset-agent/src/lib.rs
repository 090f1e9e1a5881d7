//! # snapset Node Agent
//!
//! Library half of the `snapset-agent` binary: configuration, the action
//! handlers and the HTTP API that serves them. Requests and replies use the
//! wire types of [`snapset_core::agent_api`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult, ErrorCategory};
pub use handlers::ActionHandler;
pub use server::{router, AppState};
