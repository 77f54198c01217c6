//! Deterministic simulation harness for roomfeed testing.
//!
//! Simulated implementations of the Environment, transport and history
//! collaborators for reproducible testing under scripted failures.
//!
//! # Components
//!
//! - [`SimEnv`]: Tokio virtual clock plus seeded ChaCha RNG
//! - [`SimServer`]: authoritative room log with fault injection
//! - [`SimTransport`] / [`SimHistory`]: collaborator handles onto a server
//!
//! Run tests with `#[tokio::test(start_paused = true)]` so backoff delays and
//! timeouts elapse instantly and deterministically.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv};
pub use sim_server::SimServer;
pub use sim_transport::{SimHistory, SimTransport};
