//! Relay stress harness library.
//!
//! Exposes the harness modules for integration testing.
//! In normal use `relay-stress` runs as a binary (main.rs).

pub mod cli;
pub mod config;
pub mod generate;
pub mod logging;
pub mod metrics_server;
pub mod output;
