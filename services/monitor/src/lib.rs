//! Monitor service library crate.
//!
//! Exposes the service configuration and HTTP surface for the
//! `fleetwatch-monitor` binary and its integration tests.
pub mod config;
pub mod http;
