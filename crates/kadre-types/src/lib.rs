//! # kadre-types
//!
//! Shared domain types for the Kadre routing subsystem.
//!
//! This crate defines:
//! - [`NodeId`] — the integer node identifier with its XOR distance metric
//! - [`KadConfig`] — the immutable per-node protocol configuration
//!
//! Everything downstream (routing table, liveness supervision, node core)
//! is parameterized by these two types.

pub mod config;
pub mod id;

pub use config::{ConfigError, KadConfig};
pub use id::NodeId;
