//! Integration test crate for the Kadre routing subsystem.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise end-to-end protocol flows across multiple workspace
//! crates: nodes joining through the origin, full-bucket replacement under
//! churn, lifecycle controls, and journal record shapes.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kadre-integration-tests
//! ```
