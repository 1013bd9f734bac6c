//! ClusterStore Integration Tests
//!
//! End-to-end tests over mock recordings: generation, loads, statistics,
//! invalidation and recovery of the on-disk cache.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test store
//!
//! # Recovery tests only
//! cargo test --test store persistence::
//! ```

mod common;

mod generation;
mod invalidation;
mod loads;
mod persistence;
mod statistics;
