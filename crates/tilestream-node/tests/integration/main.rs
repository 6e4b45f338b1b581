//! Integration test entry point for tilestream-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod convergence;
mod resync;
