//! Test utilities for shardbench.
//!
//! This crate provides a fake shard service and a test logger. See the modules for all
//! available utilities.

pub mod server;
pub mod tracing;
