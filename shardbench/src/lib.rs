//! A load generator for shard storage services.
//!
//! A run uploads every sample of a [`Corpus`] as a multipart form, remembers the identifier
//! the shard assigns to each file name, reads every object back and finally scrapes the
//! latency timers the service reports on its metrics endpoint.
//!
//! Client-side latencies are recorded in DDSketches, so percentiles of both sides can be
//! compared. Requests are issued one after another by default. Raising the concurrency
//! turns the same run into a throughput test.
//!
//! Payloads are either read from files or generated. Generated payloads follow a
//! *LogNormal* distribution of sizes, defined by the `p50` and `p99` of file sizes.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod bench;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod error;
pub mod http;
pub mod metrics;
pub mod observability;
pub mod report;

pub use crate::bench::run;
pub use crate::corpus::{Corpus, Sample};
pub use crate::error::{Error, Result};
pub use crate::http::ShardRemote;
