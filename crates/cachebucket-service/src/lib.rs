//! The cache engine behind the `cachebucket` binary.
//!
//! `cachebucket` serves the Go toolchain's `GOCACHEPROG` protocol on stdin/stdout. Cache items
//! live in a local disk cache and are replicated to a remote object store, see [`caching`] for
//! how the two tiers interact and [`protocol`] for the wire format.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod protocol;
pub mod remote;
