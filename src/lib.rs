//! Ollama-style inference load-balancing router: distributes text-generation
//! requests across a pool of heterogeneous HTTP backend workers, tracking
//! per-worker throughput/latency to place, reroute, and rebalance load.
//!
//! [`router::Router`] is the crate's public entry point; every other module
//! is an implementation detail it composes.

pub mod backend;
pub mod benchmarker;
pub mod cancellation;
pub mod classifier;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod placement;
pub mod profiler;
pub mod queue;
pub mod rebalancer;
pub mod registry;
pub mod router;
pub mod sentinel;
pub mod utils;
pub mod velocity;

pub use router::Router;
