//! # Beacon
//!
//! Beacon ingests CometBFT chain data into a relational store. The `beacon-core` crate provides
//! the ingestion pipeline and its building blocks for embedding Beacon into other applications.
//! Refer to the `beacon` crate for the executable binary.

/// Remote chain data source abstraction and the JSON-RPC implementation.
pub mod block_source;

/// Pure mapping from raw RPC payloads to normalized rows.
pub mod transform;

/// Storage backend abstraction and built-in implementations.
pub mod storage;

/// Concurrent ingestion of explicit height ranges.
pub mod batch;

/// Long-running ingestor following the chain tip.
pub mod ingestor;

/// Process-scoped metrics registry.
pub mod metrics;

/// Types related to handling long-running background services.
pub mod service;

/// Core data types.
pub mod types;

pub mod errors;

/// Internal utilities.
pub mod utils;

#[cfg(test)]
mod test_utils;
