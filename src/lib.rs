//! envctl library
//!
//! A single-process control plane for developer environments. Services
//! (MCP servers, Kubernetes connections, port-forward tunnels) are declared
//! through ServiceClass templates, instantiated into a typed registry, and
//! driven through a dependency-aware lifecycle state machine. Every managed
//! MCP server is multiplexed behind one aggregated SSE endpoint.
//!
//! # Architecture
//!
//! - **Registry**: typed in-memory store of services keyed by label
//! - **Lifecycle**: per-service state machine with at-most-one in-flight transition
//! - **Scheduler**: topological start/stop ordering across the dependency graph
//! - **Event bus**: bounded fan-out of state changes to subscribers
//! - **ServiceClass manager**: declarative templates binding lifecycle events to tool calls
//! - **Aggregator**: merges upstream MCP catalogs into one namespaced endpoint
//!
//! # Protocol Version
//!
//! Speaks MCP protocol version 2024-11-05 (HTTP+SSE transport).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod class;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// MCP protocol version spoken on both the upstream and downstream side
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
