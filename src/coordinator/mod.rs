//! Coordinator Module
//!
//! The central authority of the cluster. It knows every peer, decides where
//! replicas go and repairs replication when peers disappear.
//!
//! ## Core Concepts
//! - **Registry**: One record per peer; heartbeats and a periodic sweep drive
//!   ONLINE → SUSPECTED → OFFLINE.
//! - **Placement**: Weighted scoring of ONLINE peers over free storage,
//!   bandwidth headroom and CPU.
//! - **Replication**: Per-file state machine; OFFLINE events and the repair
//!   cycle issue replica orders to target peers.
//! - **Control plane**: A single JSON endpoint with an exhaustive dispatcher.

pub mod handlers;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod service;
pub mod types;
