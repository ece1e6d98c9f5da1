//! Replicated Storage Cluster Library
//!
//! This library crate defines the core modules of the cluster. It serves as
//! the foundation for the binary executable (`main.rs`), which runs either
//! the coordinator or a storage peer.
//!
//! ## Architecture Modules
//! - **`coordinator`**: The central authority. Tracks peers through
//!   heartbeats, places replicas by weighted scoring and repairs replication
//!   when a peer goes offline.
//! - **`peer`**: The storage peer. Creates files, announces them with retry,
//!   serves chunks and runs transfer sessions for replicas and downloads.
//! - **`transfer`**: The chunked, checksummed transfer protocol (planner,
//!   frame codec, sequential/parallel session, progress accounting).
//! - **`config`**, **`error`**, **`types`**, **`events`**: Shared tunables,
//!   the error taxonomy, identifiers and the event log drain.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod peer;
pub mod transfer;
pub mod types;
