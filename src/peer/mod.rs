//! Peer Module
//!
//! Everything that runs on a storage peer.
//!
//! ## Submodules
//! - **`agent`**: Registration, heartbeats, file creation and the transfer
//!   entry points (replicate, download).
//! - **`store`**: In-memory file store with atomic capacity reservation.
//! - **`retry`**: The bounded exponential backoff used for notify.
//! - **`client`**: HTTP transport to the coordinator and to other peers.
//! - **`handlers`**: The peer's HTTP endpoints.

pub mod agent;
pub mod client;
pub mod handlers;
pub mod retry;
pub mod store;

#[cfg(test)]
mod tests;
