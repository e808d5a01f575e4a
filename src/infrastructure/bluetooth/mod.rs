//! Bluetooth Module
//!
//! Talks to a fleet of wearables over the Nordic UART service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     FleetService                         │
//! │  (Coordinator - dispatch, presence timers, persistence)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner  │  │  Session   │  │  Handlers  │
//! │           │  │            │  │            │
//! │ - Adverts │  │ - Connect  │  │ - Identity │
//! │ - State   │  │ - Chunking │  │ - Transfer │
//! │   codes   │  │ - Lines    │  │ - Sync     │
//! └───────────┘  └─────┬──────┘  └────────────┘
//!                      │
//!                      ▼
//!               ┌────────────┐
//!               │ Connection │  btleplug peripheral behind
//!               │ (UartLink) │  the `Connector` seam
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, wire commands, markers and line decoding
//! - [`assembler`] - Notification fragments to complete lines
//! - [`transport`] - Link traits and the packet chunker
//! - [`session`] - One connection lifecycle and its exchange loop
//! - [`handlers`] - Per-command response state machines
//! - [`scanner`] - Advertisement scanning
//! - [`connection`] - btleplug implementation of the link
//! - [`service`] - Main service coordinator

pub mod assembler;
pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use service::{FleetService, ServiceParts};
