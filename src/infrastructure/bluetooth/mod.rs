//! Bluetooth Module
//!
//! Provides the BLE protocol and command plumbing for a Joy-Con 2 pair.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     BridgeService                       │
//! │  (Main coordinator - discovery loop and report pipeline) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐ ┌──────────────┐ ┌────────────┐
//! │ Transport  │ │ CommandQueue │ │  Protocol  │
//! │            │ │              │ │            │
//! │ - scan     │ │ - sequencing │ │ - reports  │
//! │ - notify   │ │ - spacing    │ │ - frames   │
//! │ - write    │ │ - retries    │ │ - replies  │
//! └────────────┘ └──────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Report layout, command frames and reply parsing
//! - [`commands`] - Acknowledged command delivery with retries
//! - [`transport`] - Contract for the platform BLE stack
//! - [`replay`] - Transport that plays back a recorded capture
//! - [`service`] - Main service coordinator

pub mod commands;
pub mod protocol;
pub mod replay;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::{BridgeConfig, BridgeService};
