//! Bluetooth Module
//!
//! BLE discovery of heart rate peripherals and the GATT link that streams
//! their measurements.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   HeartRateService                       │
//! │  (start/stop control flow - public API for the host)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │             EventBus
//!         ┌─────────────┼─────────────┐   ▲
//!         │             │             │   │ DeviceFound / Connected /
//!         ▼             ▼             ▼   │ Disconnected / HeartRateReading
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ GattSession│  │ Protocol │
//! │           │  │            │  │          │
//! │ - LE scan │  │ - link     │  │ - UUIDs  │
//! │ - registry│  │ - discovery│  │ - names  │
//! │           │  │ - notify   │  │          │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       └──────┬───────┘
//!              ▼
//!        BleAdapter (simulated | bluest)
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Radio collaborator traits and callback types
//! - [`protocol`] - Heart rate profile UUIDs and display names
//! - [`registry`] - Devices found in the current discovery window
//! - [`scanner`] - Bounded LE scan and registry lifetime
//! - [`session`] - GATT link state machine
//! - [`service`] - Main service coordinator
//! - [`simulated`] - Host-driven adapter

pub mod adapter;
#[cfg(feature = "bluest")]
pub mod bluest_backend;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod service;
pub mod simulated;

// Re-export main service for convenience
pub use service::{HeartRateService, StartOutcome};
