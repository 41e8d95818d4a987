//! Bluetooth Module
//!
//! Talks to a Bluetooth LE blood-pressure cuff.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionController                    │
//! │   (state machine, timers, one task per controller)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │  │ Transport │
//! │           │  │            │  │          │  │           │
//! │ - first   │  │ - attach   │  │ - SFLOAT │  │ - btleplug│
//! │   match   │  │ - release  │  │ - frames │  │ - WinRT   │
//! └───────────┘  └────────────┘  └──────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, SFLOAT and measurement frame decoding, cuff commands
//! - [`transport`] - The backend seam and backend selection
//! - [`scanner`] - Discovery of the first matching cuff
//! - [`connection`] - Attaching to a cuff and owning the session
//! - [`service`] - The connection controller

pub mod btleplug_backend;
pub mod connection;
#[cfg(test)]
pub(crate) mod fake;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt_backend;

// Re-export the controller for convenience
pub use service::{ConnectionController, ControllerError, ControllerHandle};
