//! Client for Bluetooth LE blood-pressure cuffs.
//!
//! Finds a cuff, runs a measurement, decodes the result and keeps a short
//! local history of readings.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
