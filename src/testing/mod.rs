//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker for exercising the MQTT engine
//! without a network or an external MQTT broker.

pub mod mocks;

pub use mocks::*;
