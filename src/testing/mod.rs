//! Testing utilities and mock implementations
//!
//! Lets the supervisor, registry and pipeline be exercised without a broker
//! or a real record store. [`LoopbackBroker`] covers the rumqttc transport
//! end to end on a local port.

pub mod broker;
pub mod mocks;

pub use broker::LoopbackBroker;
pub use mocks::*;
