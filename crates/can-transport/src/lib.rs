//! can-transport: blocking CAN bus abstractions for the uCAN stack
//!
//! This crate provides the link-layer traits and types the protocol crate is
//! built against, with feature-gated backends. The default build enables a
//! scriptable `mock` backend so the stack can be exercised on any host
//! without native drivers.

mod types;
pub use types::{BusInfo, CanFilter, CanFrame, CanId, Timestamp};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::CanBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::MockBus;

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus};
