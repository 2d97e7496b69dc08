//! ucan: the uCAN application-layer protocol stack
//!
//! Implements the 29-bit uCAN frame codec and the two assigned protocols on
//! top of any [`can_transport::CanBus`] backend:
//!
//! - YARP, for node discovery and dynamic address assignment;
//! - RAP, for paged register reads and writes against peer nodes.
//!
//! The [`Bus`] type ties them together: it owns the transport, negotiates an
//! address at startup, auto-answers pings and register requests, and offers
//! blocking request/response operations against other nodes.

mod address;
pub use address::{NodeAddress, NodeHandle};

mod clock;
pub use clock::{Clock, MonotonicClock};

mod error;
pub use error::{BusError, CodecError, HardwareIdError};

mod hwid;
pub use hwid::HardwareId;

mod message;
pub use message::{
    Message, Priority, UnknownBroadcastMessage, UnknownUnicastMessage, RAP_PROTOCOL, YARP_PROTOCOL,
};

mod rap;
pub use rap::{RapMessage, ReadHandler, RegisterMap, WriteHandler, MAX_TRANSFER};

mod yarp;
pub use yarp::YarpMessage;

mod bus;
pub use bus::{BindingState, Bus};
