use crate::{BusInfo, CanFilter, CanFrame, Result, TransportError};
use std::time::Duration;

/// A minimal blocking CAN bus interface.
pub trait CanBus {
    /// Open a CAN interface by name (e.g., "can0", "slcan0").
    fn open(name: &str) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available interfaces for this backend.
    fn list() -> Result<Vec<BusInfo>>;

    /// Set acceptance filters if supported.
    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        Err(TransportError::Unsupported("filters not supported"))
    }

    /// Receive one frame, waiting at most `timeout` (`None` = backend default).
    ///
    /// Returns `TransportError::Timeout` when the window elapses with no
    /// traffic; callers on best-effort buses treat that as a normal outcome.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<CanFrame>;

    /// Send one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;
}
