use crate::{BusInfo, CanBus, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::time::Duration;

/// A scriptable in-process bus for deterministic tests.
///
/// Inbound traffic is a queue of slots: a frame, or a silence slot that
/// stands in for one receive window elapsing with nothing on the wire.
/// Everything sent through the bus is captured in order.
pub struct MockBus {
    name: String,
    rx: VecDeque<Option<CanFrame>>,
    tx: Vec<CanFrame>,
}

impl MockBus {
    /// Queue a frame to be delivered by a later `recv`.
    pub fn queue_frame(&mut self, frame: CanFrame) {
        self.rx.push_back(Some(frame));
    }

    /// Queue one receive window's worth of silence (a `Timeout` result).
    pub fn queue_silence(&mut self) {
        self.rx.push_back(None);
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> &[CanFrame] {
        &self.tx
    }

    /// Drain and return the send log.
    pub fn take_sent(&mut self) -> Vec<CanFrame> {
        std::mem::take(&mut self.tx)
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            rx: VecDeque::new(),
            tx: Vec::new(),
        })
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn recv(&mut self, _timeout: Option<Duration>) -> Result<CanFrame> {
        match self.rx.pop_front() {
            Some(Some(frame)) => Ok(frame),
            // A scripted quiet window, or nothing left in the script.
            Some(None) | None => Err(TransportError::Timeout),
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        tracing::trace!(bus = %self.name, id = %frame.id, "mock send");
        self.tx.push(frame.clone());
        Ok(())
    }
}
