use crate::TransportError;
use core::fmt;
use time::OffsetDateTime;

/// 11-bit or 29-bit CAN identifier.
///
/// The uCAN wire format only ever uses 29-bit extended identifiers, but the
/// transport layer still models both so backends can surface (and callers can
/// discard) base-frame traffic from mixed buses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: id11 as u32,
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A received or outgoing CAN data frame (no CAN FD features).
///
/// `remote` and `err` mirror what real controllers report; protocol layers
/// above are expected to skip frames with either flag set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub remote: bool,
    pub err: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    /// Build a data frame; fails when `data` exceeds the 8-byte CAN payload.
    pub fn new(id: CanId, data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > 8 {
            return Err(TransportError::InvalidFrame("payload > 8 bytes"));
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            len: data.len() as u8,
            data: buf,
            remote: false,
            err: false,
            timestamp: None,
        })
    }

    /// The valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(8) as usize]
    }

    pub fn stamped_now(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_range_checks() {
        assert!(CanId::standard(0x7FF).is_some());
        assert!(CanId::standard(0x800).is_none());
        assert!(CanId::extended(0x1FFF_FFFF).is_some());
        assert!(CanId::extended(0x2000_0000).is_none());
    }

    #[test]
    fn frame_rejects_oversize_payload() -> anyhow::Result<()> {
        let id = CanId {
            raw: 0x10283412,
            extended: true,
        };
        assert!(CanFrame::new(id, &[0u8; 9]).is_err());
        let frame = CanFrame::new(id, &[1, 2, 3])?;
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(!frame.remote);
        assert!(!frame.err);
        Ok(())
    }
}
