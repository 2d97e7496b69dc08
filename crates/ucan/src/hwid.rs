use crate::error::HardwareIdError;
use core::fmt;
use core::str::FromStr;

/// A globally unique, burned-in 7-byte device identity.
///
/// Independent of the ephemeral bus address: a node keeps its hardware id
/// across sessions while its [`NodeAddress`](crate::NodeAddress) may change
/// every startup. The human-readable form is colon-separated hex, e.g.
/// `01:23:45:67:89:ab:cd`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareId([u8; 7]);

impl HardwareId {
    pub const LEN: usize = 7;

    pub const fn new(bytes: [u8; 7]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    /// Seed candidate for address negotiation: the low 7 bits of the last
    /// byte, keeping the first probe inside the 0..128 candidate space.
    pub fn default_node_id(&self) -> u8 {
        self.0[6] & 0x7F
    }
}

impl TryFrom<&[u8]> for HardwareId {
    type Error = HardwareIdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != Self::LEN {
            return Err(HardwareIdError::Length(bytes.len()));
        }
        let mut buf = [0u8; 7];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl FromStr for HardwareId {
    type Err = HardwareIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; 7];
        let mut count = 0usize;
        for part in s.split(':') {
            if count == Self::LEN {
                count += 1;
                break;
            }
            if part.len() != 2 {
                return Err(HardwareIdError::Hex(part.to_string()));
            }
            buf[count] = u8::from_str_radix(part, 16)
                .map_err(|_| HardwareIdError::Hex(part.to_string()))?;
            count += 1;
        }
        if count != Self::LEN {
            return Err(HardwareIdError::Length(count));
        }
        Ok(Self(buf))
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareId({self})")
    }
}
