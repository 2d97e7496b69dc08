use core::fmt;

/// An 8-bit session-scoped node address.
///
/// Values 0..=254 address individual nodes; 255 is the broadcast /
/// unassigned marker. Addresses are ephemeral: negotiated at startup and
/// subject to reassignment by a bus authority, never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddress(u8);

impl NodeAddress {
    /// Broadcast recipient, and the sender marker of a not-yet-bound node.
    pub const BROADCAST: Self = Self(0xFF);

    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0xFF
    }
}

impl From<u8> for NodeAddress {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({self})")
    }
}

/// A non-owning reference to a peer on the current bus session, minted by
/// [`Bus::node`](crate::Bus::node). Pairs an address with the session it
/// was observed on; it does not keep the peer (or the bus) alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    address: NodeAddress,
}

impl NodeHandle {
    pub(crate) fn new(address: NodeAddress) -> Self {
        Self { address }
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }
}
