use crate::address::NodeAddress;
use crate::error::CodecError;
use crate::rap::RapMessage;
use crate::yarp::YarpMessage;

/// YARP (discovery / address assignment) protocol discriminant.
pub const YARP_PROTOCOL: u8 = 0;
/// RAP (register access) protocol discriminant.
pub const RAP_PROTOCOL: u8 = 1;

// 29-bit header layout, most significant bit first:
//   priority(2) | broadcast(1) | protocol(4) | subfields | sender(8)
// where subfields is 14 bits for broadcast frames, or 6 bits followed by
// the 8-bit recipient for unicast frames.
const PRIORITY_SHIFT: u32 = 27;
const BROADCAST_BIT: u32 = 1 << 26;
const PROTOCOL_SHIFT: u32 = 22;
const UNICAST_SUB_SHIFT: u32 = 16;
const RECIPIENT_SHIFT: u32 = 8;
const BROADCAST_SUB_SHIFT: u32 = 8;

/// Frame priority; lower ordinal wins CAN bus arbitration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Emergency = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Priority::Emergency,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// A frame of an unrecognized protocol, preserved bit-for-bit so that
/// unknown traffic survives a decode/encode pass unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownBroadcastMessage {
    pub priority: Priority,
    pub sender: NodeAddress,
    pub protocol: u8,
    /// The raw 14-bit protocol-specific header field.
    pub subfields: u16,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownUnicastMessage {
    pub priority: Priority,
    pub sender: NodeAddress,
    pub recipient: NodeAddress,
    pub protocol: u8,
    /// The raw 6-bit protocol-specific header field.
    pub subfields: u8,
    pub body: Vec<u8>,
}

/// A typed uCAN message; the closed set of protocols this stack speaks,
/// plus lossless passthrough variants for everything else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Yarp(YarpMessage),
    Rap(RapMessage),
    UnknownBroadcast(UnknownBroadcastMessage),
    UnknownUnicast(UnknownUnicastMessage),
}

impl Message {
    /// Encode into a 29-bit arbitration id and a 0..=8 byte body.
    pub fn encode(&self) -> (u32, Vec<u8>) {
        match self {
            Message::Yarp(m) => (
                pack_unicast(m.priority(), YARP_PROTOCOL, m.subfields(), m.recipient(), m.sender()),
                m.encode_body(),
            ),
            Message::Rap(m) => (
                pack_unicast(m.priority(), RAP_PROTOCOL, m.subfields(), m.recipient(), m.sender()),
                m.encode_body(),
            ),
            Message::UnknownUnicast(m) => (
                pack_unicast(m.priority, m.protocol, m.subfields, m.recipient, m.sender),
                m.body.clone(),
            ),
            Message::UnknownBroadcast(m) => (
                pack_broadcast(m.priority, m.protocol, m.subfields, m.sender),
                m.body.clone(),
            ),
        }
    }

    /// Decode a 29-bit arbitration id and body into a typed message.
    ///
    /// Unknown protocol numbers are never an error; they come back as
    /// passthrough variants. `Err` only occurs for bodies too short for the
    /// YARP/RAP shape their header declares, which a conforming transport
    /// never delivers.
    pub fn decode(header: u32, body: &[u8]) -> Result<Self, CodecError> {
        let priority = Priority::from_bits((header >> PRIORITY_SHIFT) as u8);
        let protocol = ((header >> PROTOCOL_SHIFT) & 0x0F) as u8;
        let sender = NodeAddress::new((header & 0xFF) as u8);

        if header & BROADCAST_BIT != 0 {
            let subfields = ((header >> BROADCAST_SUB_SHIFT) & 0x3FFF) as u16;
            // No broadcast protocols are assigned yet; everything passes through.
            return Ok(Message::UnknownBroadcast(UnknownBroadcastMessage {
                priority,
                sender,
                protocol,
                subfields,
                body: body.to_vec(),
            }));
        }

        let subfields = ((header >> UNICAST_SUB_SHIFT) & 0x3F) as u8;
        let recipient = NodeAddress::new(((header >> RECIPIENT_SHIFT) & 0xFF) as u8);
        match protocol {
            YARP_PROTOCOL => Ok(Message::Yarp(YarpMessage::decode_parts(
                priority, sender, recipient, subfields, body,
            )?)),
            RAP_PROTOCOL => Ok(Message::Rap(RapMessage::decode_parts(
                priority, sender, recipient, subfields, body,
            )?)),
            _ => Ok(Message::UnknownUnicast(UnknownUnicastMessage {
                priority,
                sender,
                recipient,
                protocol,
                subfields,
                body: body.to_vec(),
            })),
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Message::Yarp(m) => m.priority(),
            Message::Rap(m) => m.priority(),
            Message::UnknownBroadcast(m) => m.priority,
            Message::UnknownUnicast(m) => m.priority,
        }
    }

    pub fn sender(&self) -> NodeAddress {
        match self {
            Message::Yarp(m) => m.sender(),
            Message::Rap(m) => m.sender(),
            Message::UnknownBroadcast(m) => m.sender,
            Message::UnknownUnicast(m) => m.sender,
        }
    }

    /// `None` for broadcast frames, which carry no recipient field.
    pub fn recipient(&self) -> Option<NodeAddress> {
        match self {
            Message::Yarp(m) => Some(m.recipient()),
            Message::Rap(m) => Some(m.recipient()),
            Message::UnknownBroadcast(_) => None,
            Message::UnknownUnicast(m) => Some(m.recipient),
        }
    }
}

fn pack_unicast(
    priority: Priority,
    protocol: u8,
    subfields: u8,
    recipient: NodeAddress,
    sender: NodeAddress,
) -> u32 {
    ((priority as u32) << PRIORITY_SHIFT)
        | (u32::from(protocol & 0x0F) << PROTOCOL_SHIFT)
        | (u32::from(subfields & 0x3F) << UNICAST_SUB_SHIFT)
        | (u32::from(recipient.raw()) << RECIPIENT_SHIFT)
        | u32::from(sender.raw())
}

fn pack_broadcast(priority: Priority, protocol: u8, subfields: u16, sender: NodeAddress) -> u32 {
    ((priority as u32) << PRIORITY_SHIFT)
        | BROADCAST_BIT
        | (u32::from(protocol & 0x0F) << PROTOCOL_SHIFT)
        | (u32::from(subfields & 0x3FFF) << BROADCAST_SUB_SHIFT)
        | u32::from(sender.raw())
}
