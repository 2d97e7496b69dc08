use crate::address::NodeAddress;
use crate::error::CodecError;
use crate::hwid::HardwareId;
use crate::message::Priority;

/// A YARP discovery frame: ping query, ping reply or address assignment.
///
/// Exactly three shapes are meaningful on the wire:
/// - ping query: `query` set, `response` clear, optional hardware-id filter;
/// - ping reply: `query` and `response` set, carrying the replier's id;
/// - assignment: both clear, carrying a target id and its new address.
///
/// The fourth combination (`response` alone) decodes to an inert message
/// that nothing acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YarpMessage {
    priority: Priority,
    sender: NodeAddress,
    recipient: NodeAddress,
    query: bool,
    response: bool,
    hardware_id: Option<HardwareId>,
    new_node_id: Option<NodeAddress>,
}

impl YarpMessage {
    /// Ping a node by address. `NodeAddress::BROADCAST` asks "anyone there?".
    pub fn ping(sender: NodeAddress, recipient: NodeAddress) -> Self {
        Self {
            priority: Priority::default(),
            sender,
            recipient,
            query: true,
            response: false,
            hardware_id: None,
            new_node_id: None,
        }
    }

    /// Broadcast ping filtered by hardware id: only the owner answers.
    pub fn ping_by_hardware_id(sender: NodeAddress, hardware_id: HardwareId) -> Self {
        Self {
            hardware_id: Some(hardware_id),
            ..Self::ping(sender, NodeAddress::BROADCAST)
        }
    }

    /// Answer a ping, echoing our hardware id at the query's priority.
    pub fn ping_reply(
        sender: NodeAddress,
        recipient: NodeAddress,
        hardware_id: HardwareId,
        priority: Priority,
    ) -> Self {
        Self {
            priority,
            sender,
            recipient,
            query: true,
            response: true,
            hardware_id: Some(hardware_id),
            new_node_id: None,
        }
    }

    /// Instruct the node owning `hardware_id` to adopt `new_node_id`.
    pub fn assignment(
        sender: NodeAddress,
        hardware_id: HardwareId,
        new_node_id: NodeAddress,
    ) -> Self {
        Self {
            priority: Priority::default(),
            sender,
            recipient: NodeAddress::BROADCAST,
            query: false,
            response: false,
            hardware_id: Some(hardware_id),
            new_node_id: Some(new_node_id),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_recipient(mut self, recipient: NodeAddress) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn sender(&self) -> NodeAddress {
        self.sender
    }

    pub fn recipient(&self) -> NodeAddress {
        self.recipient
    }

    pub fn query(&self) -> bool {
        self.query
    }

    pub fn response(&self) -> bool {
        self.response
    }

    pub fn hardware_id(&self) -> Option<HardwareId> {
        self.hardware_id
    }

    pub fn new_node_id(&self) -> Option<NodeAddress> {
        self.new_node_id
    }

    /// Does this frame answer a ping we addressed to `target`?
    pub fn is_reply_from(&self, target: NodeAddress) -> bool {
        self.query && self.response && self.sender == target
    }

    /// Does this frame answer an identity lookup for `hardware_id`?
    pub fn is_reply_for(&self, hardware_id: &HardwareId) -> bool {
        self.query && self.response && self.hardware_id.as_ref() == Some(hardware_id)
    }

    // query(1) | response(1) | has_hardware_id(1) | reserved(3)
    pub(crate) fn subfields(&self) -> u8 {
        (u8::from(self.query) << 5)
            | (u8::from(self.response) << 4)
            | (u8::from(self.hardware_id.is_some()) << 3)
    }

    pub(crate) fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);
        if let Some(hardware_id) = &self.hardware_id {
            body.extend_from_slice(hardware_id.as_bytes());
        }
        if !self.query && !self.response {
            body.push(self.new_node_id.map(NodeAddress::raw).unwrap_or(0xFF));
        }
        body
    }

    pub(crate) fn decode_parts(
        priority: Priority,
        sender: NodeAddress,
        recipient: NodeAddress,
        subfields: u8,
        body: &[u8],
    ) -> Result<Self, CodecError> {
        let query = subfields & 0b10_0000 != 0;
        let response = subfields & 0b01_0000 != 0;
        let has_hardware_id = subfields & 0b00_1000 != 0;

        let mut offset = 0usize;
        let hardware_id = if has_hardware_id {
            let bytes = body
                .get(..HardwareId::LEN)
                .ok_or(CodecError::Truncated("yarp hardware id"))?;
            offset = HardwareId::LEN;
            let mut buf = [0u8; 7];
            buf.copy_from_slice(bytes);
            Some(HardwareId::new(buf))
        } else {
            None
        };

        let new_node_id = if !query && !response {
            let raw = *body
                .get(offset)
                .ok_or(CodecError::Truncated("yarp new node id"))?;
            Some(NodeAddress::new(raw))
        } else {
            None
        };

        Ok(Self {
            priority,
            sender,
            recipient,
            query,
            response,
            hardware_id,
            new_node_id,
        })
    }
}
