use crate::address::NodeAddress;
use crate::error::CodecError;
use crate::message::Priority;
use std::collections::HashMap;

/// Most bytes one RAP read or write request may transfer. The 3-bit wire
/// field allows 7, but one byte of header room is deliberately kept free.
pub const MAX_TRANSFER: usize = 6;

const MAX_WIRE_SIZE: u8 = 7;

/// A RAP frame addressing a page/register window in a node's 256x256
/// byte-register space.
///
/// The `size` field is coupled to the payload: attaching data fixes
/// `size == data.len()`, and only payload-free read requests may declare a
/// size directly. The constructors enforce this, so a `RapMessage` is
/// well-formed from birth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RapMessage {
    priority: Priority,
    sender: NodeAddress,
    recipient: NodeAddress,
    write: bool,
    response: bool,
    page: u8,
    register: u8,
    size: u8,
    data: Vec<u8>,
}

impl RapMessage {
    /// A bare read request for `size` bytes starting at `page:register`.
    pub fn read_request(
        sender: NodeAddress,
        recipient: NodeAddress,
        page: u8,
        register: u8,
        size: u8,
    ) -> Result<Self, CodecError> {
        if size > MAX_WIRE_SIZE {
            return Err(CodecError::PayloadTooLarge(usize::from(size)));
        }
        Ok(Self {
            priority: Priority::default(),
            sender,
            recipient,
            write: false,
            response: false,
            page,
            register,
            size,
            data: Vec::new(),
        })
    }

    /// A write request carrying `data`; fire and forget, never answered.
    pub fn write_request(
        sender: NodeAddress,
        recipient: NodeAddress,
        page: u8,
        register: u8,
        data: &[u8],
    ) -> Result<Self, CodecError> {
        Ok(Self {
            write: true,
            response: false,
            ..Self::read_response(sender, recipient, page, register, data)?
        })
    }

    /// The answer to a read request, echoing its window.
    pub fn read_response(
        sender: NodeAddress,
        recipient: NodeAddress,
        page: u8,
        register: u8,
        data: &[u8],
    ) -> Result<Self, CodecError> {
        if data.len() > usize::from(MAX_WIRE_SIZE) {
            return Err(CodecError::PayloadTooLarge(data.len()));
        }
        Ok(Self {
            priority: Priority::default(),
            sender,
            recipient,
            write: false,
            response: true,
            page,
            register,
            size: data.len() as u8,
            data: data.to_vec(),
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the declared size of a payload-free message. Fails once data
    /// is attached: size is derived from the payload then.
    pub fn with_size(mut self, size: u8) -> Result<Self, CodecError> {
        if !self.data.is_empty() {
            return Err(CodecError::SizeWithData);
        }
        if size > MAX_WIRE_SIZE {
            return Err(CodecError::PayloadTooLarge(usize::from(size)));
        }
        self.size = size;
        Ok(self)
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

    pub fn write(&self) -> bool {
        self.write
    }

    pub fn response(&self) -> bool {
        self.response
    }

    pub fn page(&self) -> u8 {
        self.page
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    // write(1) | response(1) | reserved(1) | size(3)
    pub(crate) fn subfields(&self) -> u8 {
        (u8::from(self.write) << 5) | (u8::from(self.response) << 4) | (self.size & 0b111)
    }

    pub(crate) fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.data.len());
        body.push(self.page);
        body.push(self.register);
        if self.write || self.response {
            body.extend_from_slice(&self.data);
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
        let write = subfields & 0b10_0000 != 0;
        let response = subfields & 0b01_0000 != 0;
        let declared_size = subfields & 0b111;

        let page = *body.first().ok_or(CodecError::Truncated("rap page"))?;
        let register = *body.get(1).ok_or(CodecError::Truncated("rap register"))?;

        let (size, data) = if write || response {
            // Payload-bearing frames: size follows the payload.
            let data = body.get(2..).unwrap_or(&[]).to_vec();
            (data.len() as u8, data)
        } else {
            // Bare read request: the header size field is authoritative.
            (declared_size, Vec::new())
        };

        Ok(Self {
            priority,
            sender,
            recipient,
            write,
            response,
            page,
            register,
            size,
            data,
        })
    }
}

/// Per-page register callbacks supplied by the embedding application.
pub type ReadHandler = Box<dyn FnMut(u8, u8) -> u8>;
pub type WriteHandler = Box<dyn FnMut(u8, u8, u8)>;

#[derive(Default)]
struct PageHandlers {
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
}

/// The register space one bus instance answers for: page -> handlers.
///
/// Absent pages are not an error. Reads of an unhandled page yield zero
/// bytes for every register, and writes to one are dropped silently; RAP
/// writes carry no confirmation either way.
#[derive(Default)]
pub struct RegisterMap {
    pages: HashMap<u8, PageHandlers>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install handlers for a page, replacing any previous mapping.
    pub fn configure(
        &mut self,
        page: u8,
        read: Option<ReadHandler>,
        write: Option<WriteHandler>,
    ) {
        self.pages.insert(page, PageHandlers { read, write });
    }

    /// Read `size` registers starting at `register`, wrapping within the
    /// page (register 255 is followed by register 0).
    pub fn read_block(&mut self, page: u8, register: u8, size: u8) -> Vec<u8> {
        let size = usize::from(size);
        match self.pages.get_mut(&page).and_then(|h| h.read.as_mut()) {
            Some(read) => (0..size)
                .map(|i| read(page, register.wrapping_add(i as u8)))
                .collect(),
            None => vec![0; size],
        }
    }

    /// Write `data` starting at `register` with the same wraparound.
    pub fn write_block(&mut self, page: u8, register: u8, data: &[u8]) {
        match self.pages.get_mut(&page).and_then(|h| h.write.as_mut()) {
            Some(write) => {
                for (i, &byte) in data.iter().enumerate() {
                    write(page, register.wrapping_add(i as u8), byte);
                }
            }
            None => {
                tracing::debug!(page, register, len = data.len(), "write to unhandled page dropped");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn me() -> NodeAddress {
        NodeAddress::new(0x10)
    }

    fn peer() -> NodeAddress {
        NodeAddress::new(0x20)
    }

    #[test]
    fn size_tracks_data_length() {
        for len in 0..=MAX_TRANSFER {
            let data = vec![0xA5; len];
            let m = RapMessage::write_request(me(), peer(), 0, 0, &data).unwrap();
            assert_eq!(usize::from(m.size()), len);
        }
    }

    #[test]
    fn size_cannot_be_set_once_data_is_attached() {
        let m = RapMessage::write_request(me(), peer(), 0, 0, &[1, 2, 3]).unwrap();
        assert!(matches!(m.with_size(5), Err(CodecError::SizeWithData)));

        let bare = RapMessage::read_request(me(), peer(), 0, 0, 1).unwrap();
        assert_eq!(bare.with_size(5).unwrap().size(), 5);
    }

    #[test]
    fn wire_size_field_is_three_bits() {
        assert!(RapMessage::read_request(me(), peer(), 0, 0, 8).is_err());
        assert!(RapMessage::write_request(me(), peer(), 0, 0, &[0; 8]).is_err());
        assert!(RapMessage::read_request(me(), peer(), 0, 0, 7).is_ok());
    }

    #[test]
    fn bare_read_body_omits_payload() {
        let m = RapMessage::read_request(me(), peer(), 7, 9, 4).unwrap();
        assert_eq!(m.encode_body(), vec![7, 9]);
        assert_eq!(m.subfields(), 0b00_0100);
    }

    #[test]
    fn read_block_wraps_page_boundary() {
        let mut map = RegisterMap::new();
        map.configure(0, Some(Box::new(|_page, register| register)), None);
        assert_eq!(map.read_block(0, 254, 4), vec![254, 255, 0, 1]);
    }

    #[test]
    fn write_block_wraps_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let mut map = RegisterMap::new();
        map.configure(
            0,
            None,
            Some(Box::new(move |_page, register, byte| {
                sink.borrow_mut().push((register, byte));
            })),
        );
        map.write_block(0, 254, &[10, 11, 12, 13]);
        assert_eq!(
            log.borrow().as_slice(),
            &[(254, 10), (255, 11), (0, 12), (1, 13)]
        );
    }

    #[test]
    fn unhandled_page_reads_zero_and_drops_writes() {
        let mut map = RegisterMap::new();
        assert_eq!(map.read_block(9, 0, 3), vec![0, 0, 0]);
        // Must not panic or error
        map.write_block(9, 0, &[1, 2, 3]);

        // A page with only a write handler still reads as zeroes
        map.configure(1, None, Some(Box::new(|_, _, _| {})));
        assert_eq!(map.read_block(1, 5, 2), vec![0, 0]);
    }

    #[test]
    fn handler_reconfiguration_replaces_page() {
        let mut map = RegisterMap::new();
        map.configure(0, Some(Box::new(|_, _| 1)), None);
        assert_eq!(map.read_block(0, 0, 1), vec![1]);
        map.configure(0, Some(Box::new(|_, _| 2)), None);
        assert_eq!(map.read_block(0, 0, 1), vec![2]);
    }
}
