use crate::address::{NodeAddress, NodeHandle};
use crate::clock::{Clock, MonotonicClock};
use crate::error::BusError;
use crate::hwid::HardwareId;
use crate::message::Message;
use crate::rap::{RapMessage, ReadHandler, RegisterMap, WriteHandler, MAX_TRANSFER};
use crate::yarp::YarpMessage;
use can_transport::{CanBus, CanFrame, CanId, TransportError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Candidate addresses probed during negotiation live in 0..128.
const CANDIDATE_SPACE: u8 = 128;

/// Where this node stands in address negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingState {
    /// No address yet; sends carry the unassigned marker 0xFF.
    Unbound,
    /// The startup negotiation sequence is running.
    Negotiating,
    /// Holding a stable address until the process ends or a bus authority
    /// reassigns it.
    Bound,
}

/// One node's view of a uCAN bus: owns the transport, the register map and
/// the current address, and runs the protocol state machines.
///
/// Single-threaded and blocking: all waiting happens inside the bounded
/// receive window of one request/response exchange. Wrapping a `Bus` for
/// concurrent use requires serializing access to the whole instance.
pub struct Bus<T: CanBus, C: Clock = MonotonicClock> {
    can: T,
    clock: C,
    hardware_id: HardwareId,
    address: NodeAddress,
    state: BindingState,
    timeout: Duration,
    promiscuous: bool,
    registers: RegisterMap,
    address_hook: Option<Box<dyn FnMut(NodeAddress)>>,
}

impl<T: CanBus> Bus<T, MonotonicClock> {
    pub fn new(can: T, hardware_id: HardwareId) -> Self {
        Self::with_clock(can, hardware_id, MonotonicClock::default())
    }
}

impl<T: CanBus, C: Clock> Bus<T, C> {
    pub fn with_clock(can: T, hardware_id: HardwareId, clock: C) -> Self {
        Self {
            can,
            clock,
            hardware_id,
            address: NodeAddress::BROADCAST,
            state: BindingState::Unbound,
            timeout: Duration::from_secs(1),
            promiscuous: false,
            registers: RegisterMap::new(),
            address_hook: None,
        }
    }

    pub fn hardware_id(&self) -> HardwareId {
        self.hardware_id
    }

    /// Our address on this session; `NodeAddress::BROADCAST` while unbound.
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn binding_state(&self) -> BindingState {
        self.state
    }

    /// The window every request/response exchange waits for a reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// In promiscuous mode, unicast traffic for other nodes is returned
    /// from [`receive`](Self::receive) instead of dropped. Auto-handling
    /// still applies only to frames addressed to us.
    pub fn set_promiscuous(&mut self, on: bool) {
        self.promiscuous = on;
    }

    /// Called whenever a bus authority reassigns our address.
    pub fn on_address_change(&mut self, hook: impl FnMut(NodeAddress) + 'static) {
        self.address_hook = Some(Box::new(hook));
    }

    pub fn transport(&self) -> &T {
        &self.can
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.can
    }

    /// A handle for addressing `address` on this session.
    pub fn node(&self, address: NodeAddress) -> NodeHandle {
        NodeHandle::new(address)
    }

    /// Encode and transmit one message.
    pub fn send(&mut self, message: &Message) -> Result<(), BusError> {
        let (header, body) = message.encode();
        let id = CanId::extended(header)
            .ok_or(TransportError::InvalidFrame("header exceeds 29 bits"))?;
        let frame = CanFrame::new(id, &body).map_err(BusError::Transport)?;
        self.can.send(&frame)?;
        Ok(())
    }

    /// One receive attempt: pull at most one frame, filter, auto-handle,
    /// and return whatever is left for the caller.
    ///
    /// `Ok(None)` covers a quiet window, a frame for someone else, and a
    /// frame fully consumed by an auto-handler alike.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, BusError> {
        let frame = match self.can.recv(timeout) {
            Ok(frame) => frame,
            Err(TransportError::Timeout) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Only extended-id data frames carry uCAN traffic.
        if frame.remote || frame.err || !frame.id.is_extended() {
            trace!(id = %frame.id, "skipping non-protocol frame");
            return Ok(None);
        }

        let message = match Message::decode(frame.id.raw(), frame.payload()) {
            Ok(message) => message,
            Err(e) => {
                warn!(id = %frame.id, error = %e, "skipping malformed frame");
                return Ok(None);
            }
        };

        if let Some(recipient) = message.recipient() {
            if recipient != self.address && !recipient.is_broadcast() {
                if self.promiscuous {
                    return Ok(Some(message));
                }
                trace!(%recipient, "dropping unicast for another node");
                return Ok(None);
            }
        }

        self.autohandle(message)
    }

    fn autohandle(&mut self, message: Message) -> Result<Option<Message>, BusError> {
        match message {
            Message::Yarp(m) => self.handle_yarp(m),
            Message::Rap(m) if !m.response() => self.handle_rap(m),
            other => Ok(Some(other)),
        }
    }

    fn handle_yarp(&mut self, message: YarpMessage) -> Result<Option<Message>, BusError> {
        if message.query() && !message.response() {
            // Ping. An identity filter narrows it to one hardware id.
            if let Some(filter) = message.hardware_id() {
                if filter != self.hardware_id {
                    return Ok(Some(Message::Yarp(message)));
                }
            }
            let reply = YarpMessage::ping_reply(
                self.address,
                message.sender(),
                self.hardware_id,
                message.priority(),
            );
            debug!(to = %message.sender(), "answering ping");
            self.send(&Message::Yarp(reply))?;
            return Ok(None);
        }

        if !message.query() && !message.response() {
            // Address assignment.
            if message.hardware_id() != Some(self.hardware_id) {
                return Ok(Some(Message::Yarp(message)));
            }
            if let Some(new_address) = message.new_node_id() {
                self.address = new_address;
                self.state = BindingState::Bound;
                info!(address = %new_address, "address assigned by bus authority");
                if let Some(hook) = self.address_hook.as_mut() {
                    hook(new_address);
                }
            }
            return Ok(None);
        }

        // Ping replies (and the inert shape) belong to whoever is waiting.
        Ok(Some(Message::Yarp(message)))
    }

    fn handle_rap(&mut self, request: RapMessage) -> Result<Option<Message>, BusError> {
        if request.write() {
            self.registers
                .write_block(request.page(), request.register(), request.data());
            return Ok(None);
        }

        // The 3-bit wire field admits a size of 7, one more byte than a
        // response can carry next to the page and register. Serve what fits
        // rather than failing the whole receive on a nonconforming peer.
        let size = request.size().min(MAX_TRANSFER as u8);
        if size != request.size() {
            warn!(
                from = %request.sender(),
                size = request.size(),
                "clamping oversized read request"
            );
        }
        let data = self
            .registers
            .read_block(request.page(), request.register(), size);
        let reply = RapMessage::read_response(
            self.address,
            request.sender(),
            request.page(),
            request.register(),
            &data,
        )?
        .with_priority(request.priority());
        debug!(
            to = %request.sender(),
            page = request.page(),
            register = request.register(),
            size = request.size(),
            "answering register read"
        );
        self.send(&Message::Rap(reply))?;
        Ok(None)
    }

    /// Poll until `matches` accepts a message or the timeout window closes.
    /// Non-matching messages that reach the caller level are discarded from
    /// the wait; auto-handling still runs for everything received.
    fn receive_until<F>(&mut self, mut matches: F) -> Result<Option<Message>, BusError>
    where
        F: FnMut(&Message) -> bool,
    {
        let start = self.clock.now();
        let mut remaining = self.timeout;
        while !remaining.is_zero() {
            if let Some(message) = self.receive(Some(remaining))? {
                if matches(&message) {
                    return Ok(Some(message));
                }
            }
            let elapsed = self.clock.now().saturating_sub(start);
            remaining = self.timeout.saturating_sub(elapsed);
        }
        Ok(None)
    }

    /// Ping a node; its hardware id if it answered within the window.
    pub fn ping(&mut self, node: NodeHandle) -> Result<Option<HardwareId>, BusError> {
        Ok(self
            .ping_address(node.address())?
            .and_then(|reply| reply.hardware_id()))
    }

    fn ping_address(&mut self, target: NodeAddress) -> Result<Option<YarpMessage>, BusError> {
        self.send(&Message::Yarp(YarpMessage::ping(self.address, target)))?;
        let reply = self.receive_until(|m| {
            matches!(m, Message::Yarp(y) if y.is_reply_from(target))
        })?;
        Ok(match reply {
            Some(Message::Yarp(y)) => Some(y),
            _ => None,
        })
    }

    /// Find the live node owning `hardware_id` via a broadcast identity
    /// ping. `Ok(None)` if nobody answers within the window.
    pub fn node_by_hardware_id(
        &mut self,
        hardware_id: HardwareId,
    ) -> Result<Option<NodeHandle>, BusError> {
        self.send(&Message::Yarp(YarpMessage::ping_by_hardware_id(
            self.address,
            hardware_id,
        )))?;
        let reply = self.receive_until(|m| {
            matches!(m, Message::Yarp(y) if y.is_reply_for(&hardware_id))
        })?;
        Ok(match reply {
            Some(Message::Yarp(y)) => Some(self.node(y.sender())),
            _ => None,
        })
    }

    /// Authority-side: broadcast an assignment telling the owner of
    /// `hardware_id` to adopt `address`.
    pub fn set_address(
        &mut self,
        hardware_id: HardwareId,
        address: NodeAddress,
    ) -> Result<(), BusError> {
        self.send(&Message::Yarp(YarpMessage::assignment(
            self.address,
            hardware_id,
            address,
        )))
    }

    /// Install register handlers for `page`, replacing any previous pair.
    pub fn configure_registers(
        &mut self,
        page: u8,
        read: Option<ReadHandler>,
        write: Option<WriteHandler>,
    ) {
        self.registers.configure(page, read, write);
    }

    /// Read `length` bytes from a peer's register space. Fails before any
    /// bus activity if `length` exceeds [`MAX_TRANSFER`]; `Ok(None)` if the
    /// peer never answers.
    pub fn read_registers(
        &mut self,
        node: NodeHandle,
        page: u8,
        register: u8,
        length: usize,
    ) -> Result<Option<Vec<u8>>, BusError> {
        if length > MAX_TRANSFER {
            return Err(BusError::TransferTooLong(length));
        }
        let target = node.address();
        let request =
            RapMessage::read_request(self.address, target, page, register, length as u8)?;
        self.send(&Message::Rap(request))?;
        let reply = self.receive_until(|m| {
            matches!(m, Message::Rap(r)
                if r.response()
                    && !r.write()
                    && r.sender() == target
                    && r.page() == page
                    && r.register() == register)
        })?;
        Ok(match reply {
            Some(Message::Rap(r)) => Some(r.data().to_vec()),
            _ => None,
        })
    }

    /// Write bytes into a peer's register space; fire and forget. Fails
    /// before any bus activity if `data` exceeds [`MAX_TRANSFER`] bytes.
    pub fn write_registers(
        &mut self,
        node: NodeHandle,
        page: u8,
        register: u8,
        data: &[u8],
    ) -> Result<(), BusError> {
        if data.len() > MAX_TRANSFER {
            return Err(BusError::TransferTooLong(data.len()));
        }
        let request =
            RapMessage::write_request(self.address, node.address(), page, register, data)?;
        self.send(&Message::Rap(request))
    }

    /// Resolve a stable address at startup.
    ///
    /// First asks the bus whether anyone already knows this hardware id; a
    /// reply within one window binds us to the replier's sender address
    /// (central-authority assignment). Otherwise candidate addresses are
    /// probed one by one: an answered ping means the candidate is taken and
    /// the next one (wrapping at 128) is tried; silence means it is free.
    ///
    /// Unlike the protocol's reference behavior, the probe loop is bounded:
    /// after one full pass over the 128-candidate space the negotiation
    /// gives up with [`BusError::NegotiationExhausted`] instead of looping
    /// forever on a fully occupied bus.
    pub fn negotiate_address(
        &mut self,
        preferred: Option<NodeAddress>,
    ) -> Result<NodeAddress, BusError> {
        self.state = BindingState::Negotiating;

        self.send(&Message::Yarp(YarpMessage::ping_by_hardware_id(
            self.address,
            self.hardware_id,
        )))?;
        let own_id = self.hardware_id;
        let assigned = self.receive_until(|m| {
            matches!(m, Message::Yarp(y) if y.is_reply_for(&own_id))
        })?;
        if let Some(Message::Yarp(reply)) = assigned {
            let address = reply.sender();
            info!(%address, "adopting address from bus authority");
            self.bind(address);
            return Ok(address);
        }

        let mut candidate = preferred
            .map(|a| a.raw() & (CANDIDATE_SPACE - 1))
            .unwrap_or_else(|| self.hardware_id.default_node_id());
        for _ in 0..CANDIDATE_SPACE {
            let probe = NodeAddress::new(candidate);
            if self.ping_address(probe)?.is_none() {
                info!(address = %probe, "claiming unanswered address");
                self.bind(probe);
                return Ok(probe);
            }
            debug!(address = %probe, "candidate address in use");
            candidate = (candidate + 1) & (CANDIDATE_SPACE - 1);
        }

        self.state = BindingState::Unbound;
        Err(BusError::NegotiationExhausted(u32::from(CANDIDATE_SPACE)))
    }

    fn bind(&mut self, address: NodeAddress) {
        self.address = address;
        self.state = BindingState::Bound;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use can_transport::MockBus;
    use std::cell::Cell;
    use std::rc::Rc;

    const HWID: HardwareId = HardwareId::new([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD]);
    const OTHER_HWID: HardwareId = HardwareId::new([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCE]);

    /// Advances by one full step on every reading, so each receive window
    /// polls the transport exactly once.
    struct StepClock {
        now: Cell<Duration>,
        step: Duration,
    }

    impl StepClock {
        fn per_window() -> Self {
            Self {
                now: Cell::new(Duration::ZERO),
                step: Duration::from_secs(1),
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> Duration {
            let t = self.now.get();
            self.now.set(t + self.step);
            t
        }
    }

    fn frame_of(message: &Message) -> CanFrame {
        let (header, body) = message.encode();
        CanFrame::new(CanId::extended(header).unwrap(), &body).unwrap()
    }

    fn decode_sent(frame: &CanFrame) -> Message {
        Message::decode(frame.id.raw(), frame.payload()).unwrap()
    }

    fn bound_bus(address: u8) -> Bus<MockBus, StepClock> {
        let can = MockBus::open("mock0").unwrap();
        let mut bus = Bus::with_clock(can, HWID, StepClock::per_window());
        bus.address = NodeAddress::new(address);
        bus.state = BindingState::Bound;
        bus
    }

    #[test]
    fn send_encodes_onto_the_wire() {
        let mut bus = bound_bus(0x10);
        bus.send(&Message::Yarp(YarpMessage::ping(
            NodeAddress::new(0x10),
            NodeAddress::new(0x20),
        )))
        .unwrap();
        let sent = bus.transport().sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(decode_sent(&sent[0]), Message::Yarp(_)));
    }

    #[test]
    fn ping_query_gets_exactly_one_auto_reply() {
        let mut bus = bound_bus(0x10);
        let query = YarpMessage::ping(NodeAddress::new(0x20), NodeAddress::new(0x10))
            .with_priority(Priority::High);
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(query)));

        // Consumed by the auto-handler, not returned
        assert!(bus.receive(None).unwrap().is_none());

        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Yarp(reply) => {
                assert!(reply.query());
                assert!(reply.response());
                assert_eq!(reply.sender(), NodeAddress::new(0x10));
                assert_eq!(reply.recipient(), NodeAddress::new(0x20));
                assert_eq!(reply.hardware_id(), Some(HWID));
                // Reply echoes the query's priority
                assert_eq!(reply.priority(), Priority::High);
            }
            other => panic!("expected yarp reply, got {other:?}"),
        }
    }

    #[test]
    fn identity_filtered_ping_for_someone_else_is_not_answered() {
        let mut bus = bound_bus(0x10);
        let query = YarpMessage::ping_by_hardware_id(NodeAddress::new(0x20), OTHER_HWID);
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(query)));

        // Passed through to the caller instead of being answered
        let received = bus.receive(None).unwrap();
        assert!(matches!(received, Some(Message::Yarp(_))));
        assert!(bus.transport().sent().is_empty());
    }

    #[test]
    fn unicast_for_other_nodes_is_invisible_unless_promiscuous() {
        let mut bus = bound_bus(0x10);
        let foreign = Message::Yarp(YarpMessage::ping(
            NodeAddress::new(0x20),
            NodeAddress::new(0x34),
        ));
        bus.transport_mut().queue_frame(frame_of(&foreign));
        assert!(bus.receive(None).unwrap().is_none());

        bus.set_promiscuous(true);
        bus.transport_mut().queue_frame(frame_of(&foreign));
        let seen = bus.receive(None).unwrap();
        assert_eq!(seen, Some(foreign));
        // Visible, but not auto-handled: no reply went out
        assert!(bus.transport().sent().is_empty());
    }

    #[test]
    fn remote_and_error_frames_are_discarded() {
        let mut bus = bound_bus(0x10);
        let mut frame = frame_of(&Message::Yarp(YarpMessage::ping(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
        )));
        frame.remote = true;
        bus.transport_mut().queue_frame(frame.clone());
        assert!(bus.receive(None).unwrap().is_none());

        frame.remote = false;
        frame.err = true;
        bus.transport_mut().queue_frame(frame);
        assert!(bus.receive(None).unwrap().is_none());
        assert!(bus.transport().sent().is_empty());
    }

    #[test]
    fn assignment_rebinds_and_fires_hook() {
        let mut bus = bound_bus(0x10);
        let changed = Rc::new(Cell::new(None));
        let sink = Rc::clone(&changed);
        bus.on_address_change(move |a| sink.set(Some(a)));

        let assignment = YarpMessage::assignment(
            NodeAddress::new(0x20),
            HWID,
            NodeAddress::new(0x11),
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(assignment)));

        assert!(bus.receive(None).unwrap().is_none());
        assert_eq!(bus.address(), NodeAddress::new(0x11));
        assert_eq!(changed.get(), Some(NodeAddress::new(0x11)));
    }

    #[test]
    fn assignment_for_other_hardware_is_ignored() {
        let mut bus = bound_bus(0x10);
        let assignment = YarpMessage::assignment(
            NodeAddress::new(0x20),
            OTHER_HWID,
            NodeAddress::new(0x11),
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(assignment)));

        let received = bus.receive(None).unwrap();
        assert!(matches!(received, Some(Message::Yarp(_))));
        assert_eq!(bus.address(), NodeAddress::new(0x10));
    }

    #[test]
    fn set_address_broadcasts_an_assignment() {
        let mut bus = bound_bus(0x10);
        bus.set_address(OTHER_HWID, NodeAddress::new(0x12)).unwrap();
        let sent = bus.transport().sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Yarp(m) => {
                assert!(!m.query());
                assert!(!m.response());
                assert_eq!(m.recipient(), NodeAddress::BROADCAST);
                assert_eq!(m.hardware_id(), Some(OTHER_HWID));
                assert_eq!(m.new_node_id(), Some(NodeAddress::new(0x12)));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn ping_returns_peer_hardware_id() {
        let mut bus = bound_bus(0x10);
        let reply = YarpMessage::ping_reply(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            OTHER_HWID,
            Priority::Normal,
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(reply)));

        let peer = bus.node(NodeAddress::new(0x20));
        assert_eq!(bus.ping(peer).unwrap(), Some(OTHER_HWID));

        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Yarp(m) => {
                assert!(m.query());
                assert!(!m.response());
                assert_eq!(m.recipient(), NodeAddress::new(0x20));
                assert_eq!(m.hardware_id(), None);
            }
            other => panic!("expected ping, got {other:?}"),
        }

        // Nobody home: timeout surfaces as None, not an error
        assert_eq!(bus.ping(peer).unwrap(), None);
    }

    #[test]
    fn node_lookup_by_hardware_id() {
        let mut bus = bound_bus(0x10);
        let reply = YarpMessage::ping_reply(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            OTHER_HWID,
            Priority::Normal,
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(reply)));

        let found = bus.node_by_hardware_id(OTHER_HWID).unwrap();
        assert_eq!(found.map(|n| n.address()), Some(NodeAddress::new(0x20)));

        let sent = bus.transport_mut().take_sent();
        match decode_sent(&sent[0]) {
            Message::Yarp(m) => {
                assert_eq!(m.recipient(), NodeAddress::BROADCAST);
                assert_eq!(m.hardware_id(), Some(OTHER_HWID));
            }
            other => panic!("expected identity ping, got {other:?}"),
        }

        assert!(bus.node_by_hardware_id(HWID).unwrap().is_none());
    }

    #[test]
    fn read_registers_round_trip() -> anyhow::Result<()> {
        let mut bus = bound_bus(0x10);
        let peer = bus.node(NodeAddress::new(0x20));
        let response = RapMessage::read_response(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            3,
            7,
            &[1, 2, 3],
        )?;
        bus.transport_mut().queue_frame(frame_of(&Message::Rap(response)));

        let data = bus.read_registers(peer, 3, 7, 3)?;
        assert_eq!(data, Some(vec![1, 2, 3]));

        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Rap(m) => {
                assert!(!m.write());
                assert!(!m.response());
                assert_eq!((m.page(), m.register(), m.size()), (3, 7, 3));
                assert!(m.data().is_empty());
            }
            other => panic!("expected read request, got {other:?}"),
        }

        // Timeout is a normal outcome
        assert_eq!(bus.read_registers(peer, 3, 7, 3)?, None);
        Ok(())
    }

    #[test]
    fn oversize_requests_fail_before_any_bus_activity() {
        let mut bus = bound_bus(0x10);
        let peer = bus.node(NodeAddress::new(0x20));

        assert!(matches!(
            bus.read_registers(peer, 0, 0, 8),
            Err(BusError::TransferTooLong(8))
        ));
        assert!(matches!(
            bus.write_registers(peer, 0, 0, &[0; 9]),
            Err(BusError::TransferTooLong(9))
        ));
        assert!(bus.transport().sent().is_empty());
    }

    #[test]
    fn write_registers_is_fire_and_forget() {
        let mut bus = bound_bus(0x10);
        let peer = bus.node(NodeAddress::new(0x20));
        bus.write_registers(peer, 1, 250, &[9, 8, 7, 6, 5, 4]).unwrap();

        let sent = bus.transport().sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Rap(m) => {
                assert!(m.write());
                assert!(!m.response());
                assert_eq!((m.page(), m.register()), (1, 250));
                assert_eq!(m.data(), &[9, 8, 7, 6, 5, 4]);
            }
            other => panic!("expected write request, got {other:?}"),
        }
    }

    #[test]
    fn incoming_read_request_is_served_from_handlers() {
        let mut bus = bound_bus(0x10);
        bus.configure_registers(3, Some(Box::new(|_page, register| register.wrapping_mul(2))), None);

        let request = RapMessage::read_request(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            3,
            5,
            3,
        )
        .unwrap();
        bus.transport_mut().queue_frame(frame_of(&Message::Rap(request)));

        assert!(bus.receive(None).unwrap().is_none());
        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Rap(m) => {
                assert!(m.response());
                assert!(!m.write());
                assert_eq!(m.recipient(), NodeAddress::new(0x20));
                assert_eq!(m.data(), &[10, 12, 14]);
            }
            other => panic!("expected read response, got {other:?}"),
        }
    }

    #[test]
    fn read_of_unhandled_page_answers_zeroes() {
        let mut bus = bound_bus(0x10);
        let request = RapMessage::read_request(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            9,
            0,
            4,
        )
        .unwrap();
        bus.transport_mut().queue_frame(frame_of(&Message::Rap(request)));

        assert!(bus.receive(None).unwrap().is_none());
        let sent = bus.transport_mut().take_sent();
        match decode_sent(&sent[0]) {
            Message::Rap(m) => assert_eq!(m.data(), &[0, 0, 0, 0]),
            other => panic!("expected read response, got {other:?}"),
        }
    }

    #[test]
    fn wire_maximum_read_request_is_served_clamped() {
        let mut bus = bound_bus(0x10);
        bus.configure_registers(0, Some(Box::new(|_page, register| register)), None);

        // Size 7 fits the 3-bit header field but not a response body.
        let request = RapMessage::read_request(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            0,
            1,
            7,
        )
        .unwrap();
        bus.transport_mut().queue_frame(frame_of(&Message::Rap(request)));

        // Must not surface an error to whatever wait is in flight
        assert!(bus.receive(None).unwrap().is_none());
        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        match decode_sent(&sent[0]) {
            Message::Rap(m) => {
                assert!(m.response());
                assert_eq!(m.data(), &[1, 2, 3, 4, 5, 6]);
            }
            other => panic!("expected read response, got {other:?}"),
        }
    }

    #[test]
    fn incoming_write_request_wraps_page_boundary() {
        use std::cell::RefCell;
        let writes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&writes);

        let mut bus = bound_bus(0x10);
        bus.configure_registers(
            0,
            None,
            Some(Box::new(move |_page, register, byte| {
                sink.borrow_mut().push((register, byte));
            })),
        );

        let request = RapMessage::write_request(
            NodeAddress::new(0x20),
            NodeAddress::new(0x10),
            0,
            254,
            &[1, 2, 3, 4],
        )
        .unwrap();
        bus.transport_mut().queue_frame(frame_of(&Message::Rap(request)));

        assert!(bus.receive(None).unwrap().is_none());
        // No response to writes, ever
        assert!(bus.transport().sent().is_empty());
        assert_eq!(
            writes.borrow().as_slice(),
            &[(254, 1), (255, 2), (0, 3), (1, 4)]
        );
    }

    #[test]
    fn negotiation_walks_past_occupied_addresses() {
        let can = MockBus::open("mock0").unwrap();
        let mut bus = Bus::with_clock(can, HWID, StepClock::per_window());

        // Identity phase: silence. Candidate 0x20: occupied. 0x21: free.
        bus.transport_mut().queue_silence();
        let occupier = YarpMessage::ping_reply(
            NodeAddress::new(0x20),
            NodeAddress::BROADCAST,
            OTHER_HWID,
            Priority::Normal,
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(occupier)));

        let address = bus
            .negotiate_address(Some(NodeAddress::new(0x20)))
            .unwrap();
        assert_eq!(address, NodeAddress::new(0x21));
        assert_eq!(bus.address(), NodeAddress::new(0x21));
        assert_eq!(bus.binding_state(), BindingState::Bound);

        // Identity ping, probe of 0x20, probe of 0x21
        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 3);
        match decode_sent(&sent[0]) {
            Message::Yarp(m) => {
                assert_eq!(m.sender(), NodeAddress::BROADCAST);
                assert_eq!(m.hardware_id(), Some(HWID));
            }
            other => panic!("expected identity ping, got {other:?}"),
        }
        match decode_sent(&sent[2]) {
            Message::Yarp(m) => assert_eq!(m.recipient(), NodeAddress::new(0x21)),
            other => panic!("expected probe, got {other:?}"),
        }
    }

    #[test]
    fn negotiation_defaults_to_hardware_id_seed() {
        let can = MockBus::open("mock0").unwrap();
        let mut bus = Bus::with_clock(can, HWID, StepClock::per_window());

        // Identity silence, then the first probe goes unanswered
        let address = bus.negotiate_address(None).unwrap();
        // Last hwid byte 0xCD -> seed 0x4D
        assert_eq!(address, NodeAddress::new(0x4D));
    }

    #[test]
    fn negotiation_adopts_authority_reply() {
        let can = MockBus::open("mock0").unwrap();
        let mut bus = Bus::with_clock(can, HWID, StepClock::per_window());

        let authority = YarpMessage::ping_reply(
            NodeAddress::new(0x42),
            NodeAddress::BROADCAST,
            HWID,
            Priority::Normal,
        );
        bus.transport_mut().queue_frame(frame_of(&Message::Yarp(authority)));

        let address = bus.negotiate_address(None).unwrap();
        assert_eq!(address, NodeAddress::new(0x42));
        // No candidate probes happened
        assert_eq!(bus.transport().sent().len(), 1);
    }

    #[test]
    fn negotiation_gives_up_on_a_full_bus() {
        let can = MockBus::open("mock0").unwrap();
        let mut bus = Bus::with_clock(can, HWID, StepClock::per_window());

        bus.transport_mut().queue_silence(); // identity phase
        for i in 0..128u8 {
            let candidate = (0x20 + i) & 0x7F;
            let reply = YarpMessage::ping_reply(
                NodeAddress::new(candidate),
                NodeAddress::BROADCAST,
                OTHER_HWID,
                Priority::Normal,
            );
            bus.transport_mut().queue_frame(frame_of(&Message::Yarp(reply)));
        }

        let result = bus.negotiate_address(Some(NodeAddress::new(0x20)));
        assert!(matches!(result, Err(BusError::NegotiationExhausted(128))));
        assert_eq!(bus.binding_state(), BindingState::Unbound);
    }

    #[test]
    fn unknown_protocol_traffic_reaches_the_caller_untouched() {
        let mut bus = bound_bus(0x10);
        // Unicast to us on an unassigned protocol number
        let header = (2u32 << 27) | (0x0C << 22) | (0x15 << 16) | (0x10 << 8) | 0x77;
        let frame = CanFrame::new(CanId::extended(header).unwrap(), &[1, 2, 3]).unwrap();
        bus.transport_mut().queue_frame(frame);

        match bus.receive(None).unwrap() {
            Some(Message::UnknownUnicast(m)) => {
                assert_eq!(m.protocol, 0x0C);
                assert_eq!(m.subfields, 0x15);
                assert_eq!(m.body, vec![1, 2, 3]);
            }
            other => panic!("expected unknown unicast, got {other:?}"),
        }
        assert!(bus.transport().sent().is_empty());
    }
}
