//! Transport: exclusive owner of the bus controller. Non-blocking send/poll of [`Frame`]s.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::address::NodeAddress;
use crate::protocol::{DecodeError, Message};
use crate::wire::{self, Frame};

/// Raw access to one CAN controller. Implementations never block.
pub trait Bus {
    /// Queue one frame for transmission.
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), SendError>;

    /// Oldest received frame, if any.
    fn receive(&mut self) -> Option<(u16, Vec<u8>)>;
}

/// Controller-reported transmit failure. Payload content never causes one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("bus off")]
    BusOff,
    #[error("transmit buffer full")]
    BufferFull,
    #[error("driver error: {0}")]
    Driver(String),
}

pub struct Transport<B> {
    bus: B,
}

impl<B: Bus> Transport<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Encode and submit one frame. Data beyond 8 bytes is cut off.
    pub fn send(&mut self, kind: u8, addr: NodeAddress, payload: &[u8]) -> Result<(), SendError> {
        let id = wire::compose(kind, addr.get());
        let len = payload.len().min(wire::MAX_DATA_LEN);
        tracing::debug!(id = format_args!("{:#05x}", id), data = ?&payload[..len], "can tx");
        self.bus.transmit(id, &payload[..len])
    }

    pub fn send_message(&mut self, source: NodeAddress, msg: &Message) -> Result<(), SendError> {
        let frame = msg.to_frame(source);
        self.send(frame.kind, frame.source, &frame.payload)
    }

    /// Oldest buffered frame, decoded into kind/address. Returns immediately.
    pub fn poll(&mut self) -> Option<Frame> {
        let (id, data) = self.bus.receive()?;
        tracing::debug!(id = format_args!("{:#05x}", id), data = ?data, "can rx");
        Some(Frame::from_raw(id, &data))
    }

    /// Poll and decode. Undecodable frames come back as `Err` so the caller can drop them.
    pub fn poll_message(&mut self) -> Option<Result<(NodeAddress, Message), DecodeError>> {
        self.poll().map(|frame| Message::from_frame(&frame))
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[derive(Default)]
struct Medium {
    queues: Vec<VecDeque<(u16, Vec<u8>)>>,
    log: Vec<(usize, u16, Vec<u8>)>,
}

/// In-memory broadcast medium. Every endpoint sees every frame sent by the others, as on a
/// real CAN segment. Single-threaded; meant for tests and the daemon's simulation mode.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    inner: Rc<RefCell<Medium>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new controller to the medium.
    pub fn endpoint(&self) -> MemoryBus {
        let mut m = self.inner.borrow_mut();
        m.queues.push(VecDeque::new());
        MemoryBus {
            medium: self.clone(),
            index: m.queues.len() - 1,
            fail_sends: false,
        }
    }

    /// Every frame transmitted so far, with the index of the sending endpoint.
    pub fn transmitted(&self) -> Vec<(usize, u16, Vec<u8>)> {
        self.inner.borrow().log.clone()
    }

    /// Drop all frames waiting at endpoint `index`.
    pub fn discard_pending(&self, index: usize) {
        if let Some(q) = self.inner.borrow_mut().queues.get_mut(index) {
            q.clear();
        }
    }
}

/// One controller attached to a [`MemoryMedium`].
pub struct MemoryBus {
    medium: MemoryMedium,
    index: usize,
    fail_sends: bool,
}

impl MemoryBus {
    /// Standalone bus with nobody else on it.
    pub fn isolated() -> Self {
        MemoryMedium::new().endpoint()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Make every following transmit report bus-off.
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }
}

impl Bus for MemoryBus {
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), SendError> {
        if self.fail_sends {
            return Err(SendError::BusOff);
        }
        let mut m = self.medium.inner.borrow_mut();
        m.log.push((self.index, id, data.to_vec()));
        for (i, q) in m.queues.iter_mut().enumerate() {
            if i != self.index {
                q.push_back((id, data.to_vec()));
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<(u16, Vec<u8>)> {
        self.medium.inner.borrow_mut().queues[self.index].pop_front()
    }
}
