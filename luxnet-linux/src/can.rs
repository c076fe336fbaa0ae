//! Bus backends for the daemon: a SocketCAN interface, or an in-process memory bus.

use std::io;

use luxnet_core::{Bus, MemoryBus, SendError};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};

// Linux errno values reported by the CAN stack.
const ENETDOWN: i32 = 100;
const ENOBUFS: i32 = 105;

/// Non-blocking raw CAN socket.
pub struct SocketCanBus {
    socket: CanSocket,
    interface: String,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> io::Result<Self> {
        let socket = CanSocket::open(interface)?;
        socket.set_nonblocking(true)?;
        tracing::info!(interface, "CAN socket opened");
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }
}

fn send_error(e: io::Error) -> SendError {
    match e.raw_os_error() {
        Some(ENETDOWN) => SendError::BusOff,
        Some(ENOBUFS) => SendError::BufferFull,
        _ if e.kind() == io::ErrorKind::WouldBlock => SendError::BufferFull,
        _ => SendError::Driver(e.to_string()),
    }
}

impl Bus for SocketCanBus {
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), SendError> {
        let sid = StandardId::new(id)
            .ok_or_else(|| SendError::Driver(format!("identifier {id:#x} exceeds 11 bits")))?;
        let frame = CanFrame::new(sid, data)
            .ok_or_else(|| SendError::Driver(format!("{} data bytes", data.len())))?;
        self.socket.write_frame(&frame).map_err(send_error)
    }

    fn receive(&mut self) -> Option<(u16, Vec<u8>)> {
        loop {
            match self.socket.read_frame() {
                Ok(frame) => {
                    // extended, remote and error frames are not ours
                    if frame.is_extended() || frame.is_remote_frame() || frame.is_error_frame() {
                        tracing::trace!(id = frame.raw_id(), "ignoring non-data frame");
                        continue;
                    }
                    return Some((frame.raw_id() as u16, frame.data().to_vec()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    tracing::warn!(interface = %self.interface, error = %e, "CAN read error");
                    return None;
                }
            }
        }
    }
}

/// Whichever bus the config selected.
pub enum LinkBus {
    Can(SocketCanBus),
    Memory(MemoryBus),
}

impl Bus for LinkBus {
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), SendError> {
        match self {
            LinkBus::Can(bus) => bus.transmit(id, data),
            LinkBus::Memory(bus) => bus.transmit(id, data),
        }
    }

    fn receive(&mut self) -> Option<(u16, Vec<u8>)> {
        match self {
            LinkBus::Can(bus) => bus.receive(),
            LinkBus::Memory(bus) => bus.receive(),
        }
    }
}
