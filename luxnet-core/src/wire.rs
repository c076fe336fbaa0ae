//! Framing: 11-bit composite CAN identifier (6-bit kind, 5-bit node address) + data bytes.

use crate::address::NodeAddress;

const KIND_BITS: u16 = 6;
const ADDRESS_BITS: u16 = 5;
const KIND_MASK: u16 = (1 << KIND_BITS) - 1; // 0x3F
const ADDRESS_MASK: u16 = (1 << ADDRESS_BITS) - 1; // 0x1F

/// Largest data field a classic CAN frame carries.
pub const MAX_DATA_LEN: usize = 8;

/// Combine a message kind and node address into an 11-bit identifier.
/// Bits outside the 6-bit kind and 5-bit address fields are dropped, not rejected.
pub fn compose(kind: u8, addr: u8) -> u16 {
    ((kind as u16 & KIND_MASK) << ADDRESS_BITS) | (addr as u16 & ADDRESS_MASK)
}

/// Split an identifier into (kind, address). Inverse of [`compose`] on the low 11 bits.
pub fn decompose(id: u16) -> (u8, u8) {
    let kind = (id >> ADDRESS_BITS) & KIND_MASK;
    let addr = id & ADDRESS_MASK;
    (kind as u8, addr as u8)
}

/// One bus frame with its identifier already split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub source: NodeAddress,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: u8, source: NodeAddress, payload: Vec<u8>) -> Self {
        Self {
            kind,
            source,
            payload,
        }
    }

    pub fn identifier(&self) -> u16 {
        compose(self.kind, self.source.get())
    }

    /// Rebuild from a raw identifier and data field as delivered by the controller.
    pub fn from_raw(id: u16, data: &[u8]) -> Self {
        let (kind, addr) = decompose(id);
        let len = data.len().min(MAX_DATA_LEN);
        Self {
            kind,
            source: NodeAddress::from_wire(addr),
            payload: data[..len].to_vec(),
        }
    }
}
