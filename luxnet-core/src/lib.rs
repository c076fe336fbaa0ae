//! Inter-node coordination for CAN-networked desk luminaires.
//! Host-driven: no I/O; the host owns the bus driver and the clock and calls [`Node::poll`].

pub mod address;
pub mod boot;
pub mod calibration;
pub mod command;
pub mod config;
pub mod luminaire;
pub mod node;
pub mod protocol;
pub mod reading;
pub mod router;
pub mod transport;
pub mod wire;

pub use address::{NodeAddress, PeerSet};
pub use boot::{Boot, BootEvent, BootState};
pub use calibration::{
    Calibration, CalibrationAction, CalibrationEvent, CalibrationState, GainRow,
};
pub use command::{Command, ConsoleError};
pub use config::Config;
pub use luminaire::{Controller, Driver, History, Luminaire, MemoryDesk, Metrics, Sensor};
pub use node::{Node, Stage};
pub use protocol::{DecodeError, ErrorCode, Field, Message, Stream, Value};
pub use reading::LatestReading;
pub use router::{Dispatch, PendingRequest, Reply, Router, RouterAction};
pub use transport::{Bus, MemoryBus, MemoryMedium, SendError, Transport};
pub use wire::{compose, decompose, Frame};
