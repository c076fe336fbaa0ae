//! Bus discovery at startup: announce ourselves periodically, collect every other
//! announcer until the listen window closes.

use std::time::{Duration, Instant};

use crate::address::{NodeAddress, PeerSet};
use crate::config::Config;
use crate::protocol::Message;

/// Discovery progress. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootState {
    Init,
    Broadcast,
    Listen,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootEvent {
    /// Time passed; nothing received.
    Tick,
    /// A boot frame naming this node arrived.
    Announce(NodeAddress),
}

pub struct Boot {
    me: NodeAddress,
    state: BootState,
    peers: PeerSet,
    started: Option<Instant>,
    last_sent: Option<Instant>,
    send_interval: Duration,
    timeout: Duration,
}

impl Boot {
    pub fn new(me: NodeAddress, config: &Config) -> Self {
        Self {
            me,
            state: BootState::Init,
            peers: PeerSet::with_self(me),
            started: None,
            last_sent: None,
            send_interval: config.boot_send_interval(),
            timeout: config.boot_timeout(),
        }
    }

    /// Leave Init. The listen window is measured from here.
    pub fn start(&mut self, now: Instant) {
        if self.state == BootState::Init {
            self.state = BootState::Broadcast;
            self.started = Some(now);
            tracing::info!(node = %self.me, "boot: discovery started");
        }
    }

    /// Advance the state machine. Returns the boot frames to broadcast.
    pub fn step(&mut self, event: BootEvent, now: Instant) -> Vec<Message> {
        let mut out = Vec::new();
        match self.state {
            BootState::Init | BootState::Complete => return out,
            BootState::Broadcast => {
                out.push(self.announce(now));
                self.state = BootState::Listen;
            }
            BootState::Listen => {
                let due = self
                    .last_sent
                    .map_or(true, |t| now.duration_since(t) >= self.send_interval);
                if due {
                    out.push(self.announce(now));
                }
            }
        }

        if let BootEvent::Announce(node) = event {
            self.on_announce(node);
        }

        let elapsed = self.started.map_or(Duration::ZERO, |t| now.duration_since(t));
        if elapsed >= self.timeout {
            self.state = BootState::Complete;
            tracing::info!(
                node = %self.me,
                peers = ?self.peers.to_vec(),
                "boot: complete"
            );
        }
        out
    }

    fn announce(&mut self, now: Instant) -> Message {
        self.last_sent = Some(now);
        Message::Boot { node: self.me }
    }

    fn on_announce(&mut self, node: NodeAddress) {
        if node == self.me {
            return;
        }
        if self.peers.insert(node) {
            tracing::info!(node = %self.me, peer = %node, "boot: peer discovered");
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == BootState::Complete
    }

    /// Sorted, self included.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn into_peers(self) -> PeerSet {
        self.peers
    }
}
