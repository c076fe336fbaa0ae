//! One desk's coordination loop. Host-driven: the host calls [`Node::poll`] often and
//! prints what comes back; the node never blocks and never sleeps.

use std::collections::VecDeque;
use std::time::Instant;

use crate::address::{NodeAddress, PeerSet};
use crate::boot::{Boot, BootEvent};
use crate::calibration::{Calibration, CalibrationAction, CalibrationEvent, GainRow};
use crate::command::{Command, ConsoleError};
use crate::config::Config;
use crate::luminaire::Luminaire;
use crate::protocol::{Family, Message};
use crate::router::{Dispatch, Reply, Router, RouterAction};
use crate::transport::{Bus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Booting,
    Calibrating,
    Running,
}

pub struct Node<B, L> {
    me: NodeAddress,
    config: Config,
    transport: Transport<B>,
    desk: L,
    stage: Stage,
    boot: Boot,
    calibration: Option<Calibration>,
    calibration_deadline: Option<Instant>,
    gains: Option<GainRow>,
    router: Router,
    console: VecDeque<String>,
}

impl<B: Bus, L: Luminaire> Node<B, L> {
    /// Create the node and start discovery at `now`.
    pub fn new(me: NodeAddress, bus: B, desk: L, config: Config, now: Instant) -> Self {
        let mut boot = Boot::new(me, &config);
        boot.start(now);
        let router = Router::new(me, PeerSet::with_self(me), now, config.request_timeout());
        Self {
            me,
            transport: Transport::new(bus),
            desk,
            stage: Stage::Booting,
            boot,
            calibration: None,
            calibration_deadline: None,
            gains: None,
            router,
            console: VecDeque::new(),
            config,
        }
    }

    /// Queue one console line. Lines run in order once the node is running and no remote
    /// request is outstanding.
    pub fn submit_line(&mut self, line: impl Into<String>) {
        self.console.push_back(line.into());
    }

    /// Explicitly add a peer, e.g. a late joiner. Returns false if it was already known.
    pub fn add_peer(&mut self, peer: NodeAddress) -> bool {
        let added = self.router.add_peer(peer);
        if added {
            tracing::info!(node = %self.me, %peer, "peer added");
        }
        added
    }

    /// Drain the bus, advance the state machines, run queued commands. Returns the lines
    /// to print.
    pub fn poll(&mut self, now: Instant) -> Vec<Reply> {
        let mut out = Vec::new();

        while let Some(decoded) = self.transport.poll_message() {
            match decoded {
                Ok((from, msg)) => self.on_message(from, msg, now, &mut out),
                Err(e) => tracing::trace!(node = %self.me, error = %e, "dropping frame"),
            }
        }

        match self.stage {
            Stage::Booting => {
                let announce = self.boot.step(BootEvent::Tick, now);
                self.broadcast_all(announce);
                if self.boot.is_complete() {
                    self.finish_boot(now);
                }
            }
            Stage::Calibrating => self.step_calibration(CalibrationEvent::Tick, now, &mut out),
            Stage::Running => {}
        }

        if let Some(reply) = self.router.tick(now) {
            out.push(reply);
        }

        self.run_console(now, &mut out);
        out
    }

    fn on_message(&mut self, from: NodeAddress, msg: Message, now: Instant, out: &mut Vec<Reply>) {
        match Family::of(msg.kind()) {
            Some(Family::Boot) => {
                if self.stage == Stage::Booting {
                    let announce = self.boot.step(BootEvent::Announce(from), now);
                    self.broadcast_all(announce);
                }
            }
            Some(Family::Calibration) => {
                let event = CalibrationEvent::Received { from, msg };
                if self.calibration.is_some() {
                    self.step_calibration(event, now, out);
                }
            }
            _ => {
                let actions = self.router.on_message(from, msg, &mut self.desk, now);
                for action in actions {
                    match action {
                        RouterAction::Send(reply) => self.send(&reply),
                        RouterAction::Print(reply) => out.push(reply),
                    }
                }
            }
        }
    }

    fn finish_boot(&mut self, now: Instant) {
        for peer in self.boot.peers().iter() {
            self.router.add_peer(peer);
        }
        if self.config.calibrate {
            let cal = Calibration::new(self.me, self.router.peers(), &self.config);
            tracing::info!(node = %self.me, order = ?cal.order(), "calibrating");
            self.calibration = Some(cal);
            self.calibration_deadline = Some(now + self.config.calibration_timeout());
            self.stage = Stage::Calibrating;
        } else {
            tracing::info!(node = %self.me, "calibration disabled, running");
            self.stage = Stage::Running;
        }
    }

    fn step_calibration(&mut self, event: CalibrationEvent, now: Instant, out: &mut Vec<Reply>) {
        let Some(cal) = self.calibration.as_mut() else {
            return;
        };
        let actions = cal.step(event, self.desk.lux(), now);
        let complete = cal.is_complete();
        for action in actions {
            match action {
                CalibrationAction::Broadcast(msg) => self.send(&msg),
                CalibrationAction::SetDuty(duty) => {
                    self.desk.set_manual_mode(true);
                    self.desk.set_duty_cycle(duty);
                }
            }
        }
        if self.stage != Stage::Calibrating {
            return;
        }
        if complete {
            let row = self.calibration.as_ref().map(Calibration::gain_row);
            if let Some(row) = row {
                self.desk.set_gain_and_external(row.own_gain(), row.offset);
                tracing::info!(
                    node = %self.me,
                    gain = row.own_gain(),
                    offset = row.offset,
                    "calibration applied, running"
                );
                self.gains = Some(row);
            }
            self.enter_running();
        } else if self.calibration_deadline.is_some_and(|d| now >= d) {
            tracing::warn!(node = %self.me, "calibration timed out, keeping default gains");
            out.push(ConsoleError::CalibrationTimeout.into());
            self.calibration = None;
            self.desk.set_duty_cycle(0.0);
            self.enter_running();
        }
    }

    fn enter_running(&mut self) {
        self.desk.set_manual_mode(false);
        self.calibration_deadline = None;
        self.stage = Stage::Running;
    }

    fn run_console(&mut self, now: Instant, out: &mut Vec<Reply>) {
        while self.stage == Stage::Running && !self.router.is_awaiting() {
            let Some(line) = self.console.pop_front() else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let cmd = match Command::parse(&line) {
                Ok(cmd) => cmd,
                Err(e) => {
                    out.push(e.into());
                    continue;
                }
            };
            match self.router.dispatch(cmd, &mut self.desk, now) {
                Dispatch::Done(reply) => out.push(reply),
                Dispatch::Forward(msg) => {
                    if let Err(e) = self.transport.send_message(self.me, &msg) {
                        tracing::warn!(node = %self.me, error = %e, "request not sent");
                        out.extend(self.router.cancel_pending());
                    }
                }
            }
        }
    }

    fn broadcast_all(&mut self, msgs: Vec<Message>) {
        for msg in msgs {
            self.send(&msg);
        }
    }

    fn send(&mut self, msg: &Message) {
        if let Err(e) = self.transport.send_message(self.me, msg) {
            tracing::warn!(node = %self.me, error = %e, kind = msg.kind(), "transmit failed");
        }
    }

    /// Samples for the active console streams.
    pub fn stream_lines(&self, now: Instant) -> Vec<Reply> {
        self.router.stream_lines(&self.desk, now)
    }

    pub fn address(&self) -> NodeAddress {
        self.me
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_running(&self) -> bool {
        self.stage == Stage::Running
    }

    pub fn peers(&self) -> &PeerSet {
        self.router.peers()
    }

    pub fn boot(&self) -> &Boot {
        &self.boot
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Gains applied to the controller; `None` until calibration completes.
    pub fn gains(&self) -> Option<&GainRow> {
        self.gains.as_ref()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn desk(&self) -> &L {
        &self.desk
    }

    pub fn desk_mut(&mut self) -> &mut L {
        &mut self.desk
    }

    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<B> {
        &mut self.transport
    }
}
