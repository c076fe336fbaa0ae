//! Pairwise gain calibration by token passing.
//!
//! Nodes take turns in ascending address order. The turn holder lights its LED at a low
//! and then a high duty cycle; every other node samples its own sensor at each step and
//! acknowledges. From the two samples each node learns how strongly the holder's LED
//! couples into its own desk. Exactly one node leaves [`CalibrationState::Idle`] at a time.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::address::{NodeAddress, PeerSet};
use crate::config::Config;
use crate::protocol::{Message, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    WaitAck,
    FirstLight,
    WaitHigh,
    SecondLight,
    WaitDone,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Tick,
    Received { from: NodeAddress, msg: Message },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationAction {
    Broadcast(Message),
    /// Drive the local LED directly.
    SetDuty(f32),
}

/// Coupling gains as seen from one desk: `gains[i]` is the lux this desk gains per unit
/// duty of the node at turn position `i`. The own entry is the desk's self gain.
#[derive(Debug, Clone, PartialEq)]
pub struct GainRow {
    pub order: Vec<NodeAddress>,
    pub gains: Vec<f32>,
    /// Background illuminance estimate from the own turn.
    pub offset: f32,
    own_index: usize,
}

impl GainRow {
    pub fn own_gain(&self) -> f32 {
        self.gains.get(self.own_index).copied().unwrap_or(0.0)
    }

    pub fn gain_for(&self, node: NodeAddress) -> Option<f32> {
        let i = self.order.iter().position(|n| *n == node)?;
        self.gains.get(i).copied()
    }
}

pub struct Calibration {
    me: NodeAddress,
    order: Vec<NodeAddress>,
    own_index: usize,
    turn: usize,
    state: CalibrationState,
    holder: Option<NodeAddress>,
    acks: BTreeSet<NodeAddress>,
    ml: f32,
    mh: f32,
    /// Samples taken during another node's turn, and whose turn they belong to.
    sampled_low: Option<f32>,
    sampled_high: Option<f32>,
    sampled_for: Option<NodeAddress>,
    gains: Vec<f32>,
    offset: f32,
    measure_started: Option<Instant>,
    last_sent: Option<Instant>,
    complete: bool,
    low_duty: f32,
    high_duty: f32,
    measurement_time: Duration,
    resend_interval: Duration,
}

impl Calibration {
    /// `peers` must include `me`; it is added if missing.
    pub fn new(me: NodeAddress, peers: &PeerSet, config: &Config) -> Self {
        let mut set = peers.clone();
        set.insert(me);
        let order = set.to_vec();
        let own_index = set.position(me).unwrap_or(0);
        Self {
            me,
            gains: vec![0.0; order.len()],
            order,
            own_index,
            turn: 0,
            state: CalibrationState::Idle,
            holder: None,
            acks: BTreeSet::new(),
            ml: 0.0,
            mh: 0.0,
            sampled_low: None,
            sampled_high: None,
            sampled_for: None,
            offset: 0.0,
            measure_started: None,
            last_sent: None,
            complete: false,
            low_duty: config.low_duty,
            high_duty: config.high_duty,
            measurement_time: config.measurement_time(),
            resend_interval: config.resend_interval(),
        }
    }

    /// Feed one event. `lux` is the latest local reading.
    pub fn step(
        &mut self,
        event: CalibrationEvent,
        lux: f32,
        now: Instant,
    ) -> Vec<CalibrationAction> {
        let mut out = Vec::new();
        if let CalibrationEvent::Received { from, msg } = event {
            self.on_message(from, msg, lux, &mut out);
        }
        if !self.complete {
            self.advance_own_turn(lux, now, &mut out);
        }
        out
    }

    fn on_message(
        &mut self,
        from: NodeAddress,
        msg: Message,
        lux: f32,
        out: &mut Vec<CalibrationAction>,
    ) {
        if from == self.me || !self.order.contains(&from) {
            tracing::trace!(%from, ?msg, "calibration: ignoring frame from outside peer set");
            return;
        }
        match msg {
            Message::RequestTurn => {
                self.catch_up(from);
                self.holder = Some(from);
                out.push(self.ack(from, Phase::Turn));
            }
            Message::LowLight => {
                self.catch_up(from);
                self.sampled_low = Some(lux);
                self.sampled_for = Some(from);
                out.push(self.ack(from, Phase::Low));
            }
            Message::HighLight => {
                self.catch_up(from);
                if self.sampled_for == Some(from) {
                    self.sampled_high = Some(lux);
                }
                out.push(self.ack(from, Phase::High));
            }
            Message::TurnAck { to, phase } if to == self.me => {
                if self.expected_phase() == Some(phase) {
                    self.acks.insert(from);
                }
            }
            Message::DoneLight if !self.complete => {
                self.catch_up(from);
                if self.complete || self.order.get(self.turn) != Some(&from) {
                    return;
                }
                self.record_coupling(from);
                self.holder = None;
                self.next_turn(out);
            }
            Message::CalibrationDone if !self.complete => {
                self.complete = true;
                self.state = CalibrationState::Idle;
                tracing::info!(node = %self.me, by = %from, "calibration: complete (announced)");
            }
            _ => {}
        }
    }

    fn advance_own_turn(&mut self, lux: f32, now: Instant, out: &mut Vec<CalibrationAction>) {
        match self.state {
            CalibrationState::Idle => {
                if self.order.get(self.turn) == Some(&self.me) {
                    tracing::info!(node = %self.me, "calibration: my turn");
                    self.acks.clear();
                    self.holder = Some(self.me);
                    self.broadcast(Message::RequestTurn, now, out);
                    self.state = CalibrationState::WaitAck;
                }
            }
            CalibrationState::WaitAck => {
                if self.all_acked() {
                    out.push(CalibrationAction::SetDuty(self.low_duty));
                    self.measure_started = Some(now);
                    self.state = CalibrationState::FirstLight;
                } else if self.resend_due(now) {
                    self.broadcast(Message::RequestTurn, now, out);
                }
            }
            CalibrationState::FirstLight => {
                if self.measured(now) {
                    self.ml = lux;
                    self.acks.clear();
                    self.broadcast(Message::LowLight, now, out);
                    self.state = CalibrationState::WaitHigh;
                }
            }
            CalibrationState::WaitHigh => {
                if self.all_acked() {
                    out.push(CalibrationAction::SetDuty(self.high_duty));
                    self.measure_started = Some(now);
                    self.state = CalibrationState::SecondLight;
                } else if self.resend_due(now) {
                    self.broadcast(Message::LowLight, now, out);
                }
            }
            CalibrationState::SecondLight => {
                if self.measured(now) {
                    self.mh = lux;
                    self.acks.clear();
                    self.broadcast(Message::HighLight, now, out);
                    self.state = CalibrationState::WaitDone;
                }
            }
            CalibrationState::WaitDone => {
                if self.all_acked() {
                    let gain = (self.mh - self.ml) / self.duty_span();
                    self.gains[self.own_index] = gain;
                    self.offset = self.mh - gain;
                    tracing::info!(node = %self.me, gain, offset = self.offset, "calibration: self gain");
                    self.broadcast(Message::DoneLight, now, out);
                    out.push(CalibrationAction::SetDuty(0.0));
                    self.ml = 0.0;
                    self.mh = 0.0;
                    self.holder = None;
                    self.state = CalibrationState::Idle;
                    self.next_turn(out);
                } else if self.resend_due(now) {
                    self.broadcast(Message::HighLight, now, out);
                }
            }
        }
    }

    /// A frame from a node later in the order means the DoneLight of the current holder
    /// was lost. Keep what was sampled for the missed turn and jump to the sender's turn.
    /// Never skips this node's own turn.
    fn catch_up(&mut self, from: NodeAddress) {
        if self.complete || self.state != CalibrationState::Idle {
            return;
        }
        let Some(k) = self.order.iter().position(|n| *n == from) else {
            return;
        };
        if k <= self.turn || (self.turn..k).contains(&self.own_index) {
            return;
        }
        let missed = self.order[self.turn];
        tracing::warn!(node = %self.me, %missed, holder = %from, "calibration: DoneLight lost, catching up");
        self.record_coupling(missed);
        self.turn = k;
    }

    /// Store the coupling gain for `of`'s turn from the two samples, if both were taken.
    fn record_coupling(&mut self, of: NodeAddress) {
        let samples = (self.sampled_for == Some(of))
            .then_some((self.sampled_low, self.sampled_high));
        match samples {
            Some((Some(low), Some(high))) => {
                let gain = (high - low) / self.duty_span();
                if let Some(i) = self.order.iter().position(|n| *n == of) {
                    self.gains[i] = gain;
                }
                tracing::info!(node = %self.me, %of, gain, "calibration: coupling gain");
            }
            _ => tracing::warn!(node = %self.me, %of, "calibration: turn missed, gain unmeasured"),
        }
        self.sampled_low = None;
        self.sampled_high = None;
        self.sampled_for = None;
    }

    fn next_turn(&mut self, out: &mut Vec<CalibrationAction>) {
        self.turn += 1;
        if self.turn >= self.order.len() {
            out.push(CalibrationAction::Broadcast(Message::CalibrationDone));
            self.complete = true;
            tracing::info!(node = %self.me, gains = ?self.gains, "calibration: complete");
        }
    }

    fn ack(&self, to: NodeAddress, phase: Phase) -> CalibrationAction {
        CalibrationAction::Broadcast(Message::TurnAck { to, phase })
    }

    fn broadcast(&mut self, msg: Message, now: Instant, out: &mut Vec<CalibrationAction>) {
        self.last_sent = Some(now);
        out.push(CalibrationAction::Broadcast(msg));
    }

    fn expected_phase(&self) -> Option<Phase> {
        match self.state {
            CalibrationState::WaitAck => Some(Phase::Turn),
            CalibrationState::WaitHigh => Some(Phase::Low),
            CalibrationState::WaitDone => Some(Phase::High),
            _ => None,
        }
    }

    fn all_acked(&self) -> bool {
        self.acks.len() >= self.order.len() - 1
    }

    fn resend_due(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |t| now.duration_since(t) >= self.resend_interval)
    }

    fn measured(&self, now: Instant) -> bool {
        self.measure_started
            .map_or(false, |t| now.duration_since(t) >= self.measurement_time)
    }

    fn duty_span(&self) -> f32 {
        self.high_duty - self.low_duty
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Node currently holding the turn, as far as this node knows.
    pub fn holder(&self) -> Option<NodeAddress> {
        self.holder
    }

    pub fn order(&self) -> &[NodeAddress] {
        &self.order
    }

    pub fn gain_row(&self) -> GainRow {
        GainRow {
            order: self.order.clone(),
            gains: self.gains.clone(),
            offset: self.offset,
            own_index: self.own_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> NodeAddress {
        NodeAddress::new(n).unwrap()
    }

    fn peers(ids: &[u8]) -> PeerSet {
        ids.iter().map(|n| addr(*n)).collect()
    }

    fn rx(from: u8, msg: Message) -> CalibrationEvent {
        CalibrationEvent::Received {
            from: addr(from),
            msg,
        }
    }

    fn broadcasts(actions: &[CalibrationAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                CalibrationAction::Broadcast(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lowest_address_requests_first() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut first = Calibration::new(addr(1), &peers(&[1, 2]), &cfg);
        let mut second = Calibration::new(addr(2), &peers(&[1, 2]), &cfg);
        assert_eq!(
            broadcasts(&first.step(CalibrationEvent::Tick, 0.0, t0)),
            vec![Message::RequestTurn]
        );
        assert_eq!(first.state(), CalibrationState::WaitAck);
        assert!(second.step(CalibrationEvent::Tick, 0.0, t0).is_empty());
        assert_eq!(second.state(), CalibrationState::Idle);
    }

    #[test]
    fn peer_acks_and_samples() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(2), &peers(&[1, 2]), &cfg);
        let out = cal.step(rx(1, Message::RequestTurn), 0.0, t0);
        assert_eq!(
            broadcasts(&out),
            vec![Message::TurnAck {
                to: addr(1),
                phase: Phase::Turn
            }]
        );
        assert_eq!(cal.holder(), Some(addr(1)));
        cal.step(rx(1, Message::LowLight), 10.0, t0);
        cal.step(rx(1, Message::HighLight), 40.0, t0);
        cal.step(rx(1, Message::DoneLight), 0.0, t0);
        let row = cal.gain_row();
        assert!((row.gain_for(addr(1)).unwrap() - 50.0).abs() < 1e-3);
    }

    #[test]
    fn resends_request_until_acked() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(1), &peers(&[1, 2, 3]), &cfg);
        cal.step(CalibrationEvent::Tick, 0.0, t0);
        let again = cal.step(CalibrationEvent::Tick, 0.0, t0 + cfg.resend_interval());
        assert_eq!(broadcasts(&again), vec![Message::RequestTurn]);
    }

    #[test]
    fn duplicate_and_stale_acks_are_not_counted() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(1), &peers(&[1, 2, 3]), &cfg);
        cal.step(CalibrationEvent::Tick, 0.0, t0);
        let turn_ack = Message::TurnAck {
            to: addr(1),
            phase: Phase::Turn,
        };
        cal.step(rx(2, turn_ack.clone()), 0.0, t0);
        cal.step(rx(2, turn_ack.clone()), 0.0, t0);
        assert_eq!(cal.state(), CalibrationState::WaitAck);
        let low_ack = Message::TurnAck {
            to: addr(1),
            phase: Phase::Low,
        };
        cal.step(rx(3, low_ack), 0.0, t0);
        assert_eq!(cal.state(), CalibrationState::WaitAck);
        let out = cal.step(rx(3, turn_ack), 0.0, t0);
        assert_eq!(out, vec![CalibrationAction::SetDuty(cfg.low_duty)]);
        assert_eq!(cal.state(), CalibrationState::FirstLight);
    }

    #[test]
    fn full_turn_computes_self_gain_and_offset() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(1), &peers(&[1, 2]), &cfg);
        let ack = |phase| {
            rx(
                2,
                Message::TurnAck {
                    to: addr(1),
                    phase,
                },
            )
        };
        cal.step(CalibrationEvent::Tick, 0.0, t0);
        cal.step(ack(Phase::Turn), 0.0, t0);
        let t1 = t0 + cfg.measurement_time();
        assert_eq!(
            broadcasts(&cal.step(CalibrationEvent::Tick, 20.0, t1)),
            vec![Message::LowLight]
        );
        let out = cal.step(ack(Phase::Low), 20.0, t1);
        assert_eq!(out, vec![CalibrationAction::SetDuty(cfg.high_duty)]);
        let t2 = t1 + cfg.measurement_time();
        assert_eq!(
            broadcasts(&cal.step(CalibrationEvent::Tick, 80.0, t2)),
            vec![Message::HighLight]
        );
        let out = cal.step(ack(Phase::High), 80.0, t2);
        assert!(out.contains(&CalibrationAction::Broadcast(Message::DoneLight)));
        assert!(out.contains(&CalibrationAction::SetDuty(0.0)));
        assert_eq!(cal.state(), CalibrationState::Idle);
        assert!(!cal.is_complete());

        let row = cal.gain_row();
        assert!((row.own_gain() - 100.0).abs() < 1e-3);
        assert!((row.offset - (80.0 - 100.0)).abs() < 1e-3);
    }

    #[test]
    fn last_done_light_completes_and_announces() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(1), &peers(&[1, 2]), &cfg);
        cal.turn = 1;
        let out = cal.step(rx(2, Message::DoneLight), 0.0, t0);
        assert!(cal.is_complete());
        assert_eq!(broadcasts(&out), vec![Message::CalibrationDone]);
    }

    #[test]
    fn stale_done_light_is_ignored() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(3), &peers(&[1, 2, 3]), &cfg);
        cal.turn = 1;
        cal.step(rx(1, Message::DoneLight), 0.0, t0);
        assert_eq!(cal.turn, 1);
        assert_eq!(cal.gain_row().gains, vec![0.0; 3]);
    }

    #[test]
    fn lost_done_light_is_recovered_from_next_holder() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(3), &peers(&[1, 2, 3]), &cfg);
        // node 1's turn, but its DoneLight never arrives
        cal.step(rx(1, Message::RequestTurn), 5.0, t0);
        cal.step(rx(1, Message::LowLight), 10.0, t0);
        cal.step(rx(1, Message::HighLight), 22.0, t0);

        let out = cal.step(rx(2, Message::RequestTurn), 5.0, t0);
        assert_eq!(
            broadcasts(&out),
            vec![Message::TurnAck {
                to: addr(2),
                phase: Phase::Turn
            }]
        );
        assert_eq!(cal.turn, 1);
        assert_eq!(cal.holder(), Some(addr(2)));
        cal.step(rx(2, Message::LowLight), 10.0, t0);
        cal.step(rx(2, Message::HighLight), 40.0, t0);
        let out = cal.step(rx(2, Message::DoneLight), 5.0, t0);

        // own turn starts right away
        assert_eq!(broadcasts(&out), vec![Message::RequestTurn]);
        assert_eq!(cal.state(), CalibrationState::WaitAck);
        let row = cal.gain_row();
        assert!((row.gain_for(addr(1)).unwrap() - 20.0).abs() < 1e-3);
        assert!((row.gain_for(addr(2)).unwrap() - 50.0).abs() < 1e-3);
    }

    #[test]
    fn missed_turn_without_samples_stays_unmeasured() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(3), &peers(&[1, 2, 3]), &cfg);
        cal.step(rx(2, Message::LowLight), 10.0, t0);
        assert_eq!(cal.turn, 1);
        assert_eq!(cal.gain_row().gain_for(addr(1)), Some(0.0));
    }

    #[test]
    fn never_skips_own_turn() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(2), &peers(&[1, 2, 3]), &cfg);
        cal.step(rx(3, Message::RequestTurn), 0.0, t0);
        assert_eq!(cal.turn, 0);
    }

    #[test]
    fn calibration_done_completes_without_turn() {
        let cfg = Config::default();
        let mut cal = Calibration::new(addr(5), &peers(&[1, 5]), &cfg);
        cal.step(rx(1, Message::CalibrationDone), 0.0, Instant::now());
        assert!(cal.is_complete());
        assert_eq!(cal.state(), CalibrationState::Idle);
    }

    #[test]
    fn lone_node_calibrates_itself() {
        let cfg = Config::default();
        let t0 = Instant::now();
        let mut cal = Calibration::new(addr(4), &PeerSet::with_self(addr(4)), &cfg);
        cal.step(CalibrationEvent::Tick, 0.0, t0);
        cal.step(CalibrationEvent::Tick, 0.0, t0);
        let t1 = t0 + cfg.measurement_time();
        cal.step(CalibrationEvent::Tick, 10.0, t1);
        cal.step(CalibrationEvent::Tick, 10.0, t1);
        let t2 = t1 + cfg.measurement_time();
        cal.step(CalibrationEvent::Tick, 70.0, t2);
        let out = cal.step(CalibrationEvent::Tick, 70.0, t2);
        assert!(cal.is_complete());
        assert_eq!(
            broadcasts(&out),
            vec![Message::DoneLight, Message::CalibrationDone]
        );
    }
}
