//! Command routing: local commands run against the luminaire, remote ones become a single
//! request/response exchange with a deadline. Also answers requests addressed to us.

use std::fmt;
use std::time::{Duration, Instant};

use crate::address::{NodeAddress, PeerSet};
use crate::command::{Command, ConsoleError};
use crate::luminaire::{read_field, write_field, History, Luminaire};
use crate::protocol::{Field, Message, Stream, Value, DUTY_RELEASE};

/// One console output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value {
        field: Field,
        desk: NodeAddress,
        value: Value,
    },
    History {
        series: History,
        desk: NodeAddress,
        samples: Vec<f32>,
    },
    Ack {
        note: Option<&'static str>,
    },
    /// Periodic stream sample. `values` follow the order duty, lux, reference, voltage.
    Stream {
        stream: Stream,
        desk: NodeAddress,
        values: Vec<f32>,
        millis: u64,
    },
    Error(ConsoleError),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value { field, desk, value } => {
                write!(f, "{} {} {}", field.code(), desk, value.display(*field))
            }
            Reply::History {
                series,
                desk,
                samples,
            } => {
                write!(f, "b {} {}", series.code(), desk)?;
                for (i, s) in samples.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{s:.2}")?;
                }
                Ok(())
            }
            Reply::Ack { note: None } => f.write_str("ack"),
            Reply::Ack { note: Some(note) } => write!(f, "ack ({note})"),
            Reply::Stream {
                stream,
                desk,
                values,
                millis,
            } => {
                write!(f, "s {} {}", stream.code(), desk)?;
                for v in values {
                    write!(f, " {v:.3}")?;
                }
                write!(f, " {millis}")
            }
            Reply::Error(e) => write!(f, "err {e}"),
        }
    }
}

impl From<ConsoleError> for Reply {
    fn from(e: ConsoleError) -> Self {
        Reply::Error(e)
    }
}

/// What a remote request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expect {
    Value(Field),
    Ack {
        field: Field,
        note: Option<&'static str>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub responder: NodeAddress,
    pub expect: Expect,
    pub deadline: Instant,
}

/// Result of dispatching one console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Handled without the bus.
    Done(Reply),
    /// Transmit this request; a [`PendingRequest`] is now registered.
    Forward(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    Send(Message),
    Print(Reply),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreamFlags {
    duty: bool,
    lux: bool,
    reference: bool,
    voltage: bool,
}

impl StreamFlags {
    fn set(&mut self, stream: Stream, on: bool) {
        match stream {
            Stream::Duty => self.duty = on,
            Stream::Illuminance => self.lux = on,
            Stream::Reference => self.reference = on,
            Stream::Voltage => self.voltage = on,
            Stream::All => *self = StreamFlags {
                duty: on,
                lux: on,
                reference: on,
                voltage: on,
            },
        }
    }

    fn all(&self) -> bool {
        self.duty && self.lux && self.reference && self.voltage
    }

    fn any(&self) -> bool {
        self.duty || self.lux || self.reference || self.voltage
    }
}

pub struct Router {
    me: NodeAddress,
    peers: PeerSet,
    pending: Option<PendingRequest>,
    streams: StreamFlags,
    started: Instant,
    request_timeout: Duration,
}

impl Router {
    pub fn new(me: NodeAddress, peers: PeerSet, started: Instant, request_timeout: Duration) -> Self {
        let mut peers = peers;
        peers.insert(me);
        Self {
            me,
            peers,
            pending: None,
            streams: StreamFlags::default(),
            started,
            request_timeout,
        }
    }

    pub fn address(&self) -> NodeAddress {
        self.me
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Returns false if the peer was already known.
    pub fn add_peer(&mut self, peer: NodeAddress) -> bool {
        self.peers.insert(peer)
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn is_awaiting(&self) -> bool {
        self.pending.is_some()
    }

    fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Run a console command. Remote commands register a pending request, so callers
    /// must not dispatch while [`Router::is_awaiting`].
    pub fn dispatch<L: Luminaire + ?Sized>(
        &mut self,
        cmd: Command,
        desk: &mut L,
        now: Instant,
    ) -> Dispatch {
        if let Some(target) = cmd.target() {
            if target != self.me && !self.peers.contains(target) {
                return Dispatch::Done(ConsoleError::UnknownDesk(target).into());
            }
        }
        match cmd {
            Command::Reset => {
                self.streams = StreamFlags::default();
                desk.set_manual_mode(false);
                tracing::info!(node = %self.me, "router: reset");
                Dispatch::Done(Reply::Ack { note: None })
            }
            Command::Get { field, target } if target == self.me => Dispatch::Done(Reply::Value {
                field,
                desk: self.me,
                value: read_field(desk, field, self.uptime(now)),
            }),
            Command::Get { field, target } => {
                self.await_reply(target, Expect::Value(field), now);
                Dispatch::Forward(Message::Get { to: target, field })
            }
            Command::History { series, target } if target == self.me => {
                Dispatch::Done(Reply::History {
                    series,
                    desk: self.me,
                    samples: desk.history(series),
                })
            }
            Command::History { .. } => Dispatch::Done(ConsoleError::RemoteHistory.into()),
            Command::Set {
                field,
                target,
                value,
            } if target == self.me => match write_field(desk, field, value) {
                Ok(note) => Dispatch::Done(Reply::Ack { note }),
                Err(code) => Dispatch::Done(
                    ConsoleError::Invalid {
                        field: field.code(),
                        code,
                    }
                    .into(),
                ),
            },
            Command::Set {
                field,
                target,
                value,
            } => {
                let note = (field == Field::Duty && value == Value::Float(DUTY_RELEASE))
                    .then_some("manual mode disabled");
                self.await_reply(target, Expect::Ack { field, note }, now);
                Dispatch::Forward(Message::Set {
                    to: target,
                    field,
                    value,
                })
            }
            Command::Stream {
                start,
                stream,
                target,
            } if target == self.me => {
                self.streams.set(stream, start);
                Dispatch::Done(Reply::Ack { note: None })
            }
            Command::Stream { .. } => Dispatch::Done(ConsoleError::RemoteStream.into()),
        }
    }

    fn await_reply(&mut self, responder: NodeAddress, expect: Expect, now: Instant) {
        self.pending = Some(PendingRequest {
            responder,
            expect,
            deadline: now + self.request_timeout,
        });
    }

    /// The forwarded request never left: drop it and report.
    pub fn cancel_pending(&mut self) -> Option<Reply> {
        let pending = self.pending.take()?;
        Some(ConsoleError::SendFailed(pending.responder).into())
    }

    /// Expire the pending request once its deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Option<Reply> {
        match &self.pending {
            Some(p) if now >= p.deadline => {
                let desk = p.responder;
                self.pending = None;
                tracing::warn!(node = %self.me, %desk, "router: request timed out");
                Some(ConsoleError::Timeout(desk).into())
            }
            _ => None,
        }
    }

    /// Handle a decoded frame. Frames addressed elsewhere, and replies nobody waits for,
    /// are dropped.
    pub fn on_message<L: Luminaire + ?Sized>(
        &mut self,
        from: NodeAddress,
        msg: Message,
        desk: &mut L,
        now: Instant,
    ) -> Vec<RouterAction> {
        if msg.destination() != Some(self.me) {
            tracing::trace!(node = %self.me, %from, ?msg, "router: not for me");
            return Vec::new();
        }
        let mut out = Vec::new();
        match msg {
            Message::Get { field, .. } => {
                let value = read_field(desk, field, self.uptime(now));
                out.push(RouterAction::Send(Message::Value {
                    to: from,
                    field,
                    value,
                }));
            }
            Message::Set { field, value, .. } => {
                let reply = match write_field(desk, field, value) {
                    Ok(_) => Message::Ack { to: from },
                    Err(code) => Message::Error { to: from, code },
                };
                out.push(RouterAction::Send(reply));
            }
            Message::Value { field, value, .. } => {
                if self.take_pending(from, |e| e == Expect::Value(field)).is_some() {
                    out.push(RouterAction::Print(Reply::Value {
                        field,
                        desk: from,
                        value,
                    }));
                }
            }
            Message::Ack { .. } => {
                if let Some(Expect::Ack { note, .. }) =
                    self.take_pending(from, |e| matches!(e, Expect::Ack { .. }))
                {
                    out.push(RouterAction::Print(Reply::Ack { note }));
                }
            }
            Message::Error { code, .. } => {
                if let Some(expect) = self.take_pending(from, |_| true) {
                    let field = match expect {
                        Expect::Value(f) | Expect::Ack { field: f, .. } => f,
                    };
                    out.push(RouterAction::Print(
                        ConsoleError::Rejected {
                            desk: from,
                            field: field.code(),
                            code,
                        }
                        .into(),
                    ));
                }
            }
            _ => {}
        }
        out
    }

    fn take_pending(
        &mut self,
        from: NodeAddress,
        accept: impl Fn(Expect) -> bool,
    ) -> Option<Expect> {
        match &self.pending {
            Some(p) if p.responder == from && accept(p.expect) => {
                self.pending.take().map(|p| p.expect)
            }
            _ => {
                tracing::trace!(node = %self.me, %from, "router: unsolicited reply dropped");
                None
            }
        }
    }

    pub fn streaming(&self) -> bool {
        self.streams.any()
    }

    /// Current samples for every active stream.
    pub fn stream_lines<L: Luminaire + ?Sized>(&self, desk: &L, now: Instant) -> Vec<Reply> {
        let millis = self.uptime(now).as_millis() as u64;
        let sample = |stream: Stream, values: Vec<f32>| Reply::Stream {
            stream,
            desk: self.me,
            values,
            millis,
        };
        if self.streams.all() {
            return vec![sample(
                Stream::All,
                vec![
                    desk.duty_cycle(),
                    desk.lux(),
                    desk.reference(),
                    desk.ldr_voltage(),
                ],
            )];
        }
        let mut out = Vec::new();
        if self.streams.duty {
            out.push(sample(Stream::Duty, vec![desk.duty_cycle()]));
        }
        if self.streams.lux {
            out.push(sample(Stream::Illuminance, vec![desk.lux()]));
        }
        if self.streams.reference {
            out.push(sample(Stream::Reference, vec![desk.reference()]));
        }
        if self.streams.voltage {
            out.push(sample(Stream::Voltage, vec![desk.ldr_voltage()]));
        }
        out
    }
}
