#![allow(dead_code)]

use std::time::{Duration, Instant};

use luxnet_core::{Config, MemoryBus, MemoryDesk, MemoryMedium, Node, NodeAddress, Reply};

static INIT: std::sync::Once = std::sync::Once::new();

pub fn init_logs() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("warn".parse().unwrap()),
            )
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}

pub fn addr(n: u8) -> NodeAddress {
    NodeAddress::new(n).unwrap()
}

/// Short timings so a full boot and calibration fits in a few simulated seconds.
pub fn fast_config() -> Config {
    Config {
        boot_timeout_ms: 100,
        boot_send_interval_ms: 40,
        measurement_time_ms: 20,
        resend_interval_ms: 10,
        calibration_timeout_ms: 5_000,
        request_timeout_ms: 100,
        ..Config::default()
    }
}

/// Several desks on one in-memory bus, sharing a room: each desk's lux is the background
/// plus the coupled contribution of every LED.
pub struct Room {
    pub medium: MemoryMedium,
    pub nodes: Vec<Node<MemoryBus, MemoryDesk>>,
    /// `coupling[i][j]`: lux at desk `i` per unit duty of desk `j`.
    pub coupling: Vec<Vec<f32>>,
    pub background: f32,
    pub now: Instant,
}

impl Room {
    pub fn new(ids: &[u8], coupling: Vec<Vec<f32>>, background: f32, config: Config) -> Room {
        let medium = MemoryMedium::new();
        let now = Instant::now();
        let nodes = ids
            .iter()
            .map(|id| {
                Node::new(
                    addr(*id),
                    medium.endpoint(),
                    MemoryDesk::default(),
                    config.clone(),
                    now,
                )
            })
            .collect();
        let mut room = Room {
            medium,
            nodes,
            coupling,
            background,
            now,
        };
        room.settle_light();
        room
    }

    pub fn settle_light(&mut self) {
        let duties: Vec<f32> = self.nodes.iter().map(|n| n.desk().duty).collect();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            let coupled: f32 = self.coupling[i]
                .iter()
                .zip(&duties)
                .map(|(k, d)| k * d)
                .sum();
            node.desk_mut().lux = self.background + coupled;
        }
    }

    /// Poll every node once at the current time, then advance the clock.
    pub fn round(&mut self, step: Duration) -> Vec<Vec<Reply>> {
        let now = self.now;
        let out = self.nodes.iter_mut().map(|n| n.poll(now)).collect();
        self.settle_light();
        self.now += step;
        out
    }

    /// Run rounds until `done` holds or `limit` of simulated time passes. Returns whether
    /// `done` was reached.
    pub fn run_until(
        &mut self,
        step: Duration,
        limit: Duration,
        mut done: impl FnMut(&Room) -> bool,
    ) -> bool {
        let end = self.now + limit;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.round(step);
        }
        done(self)
    }
}
