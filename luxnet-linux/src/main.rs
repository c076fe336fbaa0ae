// luxnetd: desk luminaire coordination over SocketCAN, or a simulated room of desks.

mod can;
mod config;
mod console;
mod sim;

use std::time::{Duration, Instant};

use anyhow::Context;
use luxnet_core::{MemoryMedium, Node, NodeAddress, Reply};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use crate::can::{LinkBus, SocketCanBus};
use crate::config::{Config, PlantConfig};
use crate::sim::SimDesk;

const VERSION: &str = env!("CARGO_PKG_VERSION");

type DeskNode = Node<LinkBus, SimDesk>;

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("luxnetd {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load()?;

    // MemoryBus endpoints share an Rc'd medium, so everything stays on one thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let now = Instant::now();
    let (mut nodes, console_at) = if cfg.is_sim() {
        sim_room(&cfg, now)?
    } else {
        (vec![can_node(&cfg, now)?], 0)
    };
    for peer in cfg.known_peers()? {
        nodes[console_at].add_peer(peer);
    }
    tracing::info!(
        desk = %nodes[console_at].address(),
        interface = %cfg.interface,
        desks = nodes.len(),
        "luxnetd started"
    );

    let mut lines = console::spawn_stdin();
    let mut stdin_open = true;
    let mut poll = ticker(cfg.poll_interval_ms);
    let mut sample = ticker(cfg.sample_interval_ms);
    let mut stream = ticker(cfg.stream_interval_ms);
    let dt = Duration::from_millis(cfg.sample_interval_ms);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("shutting down");
                return Ok(());
            }
            line = lines.recv(), if stdin_open => match line {
                Some(line) => nodes[console_at].submit_line(line),
                None => stdin_open = false,
            },
            _ = poll.tick() => {
                let now = Instant::now();
                for (i, node) in nodes.iter_mut().enumerate() {
                    let out = node.poll(now);
                    if i == console_at {
                        print_all(&out);
                    } else {
                        for reply in &out {
                            tracing::debug!(desk = %node.address(), %reply, "background desk output");
                        }
                    }
                }
            }
            _ = sample.tick() => {
                for node in nodes.iter_mut() {
                    node.desk_mut().sample(dt);
                }
            }
            _ = stream.tick() => {
                print_all(&nodes[console_at].stream_lines(Instant::now()));
            }
        }
    }
}

fn ticker(ms: u64) -> tokio::time::Interval {
    let mut t = tokio::time::interval(Duration::from_millis(ms.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

fn print_all(replies: &[Reply]) {
    for reply in replies {
        println!("{reply}");
    }
}

fn can_node(cfg: &Config, now: Instant) -> anyhow::Result<DeskNode> {
    let me = cfg.resolve_address()?;
    let bus = SocketCanBus::open(&cfg.interface)
        .with_context(|| format!("opening CAN interface {}", cfg.interface))?;
    let desk = SimDesk::new(cfg.plant.clone());
    Ok(Node::new(me, LinkBus::Can(bus), desk, cfg.timing.clone(), now))
}

/// Every simulated desk on one memory bus, lit through the coupling matrix. Returns the
/// nodes and the index of the one attached to the console.
fn sim_room(cfg: &Config, now: Instant) -> anyhow::Result<(Vec<DeskNode>, usize)> {
    let addrs = cfg.sim_desks()?;
    anyhow::ensure!(!addrs.is_empty(), "sim mode needs at least one desk");
    let coupling = cfg.sim_coupling()?;

    let console_addr = match cfg.address {
        Some(raw) => NodeAddress::try_from(raw)?,
        None => addrs[0],
    };
    let console_at = addrs
        .iter()
        .position(|a| *a == console_addr)
        .with_context(|| format!("desk {console_addr} is not in sim.desks"))?;

    let mut desks: Vec<SimDesk> = coupling
        .iter()
        .enumerate()
        .map(|(i, row)| {
            SimDesk::new(PlantConfig {
                gain: row[i],
                ..cfg.plant.clone()
            })
        })
        .collect();
    let cells: Vec<_> = desks.iter().map(SimDesk::duty_cell).collect();
    for (i, desk) in desks.iter_mut().enumerate() {
        for (j, cell) in cells.iter().enumerate() {
            if i != j {
                desk.couple(coupling[i][j], cell.clone());
            }
        }
    }

    let medium = MemoryMedium::new();
    let nodes = addrs
        .iter()
        .zip(desks)
        .map(|(addr, desk)| {
            let bus = LinkBus::Memory(medium.endpoint());
            Node::new(*addr, bus, desk, cfg.timing.clone(), now)
        })
        .collect();
    Ok((nodes, console_at))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
