//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use luxnet_core::NodeAddress;
use serde::Deserialize;

/// Interface name that runs every desk in-process on a memory bus.
pub const SIM_INTERFACE: &str = "sim";

/// Daemon configuration. File: ~/.config/luxnet/config.toml or /etc/luxnet/config.toml.
/// Env overrides: LUXNET_INTERFACE, LUXNET_ADDRESS, LUXNET_SERIAL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// SocketCAN interface, or "sim" (default "can0").
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Hardware serial used to look up this desk's address in `desks`.
    #[serde(default)]
    pub serial: Option<String>,
    /// Explicit address; wins over the serial table.
    #[serde(default)]
    pub address: Option<u8>,
    /// Serial number to bus address.
    #[serde(default)]
    pub desks: BTreeMap<String, u8>,
    /// Peers added by hand after boot, e.g. desks that power up late.
    #[serde(default)]
    pub known_peers: Vec<u8>,
    /// Node poll period (default 2 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Console stream period (default 100 ms).
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
    /// Sensor sampling period of the simulated control loop (default 10 ms).
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub plant: PlantConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub timing: luxnet_core::Config,
}

/// Simulated luminaire and room.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantConfig {
    /// Lux with every LED off.
    #[serde(default = "default_background")]
    pub background: f32,
    /// Lux per unit duty of the desk's own LED.
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// LED power at full duty, in watts.
    #[serde(default = "default_max_power")]
    pub max_power: f32,
    /// Integral gain of the simulated controller.
    #[serde(default = "default_ki")]
    pub ki: f32,
    /// Samples kept for `g b`.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// Desks simulated together when `interface = "sim"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default = "default_sim_desks")]
    pub desks: Vec<u8>,
    /// `coupling[i][j]`: lux at desk i per unit duty of desk j. Derived from the plant gain
    /// when empty.
    #[serde(default)]
    pub coupling: Vec<Vec<f32>>,
}

fn default_interface() -> String {
    "can0".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2
}
fn default_stream_interval_ms() -> u64 {
    100
}
fn default_sample_interval_ms() -> u64 {
    10
}
fn default_background() -> f32 {
    5.0
}
fn default_gain() -> f32 {
    60.0
}
fn default_max_power() -> f32 {
    1.0
}
fn default_ki() -> f32 {
    0.5
}
fn default_history_len() -> usize {
    6000
}
fn default_sim_desks() -> Vec<u8> {
    vec![1, 2, 3]
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            background: default_background(),
            gain: default_gain(),
            max_power: default_max_power(),
            ki: default_ki(),
            history_len: default_history_len(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            desks: default_sim_desks(),
            coupling: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            serial: None,
            address: None,
            desks: BTreeMap::new(),
            known_peers: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            stream_interval_ms: default_stream_interval_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            plant: PlantConfig::default(),
            sim: SimConfig::default(),
            timing: luxnet_core::Config::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value} is not valid")]
    BadEnv { var: &'static str, value: String },
    #[error(transparent)]
    Address(#[from] luxnet_core::address::InvalidAddress),
    #[error("no address for this desk: set `address`, or list serial {0:?} under [desks]")]
    NoAddress(Option<String>),
    #[error("sim coupling must be a {0}x{0} matrix")]
    Coupling(usize),
    #[error("calibration duties must satisfy 0 <= low_duty < high_duty <= 1 (got {low} and {high})")]
    DutySteps { low: f32, high: f32 },
}

impl Config {
    /// Reject settings that would break calibration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (low, high) = (self.timing.low_duty, self.timing.high_duty);
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(ConfigError::DutySteps { low, high });
        }
        Ok(())
    }

    pub fn is_sim(&self) -> bool {
        self.interface == SIM_INTERFACE
    }

    /// This desk's bus address: explicit address, then the serial table.
    pub fn resolve_address(&self) -> Result<NodeAddress, ConfigError> {
        if let Some(raw) = self.address {
            return Ok(NodeAddress::try_from(raw)?);
        }
        let serial = self.serial.clone().or_else(machine_serial);
        match serial.as_deref().and_then(|s| self.desks.get(s)) {
            Some(raw) => Ok(NodeAddress::try_from(*raw)?),
            None => Err(ConfigError::NoAddress(serial)),
        }
    }

    pub fn known_peers(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.known_peers
            .iter()
            .map(|raw| NodeAddress::try_from(*raw).map_err(ConfigError::from))
            .collect()
    }

    pub fn sim_desks(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.sim
            .desks
            .iter()
            .map(|raw| NodeAddress::try_from(*raw).map_err(ConfigError::from))
            .collect()
    }

    /// Square coupling matrix for the simulated desks.
    pub fn sim_coupling(&self) -> Result<Vec<Vec<f32>>, ConfigError> {
        let n = self.sim.desks.len();
        if self.sim.coupling.is_empty() {
            let gain = self.plant.gain;
            return Ok((0..n)
                .map(|i| {
                    (0..n)
                        .map(|j| if i == j { gain } else { gain * 0.15 })
                        .collect()
                })
                .collect());
        }
        if self.sim.coupling.len() != n || self.sim.coupling.iter().any(|row| row.len() != n) {
            return Err(ConfigError::Coupling(n));
        }
        Ok(self.sim.coupling.clone())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.validate()?;
    Ok(c)
}

fn apply_env(
    c: &mut Config,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = lookup("LUXNET_INTERFACE") {
        c.interface = s;
    }
    if let Some(s) = lookup("LUXNET_ADDRESS") {
        let raw = s.parse::<u8>().map_err(|_| ConfigError::BadEnv {
            var: "LUXNET_ADDRESS",
            value: s.clone(),
        })?;
        c.address = Some(raw);
    }
    if let Some(s) = lookup("LUXNET_SERIAL") {
        c.serial = Some(s);
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/luxnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/luxnet/config.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => parse_file(&p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Stand-in for a board serial number on a Linux host.
fn machine_serial() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
