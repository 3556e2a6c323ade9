//! Configuration surface: a TOML file with a thin `clap` CLI for pointing
//! at it and overriding the most operationally relevant fields.

use std::{fs::read_to_string, net::SocketAddr, path::PathBuf};

use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Peering {
    /// Peers to dial on startup.
    #[serde(default)]
    pub peers: Vec<std::net::IpAddr>,

    /// UDP+TCP bind address.
    #[serde(default = "Peering::listen")]
    pub listen: SocketAddr,

    /// Inbound UDP packet rate cap; burst is `3 * udp_pps`.
    #[serde(default = "Peering::udp_pps")]
    pub udp_pps: u32,

    /// URL embedded in the TCP banner.
    #[serde(default = "Peering::project_url")]
    pub project_url: String,
}

impl Peering {
    fn listen() -> SocketAddr {
        format!("[::]:{}", protocol::DEFAULT_PORT).parse().unwrap()
    }

    fn udp_pps() -> u32 {
        100
    }

    fn project_url() -> String {
        "https://github.com/splitping/splitping".to_string()
    }
}

impl Default for Peering {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            listen: Self::listen(),
            udp_pps: Self::udp_pps(),
            project_url: Self::project_url(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Clock {
    /// Skip NTP calibration and trust the OS clock outright.
    #[serde(default)]
    pub clock_is_perfect: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Pps {
    /// Enable the hardware PPS ticker instead of the system-clock ticker.
    #[serde(default)]
    pub enabled: bool,

    /// PPS character device path.
    #[serde(default = "Pps::path")]
    pub path: PathBuf,
}

impl Pps {
    fn path() -> PathBuf {
        PathBuf::from("/dev/pps0")
    }
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::path(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Debug {
    /// Verbose logging of ack-ring slot writes.
    #[serde(default)]
    pub show_slots: bool,

    /// Verbose logging of derived stats.
    #[serde(default)]
    pub show_stats: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Metrics {
    /// HTTP bind address for the `/metrics` route.
    #[serde(default = "Metrics::listen")]
    pub listen: SocketAddr,

    /// Path the gauge registry is served on.
    #[serde(default = "Metrics::telemetry_path")]
    pub telemetry_path: String,
}

impl Metrics {
    fn listen() -> SocketAddr {
        "127.0.0.1:9310".parse().unwrap()
    }

    fn telemetry_path() -> String {
        "/metrics".to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            telemetry_path: Self::telemetry_path(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub peering: Peering,
    #[serde(default)]
    pub clock: Clock,
    #[serde(default)]
    pub pps: Pps,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peering: Peering::default(),
            clock: Clock::default(),
            pps: Pps::default(),
            debug: Debug::default(),
            metrics: Metrics::default(),
            log: Log::default(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Path to a TOML config file. Defaults are used for anything it
    /// doesn't set, or if no file is given at all.
    #[arg(long)]
    config: Option<String>,

    /// Comma-separated peer IPs to dial on startup; overrides
    /// `peering.peers` from the config file.
    #[arg(long, value_delimiter = ',')]
    peers: Option<Vec<std::net::IpAddr>>,

    /// UDP+TCP bind address; overrides `peering.listen`.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

impl Config {
    /// Loads the config file named by `--config`, if any, then applies
    /// direct CLI overrides on top, falling back to field defaults for
    /// anything absent.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        let mut config: Config = match &cli.config {
            Some(path) => toml::from_str(&read_to_string(path)?)?,
            None => toml::from_str("")?,
        };

        if let Some(peers) = cli.peers {
            config.peering.peers = peers;
        }
        if let Some(listen) = cli.listen {
            config.peering.listen = listen;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_fills_in_every_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.peering.udp_pps, 100);
        assert_eq!(config.peering.listen, Peering::listen());
        assert!(!config.clock.clock_is_perfect);
        assert!(!config.pps.enabled);
        assert_eq!(config.metrics.telemetry_path, "/metrics");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let toml = r#"
            [peering]
            udp-pps = 250

            [pps]
            enabled = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.peering.udp_pps, 250);
        assert!(config.pps.enabled);
        assert_eq!(config.peering.listen, Peering::listen());
    }

    #[test]
    fn kebab_case_keys_are_accepted_throughout() {
        let toml = r#"
            [clock]
            clock-is-perfect = true

            [debug]
            show-slots = true
            show-stats = true

            [metrics]
            telemetry-path = "/stats"

            [log]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.clock.clock_is_perfect);
        assert!(config.debug.show_slots);
        assert!(config.debug.show_stats);
        assert_eq!(config.metrics.telemetry_path, "/stats");
        assert_eq!(config.log.level.as_level(), log::Level::Debug);
    }
}
