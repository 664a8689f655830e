//! Server configuration.
//!
//! Values are resolved in order: command line (or environment), then the
//! TOML config file, then built-in defaults.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::adapter::AdapterSettings;
use crate::decision::{CwndBounds, PolicySpec, MAX_CWND_BYTES, MIN_CWND_BYTES};
use crate::exchange::SnapshotMode;
use crate::session::SessionSettings;
use crate::stats::FirstSample;

pub const DEFAULT_PORT: u16 = 50051;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_STEPS_PER_EPISODE: u64 = 500;

const QUALIFIER: &str = "";
const ORGANIZATION: &str = "Marlin";
const APPLICATION: &str = "marlin";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "marlin-server", version, about)]
pub struct ConfigArgs {
    /// Address to listen on, default is 0.0.0.0
    #[arg(long, env = "MARLIN_ADDRESS")]
    pub address: Option<IpAddr>,

    /// Port of the telemetry RPC endpoint, default is 50051
    #[arg(long, short, env = "MARLIN_PORT")]
    pub port: Option<u16>,

    /// How long the adapter waits for an action before recording a stall.
    #[arg(long, env = "MARLIN_ACTION_TIMEOUT_MS")]
    pub action_timeout_ms: Option<u64>,

    /// How long the decision process waits for telemetry before restarting
    /// an active session.
    #[arg(long, env = "MARLIN_STATE_TIMEOUT_MS")]
    pub state_timeout_ms: Option<u64>,

    /// How long an inbound stream waits for a session to bind to.
    #[arg(long, env = "MARLIN_BIND_TIMEOUT_MS")]
    pub bind_timeout_ms: Option<u64>,

    #[arg(long, value_enum, env = "MARLIN_SNAPSHOT_MODE")]
    pub snapshot_mode: Option<SnapshotMode>,

    /// Expose windowed statistics instead of the latest values.
    #[arg(long, env = "MARLIN_WINDOWED")]
    pub windowed: bool,

    /// Cap on per-observation history in windowed mode.
    #[arg(long, env = "MARLIN_HISTORY_CAPACITY")]
    pub history_capacity: Option<usize>,

    #[arg(long, value_enum, env = "MARLIN_FIRST_SAMPLE")]
    pub first_sample: Option<FirstSample>,

    #[arg(long, env = "MARLIN_MIN_CWND_BYTES")]
    pub min_cwnd_bytes: Option<i64>,

    #[arg(long, env = "MARLIN_MAX_CWND_BYTES")]
    pub max_cwnd_bytes: Option<i64>,

    /// Give up after this many stall restarts.
    #[arg(long, env = "MARLIN_MAX_RESTARTS")]
    pub max_restarts: Option<u32>,

    #[arg(long, env = "MARLIN_MAX_STEPS_PER_EPISODE")]
    pub max_steps_per_episode: Option<u64>,

    /// Stop the decision loop after this many steps in total.
    #[arg(long, env = "MARLIN_MAX_TOTAL_STEPS")]
    pub max_total_steps: Option<u64>,

    /// End an episode once it has run this long.
    #[arg(long, env = "MARLIN_MAX_EPISODE_DURATION_MS")]
    pub max_episode_duration_ms: Option<u64>,

    /// `hold`, `fixed:<bytes>` or `table:<index>`.
    #[arg(long, env = "MARLIN_POLICY")]
    pub policy: Option<PolicySpec>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Config file to read instead of the one in the default config dir.
    #[arg(long, env = "MARLIN_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

impl ConfigArgs {
    /// Merge the arguments over the config file and defaults.
    pub fn build(self) -> anyhow::Result<Config> {
        let mut config = match &self.config_file {
            Some(path) => Config::read_file(path)?,
            None => match default_config_file().filter(|p| p.exists()) {
                Some(path) => Config::read_file(&path)?,
                None => Config::default(),
            },
        };

        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.action_timeout_ms {
            config.action_timeout_ms = ms;
        }
        if let Some(ms) = self.state_timeout_ms {
            config.state_timeout_ms = ms;
        }
        if let Some(ms) = self.bind_timeout_ms {
            config.bind_timeout_ms = ms;
        }
        if let Some(mode) = self.snapshot_mode {
            config.snapshot_mode = mode;
        }
        config.windowed |= self.windowed;
        if self.history_capacity.is_some() {
            config.history_capacity = self.history_capacity;
        }
        if let Some(first_sample) = self.first_sample {
            config.first_sample = first_sample;
        }
        if let Some(min) = self.min_cwnd_bytes {
            config.min_cwnd_bytes = min;
        }
        if let Some(max) = self.max_cwnd_bytes {
            config.max_cwnd_bytes = max;
        }
        if self.max_restarts.is_some() {
            config.max_restarts = self.max_restarts;
        }
        if let Some(steps) = self.max_steps_per_episode {
            config.max_steps_per_episode = steps;
        }
        if self.max_total_steps.is_some() {
            config.max_total_steps = self.max_total_steps;
        }
        if self.max_episode_duration_ms.is_some() {
            config.max_episode_duration_ms = self.max_episode_duration_ms;
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn default_config_file() -> Option<PathBuf> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    pub action_timeout_ms: u64,
    pub state_timeout_ms: u64,
    pub bind_timeout_ms: u64,
    pub snapshot_mode: SnapshotMode,
    pub windowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_capacity: Option<usize>,
    pub first_sample: FirstSample,
    pub min_cwnd_bytes: i64,
    pub max_cwnd_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    pub max_steps_per_episode: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_episode_duration_ms: Option<u64>,
    pub policy: PolicySpec,
    #[serde(with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            action_timeout_ms: DEFAULT_TIMEOUT_MS,
            state_timeout_ms: DEFAULT_TIMEOUT_MS,
            bind_timeout_ms: DEFAULT_TIMEOUT_MS,
            snapshot_mode: SnapshotMode::Latest,
            windowed: false,
            history_capacity: None,
            first_sample: FirstSample::ZeroSentinel,
            min_cwnd_bytes: MIN_CWND_BYTES,
            max_cwnd_bytes: MAX_CWND_BYTES,
            max_restarts: None,
            max_steps_per_episode: DEFAULT_MAX_STEPS_PER_EPISODE,
            max_total_steps: None,
            max_episode_duration_ms: None,
            policy: PolicySpec::Hold,
            log_level: LevelFilter::INFO,
        }
    }
}

impl Config {
    pub fn read_file(path: &Path) -> anyhow::Result<Self> {
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_cwnd_bytes <= 0 {
            anyhow::bail!("min-cwnd-bytes must be positive, got {}", self.min_cwnd_bytes);
        }
        if self.min_cwnd_bytes > self.max_cwnd_bytes {
            anyhow::bail!(
                "min-cwnd-bytes ({}) exceeds max-cwnd-bytes ({})",
                self.min_cwnd_bytes,
                self.max_cwnd_bytes
            );
        }
        if self.max_steps_per_episode == 0 {
            anyhow::bail!("max-steps-per-episode must be at least 1");
        }
        for (name, ms) in [
            ("action-timeout-ms", self.action_timeout_ms),
            ("state-timeout-ms", self.state_timeout_ms),
            ("bind-timeout-ms", self.bind_timeout_ms),
        ] {
            if ms == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.max_episode_duration_ms == Some(0) {
            anyhow::bail!("max-episode-duration-ms must be positive when set");
        }
        if self.history_capacity == Some(0) {
            anyhow::bail!("history-capacity must be positive when set");
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn cwnd_bounds(&self) -> CwndBounds {
        CwndBounds {
            min: self.min_cwnd_bytes,
            max: self.max_cwnd_bytes,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            snapshot_mode: self.snapshot_mode,
            state_timeout: self.state_timeout(),
            windowed: self.windowed,
            history_capacity: self.history_capacity,
            first_sample: self.first_sample,
            bounds: self.cwnd_bounds(),
            max_restarts: self.max_restarts,
            max_steps_per_episode: self.max_steps_per_episode,
            max_total_steps: self.max_total_steps,
            max_episode_duration: self.max_episode_duration_ms.map(Duration::from_millis),
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            first_sample: self.first_sample,
            action_timeout: self.action_timeout(),
            bind_timeout: self.bind_timeout(),
        }
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }
}

/// Install the global subscriber once. Later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn defaults_match_deployed_values() {
        let config = Config::default();
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:50051");
        assert_eq!(config.state_timeout(), Duration::from_secs(30));
        assert_eq!(config.cwnd_bounds(), CwndBounds { min: 1444, max: 25_000 });
        assert_eq!(config.snapshot_mode, SnapshotMode::Latest);
        assert_eq!(config.first_sample, FirstSample::ZeroSentinel);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = 6000
            snapshot-mode = "queue"
            first-sample = "explicit"
            policy = "table:1"
            log-level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.snapshot_mode, SnapshotMode::Queue);
        assert_eq!(config.first_sample, FirstSample::Explicit);
        assert_eq!(config.policy, PolicySpec::Table(1));
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        assert_eq!(config.max_steps_per_episode, DEFAULT_MAX_STEPS_PER_EPISODE);
    }

    #[test]
    fn cli_overrides_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "port = 6000\nmax-restarts = 3\nwindowed = true\nmax-episode-duration-ms = 60000"
        )?;

        let args = ConfigArgs::try_parse_from([
            "marlin-server",
            "--port",
            "7000",
            "--policy",
            "fixed:8000",
            "--config-file",
            file.path().to_str().unwrap(),
        ])?;
        let config = args.build()?;
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_restarts, Some(3));
        assert!(config.windowed);
        assert_eq!(config.policy, PolicySpec::Fixed(8000));
        assert_eq!(
            config.session_settings().max_episode_duration,
            Some(Duration::from_secs(60))
        );
        Ok(())
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config {
            max_total_steps: Some(10),
            policy: PolicySpec::Fixed(3000),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&text).unwrap(), config);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let config = Config {
            min_cwnd_bytes: 30_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            state_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            max_episode_duration_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = ConfigArgs {
            config_file: Some(PathBuf::from("/nonexistent/marlin.toml")),
            ..Default::default()
        };
        assert!(args.build().is_err());
    }
}
