use crate::prelude::*;

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,

    #[serde(default = "Config::default_poll")]
    pub poll: Poll,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    pub host: String,
    pub local_ip: String,
    pub model: String,

    #[serde(default = "Config::default_local_port")]
    pub local_port: u16,
    #[serde(default = "Config::default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "Config::default_unit_id")]
    pub unit_id: u8,

    #[serde(default = "Config::default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    #[serde(default = "Config::default_command_timeout_secs")]
    pub command_timeout_secs: f64,
    #[serde(default = "Config::default_retries")]
    pub retries: u32,
    #[serde(default = "Config::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "Config::default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default = "Config::default_max_frame_errors")]
    pub max_frame_errors: u32,

    pub use_tcp_nodelay: Option<bool>,
}
impl Inverter {
    /// Defaults for everything but the three required keys.
    pub fn new(host: &str, local_ip: &str, model: &str) -> Self {
        Self {
            host: host.to_string(),
            local_ip: local_ip.to_string(),
            model: model.to_string(),
            local_port: Config::default_local_port(),
            discovery_port: Config::default_discovery_port(),
            unit_id: Config::default_unit_id(),
            connect_timeout_secs: Config::default_connect_timeout_secs(),
            command_timeout_secs: Config::default_command_timeout_secs(),
            retries: Config::default_retries(),
            retry_backoff_ms: Config::default_retry_backoff_ms(),
            pacing_ms: Config::default_pacing_ms(),
            max_frame_errors: Config::default_max_frame_errors(),
            use_tcp_nodelay: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    // validate() rejects anything that does not fit a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connect_timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.command_timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn max_frame_errors(&self) -> u32 {
        self.max_frame_errors
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }
} // }}}

// Poll {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Poll {
    #[serde(default = "Config::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "Config::default_update_timeout_secs")]
    pub update_timeout_secs: u64,
    #[serde(default = "Config::default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}
impl Poll {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    /// Logged once the logger exists, which needs `loglevel` from here first.
    pub fn print_summary(&self) {
        let inv = &self.inverter;
        info!("Configuration loaded successfully:");
        info!("  Inverter:");
        info!("    Host: {}", inv.host);
        info!("    Model: {}", inv.model);
        info!("    Unit ID: {}", inv.unit_id);
        info!("    Listen: {}:{}", inv.local_ip, inv.local_port);
        info!("    Discovery Port: {}", inv.discovery_port);
        info!("    Connect Timeout: {}s", inv.connect_timeout_secs);
        info!("    Command Timeout: {}s", inv.command_timeout_secs);
        info!("    Retries: {} ({}ms apart)", inv.retries, inv.retry_backoff_ms);
        info!("    Pacing: {}ms", inv.pacing_ms);
        info!("    Max Frame Errors: {}", inv.max_frame_errors);
        info!("    TCP NoDelay: {}", inv.use_tcp_nodelay());
        info!("  Poll:");
        info!("    Interval: {}s", self.poll.interval_secs);
        info!("    Update Timeout: {}s", self.poll.update_timeout_secs);
        info!(
            "    Max Consecutive Failures: {}",
            self.poll.max_consecutive_failures
        );
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn inverter(&self) -> &Inverter {
        &self.inverter
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    fn validate(&self) -> Result<()> {
        let inv = &self.inverter;

        if inv.host.is_empty() {
            return Err(anyhow!("config.rs:inverter.host cannot be empty"));
        }
        if inv.local_ip.is_empty() {
            return Err(anyhow!("config.rs:inverter.local_ip cannot be empty"));
        }
        if let Err(e) = inv.host.parse::<IpAddr>() {
            return Err(anyhow!("config.rs:invalid inverter.host {}: {}", inv.host, e));
        }
        if let Err(e) = inv.local_ip.parse::<IpAddr>() {
            return Err(anyhow!(
                "config.rs:invalid inverter.local_ip {}: {}",
                inv.local_ip,
                e
            ));
        }
        if let Err(e) = inv.model.parse::<inverter::ModelId>() {
            return Err(anyhow!("config.rs:{}", e));
        }
        if inv.discovery_port == 0 {
            return Err(anyhow!(
                "config.rs:inverter.discovery_port must be between 1 and 65535"
            ));
        }
        for (name, secs) in [
            ("connect_timeout_secs", inv.connect_timeout_secs),
            ("command_timeout_secs", inv.command_timeout_secs),
        ] {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(anyhow!("config.rs:Invalid inverter.{}: {}", name, secs));
            }
        }
        if inv.retries == 0 {
            return Err(anyhow!("config.rs:inverter.retries must be at least 1"));
        }
        if inv.max_frame_errors == 0 {
            return Err(anyhow!("config.rs:inverter.max_frame_errors must be at least 1"));
        }

        if self.poll.interval_secs == 0 {
            return Err(anyhow!("config.rs:Invalid poll.interval_secs: 0"));
        }
        if self.poll.update_timeout_secs == 0 {
            return Err(anyhow!("config.rs:Invalid poll.update_timeout_secs: 0"));
        }
        if self.poll.max_consecutive_failures == 0 {
            return Err(anyhow!(
                "config.rs:poll.max_consecutive_failures must be at least 1"
            ));
        }

        Ok(())
    }

    fn default_poll() -> Poll {
        Poll {
            interval_secs: Self::default_interval_secs(),
            update_timeout_secs: Self::default_update_timeout_secs(),
            max_consecutive_failures: Self::default_max_consecutive_failures(),
        }
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_local_port() -> u16 {
        8899
    }

    fn default_discovery_port() -> u16 {
        58899
    }

    fn default_unit_id() -> u8 {
        inverter::frame::DEFAULT_UNIT_ID
    }

    fn default_connect_timeout_secs() -> f64 {
        15.0
    }

    fn default_command_timeout_secs() -> f64 {
        5.0
    }

    fn default_retries() -> u32 {
        5
    }

    fn default_retry_backoff_ms() -> u64 {
        1000
    }

    fn default_pacing_ms() -> u64 {
        50
    }

    fn default_max_frame_errors() -> u32 {
        3
    }

    fn default_interval_secs() -> u64 {
        30
    }

    fn default_update_timeout_secs() -> u64 {
        30
    }

    fn default_max_consecutive_failures() -> u32 {
        5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() -> Result<()> {
        let config = Config::from_yaml(
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: ISOLAR_SMG_II_11K\n",
        )?;

        let inv = config.inverter();
        assert_eq!(inv.local_port(), 8899);
        assert_eq!(inv.discovery_port(), 58899);
        assert_eq!(inv.unit_id(), 1);
        assert_eq!(inv.connect_timeout(), Duration::from_secs(15));
        assert_eq!(inv.command_timeout(), Duration::from_secs(5));
        assert_eq!(inv.retries(), 5);
        assert_eq!(inv.retry_backoff(), Duration::from_millis(1000));
        assert_eq!(inv.pacing(), Duration::from_millis(50));
        assert_eq!(inv.max_frame_errors(), 3);
        assert!(inv.use_tcp_nodelay());
        assert_eq!(config.poll().interval(), Duration::from_secs(30));
        assert_eq!(config.poll().update_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll().max_consecutive_failures(), 5);
        assert_eq!(config.loglevel(), "info");
        Ok(())
    }

    #[test]
    fn rejects_unknown_model() {
        let err = Config::from_yaml(
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: SMG_X\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("SMG_X"));
    }

    #[test]
    fn rejects_bad_addresses_and_zero_timeouts() {
        for yaml in [
            "inverter:\n  host: ''\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n",
            "inverter:\n  host: inverter.lan\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n",
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n  command_timeout_secs: 0\n",
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n  retries: 0\n",
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\npoll:\n  interval_secs: 0\n",
        ] {
            assert!(Config::from_yaml(yaml).is_err(), "accepted {:?}", yaml);
        }
    }

    #[test]
    fn rejects_timeouts_too_large_for_a_duration() {
        for value in ["1e300", ".inf", ".nan"] {
            let yaml = format!(
                "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n  connect_timeout_secs: {}\n",
                value
            );
            let err = Config::from_yaml(&yaml).unwrap_err();
            assert!(
                err.to_string().starts_with("config.rs:Invalid inverter.connect_timeout_secs"),
                "{}",
                err
            );
        }
    }

    #[test]
    fn zero_discovery_port_message_names_the_file() {
        let err = Config::from_yaml(
            "inverter:\n  host: 192.168.1.50\n  local_ip: 192.168.1.10\n  model: EASUN_SMW\n  discovery_port: 0\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "config.rs:inverter.discovery_port must be between 1 and 65535"
        );
    }
}
