//! Configuration loading for the real-time driver

use crate::{Result, URError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Real-time client interface port (125 Hz telemetry + script input)
pub const UR_REALTIME_PORT: u16 = 30003;
/// Dashboard server port
pub const UR_DASHBOARD_PORT: u16 = 29999;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub robot: RobotConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Rate the host is expected to call `run_cycle` at
    #[serde(default = "default_cycle_rate_hz")]
    pub cycle_rate_hz: f64,
    /// Read timeout for a single cycle
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Connect timeout; clamped to one cycle period
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    /// movej acceleration (rad/s^2)
    #[serde(default = "default_joint_acceleration")]
    pub joint_acceleration: f64,
    /// movej speed (rad/s)
    #[serde(default = "default_joint_speed")]
    pub joint_speed: f64,
    /// movel acceleration (m/s^2)
    #[serde(default = "default_tool_acceleration")]
    pub tool_acceleration: f64,
    /// movel speed (m/s)
    #[serde(default = "default_tool_speed")]
    pub tool_speed: f64,
    /// speedj acceleration (rad/s^2)
    #[serde(default = "default_joint_velocity_acceleration")]
    pub joint_velocity_acceleration: f64,
    /// speedl acceleration (m/s^2)
    #[serde(default = "default_tool_velocity_acceleration")]
    pub tool_velocity_acceleration: f64,
    /// stopj deceleration (rad/s^2)
    #[serde(default = "default_joint_stop_deceleration")]
    pub joint_stop_deceleration: f64,
    /// stopl deceleration (m/s^2)
    #[serde(default = "default_tool_stop_deceleration")]
    pub tool_stop_deceleration: f64,
    /// Velocity commands not refreshed within this window are stopped
    #[serde(default = "default_velocity_keepalive_ms")]
    pub velocity_keepalive_ms: u64,
    /// Minimum time a position move counts as in flight
    #[serde(default = "default_position_settle_ms")]
    pub position_settle_ms: u64,
    /// Decimal places used when formatting script arguments
    #[serde(default = "default_command_precision")]
    pub command_precision: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishingConfig {
    pub pub_rate_hz: u32,
    pub decimal_places: Option<u32>,
    /// "dynamic" prints only on change, anything else prints every period
    pub stream_robot_state: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    UR_REALTIME_PORT
}
fn default_dashboard_port() -> u16 {
    UR_DASHBOARD_PORT
}
fn default_cycle_rate_hz() -> f64 {
    125.0
}
fn default_receive_timeout_ms() -> u64 {
    8
}
fn default_connect_timeout_ms() -> u64 {
    8
}
fn default_joint_acceleration() -> f64 {
    1.4
}
fn default_joint_speed() -> f64 {
    1.05
}
fn default_tool_acceleration() -> f64 {
    1.2
}
fn default_tool_speed() -> f64 {
    0.25
}
fn default_joint_velocity_acceleration() -> f64 {
    2.0
}
fn default_tool_velocity_acceleration() -> f64 {
    1.0
}
fn default_joint_stop_deceleration() -> f64 {
    2.0
}
fn default_tool_stop_deceleration() -> f64 {
    1.0
}
fn default_velocity_keepalive_ms() -> u64 {
    200
}
fn default_position_settle_ms() -> u64 {
    100
}
fn default_command_precision() -> usize {
    6
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dashboard_port: default_dashboard_port(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cycle_rate_hz: default_cycle_rate_hz(),
            receive_timeout_ms: default_receive_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            joint_acceleration: default_joint_acceleration(),
            joint_speed: default_joint_speed(),
            tool_acceleration: default_tool_acceleration(),
            tool_speed: default_tool_speed(),
            joint_velocity_acceleration: default_joint_velocity_acceleration(),
            tool_velocity_acceleration: default_tool_velocity_acceleration(),
            joint_stop_deceleration: default_joint_stop_deceleration(),
            tool_stop_deceleration: default_tool_stop_deceleration(),
            velocity_keepalive_ms: default_velocity_keepalive_ms(),
            position_settle_ms: default_position_settle_ms(),
            command_precision: default_command_precision(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            pub_rate_hz: 10,
            decimal_places: Some(4),
            stream_robot_state: "dynamic".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| URError::Config(format!("Failed to read {}: {}", config_path, e)))?;

        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration pointed at `host`
    pub fn for_host(host: &str) -> Self {
        let mut config = Config::default();
        config.robot.host = host.to_string();
        config
    }

    /// Reject values the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(URError::Config("robot.host must not be empty".to_string()));
        }
        if !(self.timing.cycle_rate_hz.is_finite() && self.timing.cycle_rate_hz > 0.0) {
            return Err(URError::Config(format!(
                "timing.cycle_rate_hz must be positive, got {}",
                self.timing.cycle_rate_hz
            )));
        }
        if self.motion.velocity_keepalive_ms == 0 {
            return Err(URError::Config("motion.velocity_keepalive_ms must be non-zero".to_string()));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(URError::Config(format!(
                "reconnect.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.reconnect.initial_backoff_ms, self.reconnect.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Resolve `host:port` to the first address it names.
///
/// A hostname costs a DNS lookup with no time limit, so this runs when the
/// driver is built or reconfigured, never inside a cycle.
pub fn resolve_address(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| URError::Config(format!("Cannot resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| URError::Config(format!("No addresses found for {}:{}", host, port)))
}

impl RobotConfig {
    /// Real-time interface address of the controller
    pub fn realtime_address(&self) -> Result<SocketAddr> {
        resolve_address(&self.host, self.port)
    }
}

impl TimingConfig {
    /// Nominal period between cycles
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.cycle_rate_hz)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    /// Connect timeout, never longer than one cycle
    pub fn connect_budget(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1)).min(self.cycle_period())
    }
}

impl MotionConfig {
    pub fn velocity_keepalive(&self) -> Duration {
        Duration::from_millis(self.velocity_keepalive_ms)
    }

    pub fn position_settle(&self) -> Duration {
        Duration::from_millis(self.position_settle_ms)
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "robot:\n  host: 192.168.1.10\nmotion:\n  velocity_keepalive_ms: 300\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.robot.host, "192.168.1.10");
        assert_eq!(config.robot.port, UR_REALTIME_PORT);
        assert_eq!(config.motion.velocity_keepalive_ms, 300);
        assert_eq!(config.motion.command_precision, 6);
        assert_eq!(config.timing.cycle_rate_hz, 125.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connect_budget_clamped_to_cycle() {
        let mut timing = TimingConfig::default();
        timing.connect_timeout_ms = 2000;
        assert_eq!(timing.connect_budget(), timing.cycle_period());
    }

    #[test]
    fn test_ip_literal_resolves_without_lookup() {
        let config = Config::for_host("192.168.1.100");
        let addr = config.robot.realtime_address().unwrap();
        assert_eq!(addr, "192.168.1.100:30003".parse::<SocketAddr>().unwrap());

        assert!(matches!(resolve_address("no such host!", 30003), Err(URError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = Config::for_host("10.0.0.2");
        config.reconnect.initial_backoff_ms = 10_000;
        assert!(matches!(config.validate(), Err(URError::Config(_))));
    }
}
