//! Server configuration module
//!
//! Parses and manages server configuration from YAML files.
//! `validate` rejects values the rest of the server cannot work with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::game::{Location, Tick};

/// Maximum number of blacklist entries accepted from the config file
pub const BLACKLIST_MAX: usize = 4096;

/// Main server configuration
///
/// Every field carries a default, so an empty document is a valid local setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listeners
    // ============================================
    /// Address the login service binds to
    #[serde(default = "default_bind_ip")]
    pub login_ip: String,

    #[serde(default = "default_login_port")]
    pub login_port: u16,

    /// Address the game service binds to
    #[serde(default = "default_bind_ip")]
    pub game_bind_ip: String,

    /// Game server address advertised to clients in the connect packet
    #[serde(default = "default_game_ip")]
    pub game_ip: String,

    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Shard name shown in the server list
    #[serde(default = "default_server_name")]
    pub server_name: String,

    // ============================================
    // World clock and queues
    // ============================================
    /// Logical ticks per wall-clock second
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u64,

    /// Depth of the session -> world request queue
    #[serde(default = "default_request_queue_depth")]
    pub request_queue_depth: usize,

    /// Depth of each session's outbound packet queue
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// Write-loop forced flush interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    // ============================================
    // Timeouts
    // ============================================
    /// Idle limit before a character is in the world
    #[serde(default = "default_login_idle_secs")]
    pub login_idle_secs: u64,

    /// Idle limit while playing
    #[serde(default = "default_game_idle_secs")]
    pub game_idle_secs: u64,

    /// Wall-clock socket read deadline (hard backstop)
    #[serde(default = "default_socket_read_timeout_secs")]
    pub socket_read_timeout_secs: u64,

    /// Targeting cursor lifetime
    #[serde(default = "default_target_timeout_secs")]
    pub target_timeout_secs: u64,

    /// Grace period before a logged-out character leaves the world
    #[serde(default = "default_logout_grace_secs")]
    pub logout_grace_secs: u64,

    /// Minimum delay between rate-limited actions (double-click, lift)
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,

    // ============================================
    // Persistence
    // ============================================
    /// Periodic save interval in seconds, 0 disables
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    #[serde(default = "default_save_dir")]
    pub save_dir: String,

    /// First account created on a fresh world becomes superuser
    #[serde(default = "default_true")]
    pub provision_superuser: bool,

    // ============================================
    // Map
    // ============================================
    #[serde(default = "default_map_width")]
    pub map_width: u16,

    #[serde(default = "default_map_height")]
    pub map_height: u16,

    /// Visual update range in tiles
    #[serde(default = "default_view_range")]
    pub view_range: u16,

    /// Where new characters enter the world
    #[serde(default = "default_start_location")]
    pub start_location: Location,

    /// Ground items older than this many seconds decay, 0 disables
    #[serde(default = "default_decay_secs")]
    pub decay_secs: u64,

    /// Optional YAML file with additional object templates
    #[serde(default)]
    pub templates_file: Option<String>,

    // ============================================
    // Access control
    // ============================================
    /// IP masks refused at accept ("a.b.c.d", "a.b.c.d/24", "all")
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Connections allowed per IP per throttle window, 0 disables
    #[serde(default)]
    pub throttle_limit: u32,

    /// Throttle window length
    #[serde(default = "default_throttle_window_secs")]
    pub throttle_window_secs: u64,
}

// Default value functions for serde

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_login_port() -> u16 {
    7775
}

fn default_game_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_game_port() -> u16 {
    7776
}

fn default_server_name() -> String {
    "uod".to_string()
}

fn default_ticks_per_second() -> u64 {
    10
}

fn default_request_queue_depth() -> usize {
    16 * 1024
}

fn default_outbound_queue_depth() -> usize {
    1024
}

fn default_flush_interval_ms() -> u64 {
    25
}

fn default_login_idle_secs() -> u64 {
    60
}

fn default_game_idle_secs() -> u64 {
    15 * 60
}

fn default_socket_read_timeout_secs() -> u64 {
    20 * 60
}

fn default_target_timeout_secs() -> u64 {
    30
}

fn default_logout_grace_secs() -> u64 {
    10
}

fn default_action_delay_ms() -> u64 {
    500
}

fn default_save_interval_secs() -> u64 {
    15 * 60
}

fn default_save_dir() -> String {
    "./saves/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_map_width() -> u16 {
    6144
}

fn default_map_height() -> u16 {
    4096
}

fn default_view_range() -> u16 {
    18
}

fn default_start_location() -> Location {
    Location::new(1475, 1645, 20)
}

fn default_decay_secs() -> u64 {
    60 * 60
}

fn default_throttle_window_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            login_ip: default_bind_ip(),
            login_port: default_login_port(),
            game_bind_ip: default_bind_ip(),
            game_ip: default_game_ip(),
            game_port: default_game_port(),
            server_name: default_server_name(),
            ticks_per_second: default_ticks_per_second(),
            request_queue_depth: default_request_queue_depth(),
            outbound_queue_depth: default_outbound_queue_depth(),
            flush_interval_ms: default_flush_interval_ms(),
            login_idle_secs: default_login_idle_secs(),
            game_idle_secs: default_game_idle_secs(),
            socket_read_timeout_secs: default_socket_read_timeout_secs(),
            target_timeout_secs: default_target_timeout_secs(),
            logout_grace_secs: default_logout_grace_secs(),
            action_delay_ms: default_action_delay_ms(),
            save_interval_secs: default_save_interval_secs(),
            save_dir: default_save_dir(),
            provision_superuser: true,
            map_width: default_map_width(),
            map_height: default_map_height(),
            view_range: default_view_range(),
            start_location: default_start_location(),
            decay_secs: default_decay_secs(),
            templates_file: None,
            blacklist: Vec::new(),
            throttle_limit: 0,
            throttle_window_secs: default_throttle_window_secs(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use uod::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/uod.yaml")
    ///     .expect("Failed to load config");
    /// println!("game port: {}", config.game_port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.login_ip.is_empty(), "login_ip cannot be empty");
        anyhow::ensure!(!self.game_bind_ip.is_empty(), "game_bind_ip cannot be empty");
        anyhow::ensure!(!self.server_name.is_empty(), "server_name cannot be empty");
        self.game_ip
            .parse::<Ipv4Addr>()
            .with_context(|| format!("game_ip must be an IPv4 address: {}", self.game_ip))?;

        anyhow::ensure!(
            (1..=1000).contains(&self.ticks_per_second),
            "ticks_per_second out of range: {} (1..=1000)",
            self.ticks_per_second
        );
        anyhow::ensure!(self.request_queue_depth > 0, "request_queue_depth must be positive");
        anyhow::ensure!(self.outbound_queue_depth > 0, "outbound_queue_depth must be positive");
        anyhow::ensure!(self.flush_interval_ms > 0, "flush_interval_ms must be positive");
        anyhow::ensure!(
            self.login_idle_secs > 0 && self.game_idle_secs > 0,
            "idle timeouts must be positive"
        );
        anyhow::ensure!(!self.save_dir.is_empty(), "save_dir cannot be empty");
        anyhow::ensure!(
            self.throttle_window_secs > 0,
            "throttle_window_secs must be positive"
        );

        anyhow::ensure!(
            self.map_width > 0 && self.map_height > 0,
            "map dimensions must be positive"
        );
        anyhow::ensure!(
            self.start_location.x >= 0
                && self.start_location.y >= 0
                && (self.start_location.x as u16) < self.map_width
                && (self.start_location.y as u16) < self.map_height,
            "start_location {} is outside the map",
            self.start_location
        );

        anyhow::ensure!(
            self.blacklist.len() <= BLACKLIST_MAX,
            "Too many blacklist entries: {} (max {})",
            self.blacklist.len(),
            BLACKLIST_MAX
        );
        for entry in &self.blacklist {
            anyhow::ensure!(
                crate::network::acl::parse_ipmask(entry).is_some(),
                "Invalid blacklist entry: {}",
                entry
            );
        }

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Converts a duration in seconds to logical ticks
    pub fn ticks(&self, secs: u64) -> Tick {
        secs.saturating_mul(self.ticks_per_second)
    }

    /// Converts a duration in milliseconds to logical ticks, rounding up
    pub fn ticks_ms(&self, ms: u64) -> Tick {
        (ms.saturating_mul(self.ticks_per_second) + 999) / 1000
    }

    /// Wall-clock length of one logical tick
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.ticks_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServerConfig::from_str("{}").unwrap();

        assert_eq!(config.login_port, 7775);
        assert_eq!(config.game_port, 7776);
        assert_eq!(config.ticks_per_second, 10);
        assert_eq!(config.request_queue_depth, 16 * 1024);
        assert_eq!(config.outbound_queue_depth, 1024);
        assert_eq!(config.view_range, 18);
        assert!(config.provision_superuser);
        assert!(config.templates_file.is_none());
    }

    #[test]
    fn test_custom_ports() {
        let config = ServerConfig::from_str(
            r#"
login_port: 2593
game_port: 2594
game_ip: "10.0.0.5"
"#,
        )
        .unwrap();
        assert_eq!(config.login_port, 2593);
        assert_eq!(config.game_port, 2594);
        assert_eq!(config.game_ip, "10.0.0.5");
    }

    #[test]
    fn test_start_location() {
        let config = ServerConfig::from_str(
            r#"
start_location:
  x: 100
  y: 200
  z: -5
"#,
        )
        .unwrap();
        assert_eq!(config.start_location, Location::new(100, 200, -5));
    }

    #[test]
    fn test_start_location_outside_map() {
        let result = ServerConfig::from_str(
            r#"
map_width: 100
map_height: 100
start_location:
  x: 150
  y: 10
  z: 0
"#,
        );
        let err_msg = format!("{}", result.unwrap_err());
        assert!(err_msg.contains("start_location"));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ServerConfig::from_str("login_port: [this is not valid yaml\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_type() {
        let result = ServerConfig::from_str("game_port: \"not_a_number\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_game_ip_must_be_ipv4() {
        let result = ServerConfig::from_str("game_ip: \"localhost\"\n");
        let err_msg = format!("{}", result.unwrap_err());
        assert!(err_msg.contains("game_ip"));
    }

    #[test]
    fn test_ticks_per_second_range() {
        assert!(ServerConfig::from_str("ticks_per_second: 0\n").is_err());
        assert!(ServerConfig::from_str("ticks_per_second: 5000\n").is_err());
    }

    #[test]
    fn test_blacklist_entries_validated() {
        let ok = ServerConfig::from_str("blacklist:\n  - 10.0.0.0/8\n  - 192.168.1.7\n").unwrap();
        assert_eq!(ok.blacklist.len(), 2);

        let err = ServerConfig::from_str("blacklist:\n  - 10.0.0.0/99\n").unwrap_err();
        assert!(format!("{}", err).contains("Invalid blacklist entry"));
    }

    #[test]
    fn test_tick_conversions() {
        let config = ServerConfig::default();
        assert_eq!(config.ticks(3), 30);
        assert_eq!(config.ticks_ms(500), 5);
        assert_eq!(config.ticks_ms(1), 1);
        assert_eq!(config.tick_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_save_and_load() {
        let mut config = ServerConfig::default();
        config.server_name = "Test Shard".to_string();
        config.blacklist = vec!["10.1.2.3".to_string()];

        let temp_file = std::env::temp_dir().join(format!(
            "uod_test_save_config_{}.yaml",
            std::process::id()
        ));

        config.save(&temp_file).unwrap();
        let loaded = ServerConfig::from_file(&temp_file).unwrap();

        assert_eq!(config.server_name, loaded.server_name);
        assert_eq!(config.blacklist, loaded.blacklist);
        assert_eq!(config.start_location, loaded.start_location);

        std::fs::remove_file(temp_file).ok();
    }
}
