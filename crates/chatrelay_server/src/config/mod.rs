#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use chatrelay_domain::{ChannelSet, IdentityId, IdentityRecord};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::bridge::BridgeRoute;

pub const DEFAULT_PORT: u16 = 57452;
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default config path: `~/.chatrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatrelay").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);
	cfg.server.clamp_capacities();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub filter: FilterSettings,
	pub bridge: BridgeSettings,
	/// Records seeded into the in-memory identity store.
	pub identities: Vec<IdentityRecord>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub bind_host: String,
	pub port: u16,
	/// Outbound frames buffered per connection before it is evicted.
	pub mailbox_capacity: usize,
	pub router_queue_capacity: usize,
	pub bridge_queue_capacity: usize,
	pub max_frame_bytes: usize,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind_host: DEFAULT_BIND_HOST.to_string(),
			port: DEFAULT_PORT,
			mailbox_capacity: 64,
			router_queue_capacity: 256,
			bridge_queue_capacity: 256,
			max_frame_bytes: chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE,
			metrics_bind: None,
			health_bind: None,
		}
	}
}

impl ServerSettings {
	fn clamp_capacities(&mut self) {
		for (name, value) in [
			("mailbox_capacity", &mut self.mailbox_capacity),
			("router_queue_capacity", &mut self.router_queue_capacity),
			("bridge_queue_capacity", &mut self.bridge_queue_capacity),
		] {
			if *value == 0 {
				warn!(setting = name, "capacity of 0 is invalid; using 1");
				*value = 1;
			}
		}

		if self.max_frame_bytes == 0 {
			warn!("max_frame_bytes of 0 is invalid; using default");
			self.max_frame_bytes = chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE;
		} else if self.max_frame_bytes > chatrelay_protocol::MAX_FRAME_SIZE_LIMIT {
			warn!(
				max_frame_bytes = self.max_frame_bytes,
				"max_frame_bytes exceeds the u32 length prefix; clamping"
			);
			self.max_frame_bytes = chatrelay_protocol::MAX_FRAME_SIZE_LIMIT;
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres:, mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
	pub terms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
	pub enabled: bool,
	pub routes: Vec<BridgeRoute>,
}

impl Default for BridgeSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			routes: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	filter: FileFilterSettings,

	#[serde(default)]
	bridge: FileBridgeSettings,

	#[serde(default)]
	identities: Vec<FileIdentity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	port: Option<u16>,
	mailbox_capacity: Option<usize>,
	router_queue_capacity: Option<usize>,
	bridge_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFilterSettings {
	#[serde(default)]
	terms: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBridgeSettings {
	enabled: Option<bool>,

	#[serde(default)]
	channels: Vec<FileBridgeChannel>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileBridgeChannel {
	external_id: String,
	#[serde(default)]
	receive_channels: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileIdentity {
	id: String,
	display_name: Option<String>,
	#[serde(default)]
	receive_channels: Vec<u32>,
	#[serde(default)]
	send_channels: Vec<u32>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();

		let identities = file
			.identities
			.into_iter()
			.map(|i| {
				let id = IdentityId::new(i.id.trim()).context("identities: id must be non-empty")?;
				let mut record = IdentityRecord::new(id);
				record.display_name = i.display_name.unwrap_or_default();
				record.receive_channels = i.receive_channels.into_iter().collect::<ChannelSet>();
				record.send_channels = i.send_channels.into_iter().collect::<ChannelSet>();
				Ok(record)
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let routes = file
			.bridge
			.channels
			.into_iter()
			.filter(|c| !c.external_id.trim().is_empty())
			.map(|c| BridgeRoute {
				external_id: c.external_id.trim().to_string(),
				receive_channels: c.receive_channels.into_iter().collect(),
			})
			.collect();

		Ok(Self {
			server: ServerSettings {
				bind_host: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bind_host),
				port: file.server.port.unwrap_or(defaults.port),
				mailbox_capacity: file.server.mailbox_capacity.unwrap_or(defaults.mailbox_capacity),
				router_queue_capacity: file.server.router_queue_capacity.unwrap_or(defaults.router_queue_capacity),
				bridge_queue_capacity: file.server.bridge_queue_capacity.unwrap_or(defaults.bridge_queue_capacity),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			filter: FilterSettings {
				terms: file.filter.terms,
			},
			bridge: BridgeSettings {
				enabled: file.bridge.enabled.unwrap_or(true),
				routes,
			},
			identities,
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("CHATRELAY_BIND") {
		cfg.server.bind_host = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_PORT")
		&& let Ok(port) = v.parse::<u16>()
	{
		cfg.server.port = port;
		info!(port, "server config: port overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_MAILBOX_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.server.mailbox_capacity = capacity;
		info!(capacity, "server config: mailbox_capacity overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("CHATRELAY_BRIDGE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bridge.enabled = enabled;
		info!(enabled, "bridge: enabled overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write as _;

	use chatrelay_domain::ChannelId;

	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(parse_toml("").expect("parse")).expect("config");
		assert_eq!(cfg.server.port, DEFAULT_PORT);
		assert_eq!(cfg.server.bind_host, DEFAULT_BIND_HOST);
		assert_eq!(cfg.server.mailbox_capacity, 64);
		assert!(cfg.bridge.enabled);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.identities.is_empty());
	}

	#[test]
	fn parses_all_sections() {
		let toml = r#"
			[server]
			port = 6000
			bind = "127.0.0.1"
			mailbox_capacity = 8
			metrics_bind = "  "

			[persistence]
			enabled = true
			database_url = "sqlite://relay.db"

			[filter]
			terms = ["spam", "scam"]

			[bridge]
			enabled = false

			[[bridge.channels]]
			external_id = "1234"
			receive_channels = [1, 2]

			[[identities]]
			id = "tok2"
			receive_channels = [1]
			send_channels = [3]
		"#;

		let cfg = ServerConfig::from_file(parse_toml(toml).expect("parse")).expect("config");
		assert_eq!(cfg.server.port, 6000);
		assert_eq!(cfg.server.bind_host, "127.0.0.1");
		assert_eq!(cfg.server.mailbox_capacity, 8);
		assert_eq!(cfg.server.metrics_bind, None);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://relay.db"));
		assert_eq!(cfg.filter.terms, vec!["spam".to_string(), "scam".to_string()]);
		assert!(!cfg.bridge.enabled);
		assert_eq!(cfg.bridge.routes.len(), 1);
		assert!(cfg.bridge.routes[0].receive_channels.contains(ChannelId(2)));

		let identity = &cfg.identities[0];
		assert_eq!(identity.id.as_str(), "tok2");
		assert!(identity.receive_channels.contains(ChannelId(1)));
		assert!(identity.send_channels.contains(ChannelId(3)));
	}

	#[test]
	fn blank_identity_id_is_rejected() {
		let toml = "[[identities]]\nid = \"  \"\n";
		assert!(ServerConfig::from_file(parse_toml(toml).expect("parse")).is_err());
	}

	#[test]
	fn zero_capacities_are_clamped() {
		let mut settings = ServerSettings {
			mailbox_capacity: 0,
			router_queue_capacity: 0,
			max_frame_bytes: 0,
			..ServerSettings::default()
		};
		settings.clamp_capacities();
		assert_eq!(settings.mailbox_capacity, 1);
		assert_eq!(settings.router_queue_capacity, 1);
		assert_eq!(settings.bridge_queue_capacity, 256);
		assert_eq!(settings.max_frame_bytes, chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	#[cfg(target_pointer_width = "64")]
	fn max_frame_bytes_is_clamped_to_prefix_range() {
		let mut settings = ServerSettings {
			max_frame_bytes: usize::MAX,
			..ServerSettings::default()
		};
		settings.clamp_capacities();
		assert_eq!(settings.max_frame_bytes, u32::MAX as usize);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let parsed = read_toml_if_exists(&dir.path().join("absent.toml")).expect("read");
		assert!(parsed.is_none());
	}

	#[test]
	fn malformed_file_is_an_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.toml");
		let mut f = fs::File::create(&path).expect("create");
		writeln!(f, "[server\nport = ").expect("write");
		assert!(read_toml_if_exists(&path).is_err());
	}
}
