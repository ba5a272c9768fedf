//! TOML configuration store.
//!
//! One table per socket name plus a `[Reactor]` table. Reading a section
//! writes every key it lacks back with its default, so a fresh file
//! documents itself after the first run.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::addr::Family;
use crate::endpoint::AcceptPolicy;
use crate::error::ConfigError;
use crate::reactor::ReactorConfig;
use crate::socket::{KeepaliveConfig, Socket};

/// Table name of the controller settings.
pub const REACTOR_SECTION: &str = "Reactor";

/// A port number or a service name from the services database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
	Number(u16),
	Name(String),
}

impl Port {
	fn parse(service: &str) -> Self {
		match service.parse() {
			Ok(number) => Port::Number(number),
			Err(_) => Port::Name(service.to_owned()),
		}
	}
}

impl std::fmt::Display for Port {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Port::Number(n) => write!(f, "{}", n),
			Port::Name(name) => f.write_str(name),
		}
	}
}

/// Per-socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SocketSection {
	/// Host name, address or UNIX path. `Device` is accepted as well.
	#[serde(alias = "Device")]
	pub host: String,
	pub port: Port,
	pub keep_alive: bool,
	pub debug: bool,
	pub dual_stack: bool,
	/// Allow-list in `AcceptPolicy::parse` form; `*` allows everyone.
	pub allow: String,
}

impl Default for SocketSection {
	fn default() -> Self {
		Self {
			host: String::new(),
			port: Port::Number(0),
			keep_alive: false,
			debug: false,
			dual_stack: false,
			allow: AcceptPolicy::allow_all().to_string(),
		}
	}
}

impl SocketSection {
	/// Defaults for a socket opened on `host` and `service`.
	pub fn new(host: &str, service: &str) -> Self {
		Self { host: host.to_owned(), port: Port::parse(service), ..Self::default() }
	}

	pub fn service(&self) -> String {
		self.port.to_string()
	}

	/// Copies the settings into the socket's options.
	///
	/// `DualStack` moves an IPv4 socket to IPv6 so it serves both.
	pub fn apply(&self, socket: &mut Socket) {
		if self.dual_stack && socket.family() == Family::Ipv4 {
			socket.set_family(Family::Ipv6);
		}
		let options = socket.options_mut();
		options.debug = self.debug;
		options.dual_stack = self.dual_stack;
		options.allow = AcceptPolicy::parse(&self.allow);
		options.keep_alive = match (self.keep_alive, options.keep_alive.take()) {
			(true, Some(current)) => Some(current),
			(true, None) => Some(KeepaliveConfig::default()),
			(false, _) => None,
		};
	}
}

/// Configuration file with write-back of missing keys.
#[derive(Debug)]
pub struct ConfigStore {
	path: Option<PathBuf>,
	table: Mutex<toml::Table>,
}

impl ConfigStore {
	/// Loads `path`; a missing file is an empty configuration.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let table = match fs::read_to_string(path) {
			Ok(text) => text.parse::<toml::Table>()?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "no configuration file, using defaults");
				toml::Table::new()
			}
			Err(source) => return Err(ConfigError::Io { path: path.display().to_string(), source }),
		};
		Ok(Self { path: Some(path.to_owned()), table: Mutex::new(table) })
	}

	/// A store that never touches the filesystem.
	pub fn in_memory() -> Self {
		Self { path: None, table: Mutex::new(toml::Table::new()) }
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	/// Writes the current contents back to the file.
	pub fn save(&self) -> Result<(), ConfigError> {
		let Some(path) = &self.path else {
			return Ok(());
		};
		let text = self.to_toml_string()?;
		fs::write(path, text).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
		info!(path = %path.display(), "configuration written");
		Ok(())
	}

	pub fn to_toml_string(&self) -> Result<String, ConfigError> {
		Ok(toml::to_string_pretty(&*self.table.lock())?)
	}

	/// Reads section `name`, filling and persisting whatever `defaults` has
	/// that the section lacks.
	pub fn section<T>(&self, name: &str, defaults: T) -> Result<T, ConfigError>
	where
		T: Serialize + DeserializeOwned,
	{
		self.merge(name, defaults, &[])
	}

	/// Settings of the socket called `name`.
	pub fn socket(&self, name: &str, defaults: SocketSection) -> Result<SocketSection, ConfigError> {
		self.merge(name, defaults, &[("Host", "Device")])
	}

	/// The `[Reactor]` table.
	pub fn reactor(&self) -> Result<ReactorConfig, ConfigError> {
		self.section(REACTOR_SECTION, ReactorConfig::default())
	}

	// `aliases` pairs a key with another spelling that counts as present.
	fn merge<T>(&self, name: &str, defaults: T, aliases: &[(&str, &str)]) -> Result<T, ConfigError>
	where
		T: Serialize + DeserializeOwned,
	{
		let toml::Value::Table(defaults) = toml::Value::try_from(defaults)? else {
			return Err(ConfigError::NotATable(name.to_owned()));
		};

		let (merged, added) = {
			let mut table = self.table.lock();
			let section = table
				.entry(name.to_owned())
				.or_insert_with(|| toml::Value::Table(toml::Table::new()));
			let toml::Value::Table(section) = section else {
				return Err(ConfigError::NotATable(name.to_owned()));
			};

			let mut added = 0;
			for (key, value) in defaults {
				let aliased = aliases
					.iter()
					.any(|(canonical, alias)| *canonical == key && section.contains_key(*alias));
				if !section.contains_key(&key) && !aliased {
					section.insert(key, value);
					added += 1;
				}
			}
			(section.clone(), added)
		};

		if added > 0 {
			debug!(section = name, added, "writing back default keys");
			self.save()?;
		}
		Ok(toml::Value::Table(merged).try_into()?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::socket::{Kind, Role};

	#[test]
	fn missing_keys_are_written_back() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("sockets.toml");
		std::fs::write(&path, "[lamp]\nHost = \"10.0.0.5\"\n").unwrap();

		let store = ConfigStore::load(&path).unwrap();
		let section = store.socket("lamp", SocketSection::new("127.0.0.1", "4000")).unwrap();
		assert_eq!(section.host, "10.0.0.5");
		assert_eq!(section.port, Port::Number(4000));

		let written = std::fs::read_to_string(&path).unwrap();
		assert!(written.contains("Port = 4000"));
		assert!(written.contains("KeepAlive = false"));
		assert!(written.contains("Allow = \"*\""));
	}

	#[test]
	fn device_alias_counts_as_host() {
		let store = ConfigStore::in_memory();
		let serial: toml::Table = "Device = \"/run/remote.sock\"".parse().unwrap();
		store.table.lock().insert("serial".into(), toml::Value::Table(serial));
		let section = store.socket("serial", SocketSection::new("", "")).unwrap();
		assert_eq!(section.host, "/run/remote.sock");
		assert!(!store.to_toml_string().unwrap().contains("Host"));
	}

	#[test]
	fn named_port_round_trips() {
		let store = ConfigStore::in_memory();
		let section = store.socket("web", SocketSection::new("localhost", "http")).unwrap();
		assert_eq!(section.service(), "http");
		let again = store.socket("web", SocketSection::new("elsewhere", "81")).unwrap();
		assert_eq!(again, section);
	}

	#[test]
	fn reactor_table_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("reactor.toml");
		let store = ConfigStore::load(&path).unwrap();
		assert_eq!(store.reactor().unwrap(), ReactorConfig::default());

		let written = std::fs::read_to_string(&path).unwrap();
		assert!(written.contains("[Reactor]"));
		assert!(written.contains("ReconnectDelay = 5000"));
		assert!(written.contains("Multiplexer = \"epoll\""));
	}

	#[test]
	fn apply_sets_socket_options() {
		let mut socket = Socket::new("scratch", Kind::Stream, Family::Ipv4, Role::Server);
		let section = SocketSection {
			keep_alive: true,
			debug: true,
			dual_stack: true,
			allow: "192.168.1., ::1".into(),
			..SocketSection::new("*", "0")
		};
		section.apply(&mut socket);
		assert_eq!(socket.family(), Family::Ipv6);
		assert!(socket.options().debug);
		assert!(socket.options().keep_alive.is_some());
		assert!(socket.options().allow.allows("192.168.1.7"));
		assert!(!socket.options().allow.allows("10.0.0.1"));
	}

	#[test]
	fn malformed_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bad.toml");
		std::fs::write(&path, "[lamp\nHost = ").unwrap();
		assert!(matches!(ConfigStore::load(&path), Err(ConfigError::Parse(_))));
	}
}
