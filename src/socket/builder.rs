use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::endpoint::AcceptPolicy;
use super::{
	set_reuse_addr, set_reuse_port, set_tcp_nodelay,
	set_keepalive, set_keepalive_idle, set_keepalive_interval, set_keepalive_count,
};

/// Backlog passed to `listen()` for every server socket.
pub const LISTEN_BACKLOG: i32 = 128;

// ============================================================================
// Shared Configuration Structs
// ============================================================================

/// Address reuse configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReuseConfig {
	pub addr: bool,
	pub port: bool,
}

impl Default for ReuseConfig {
	fn default() -> Self {
		Self {
			addr: true,
			port: false,
		}
	}
}

impl ReuseConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn addr(mut self, enable: bool) -> Self {
		self.addr = enable;
		self
	}

	pub fn port(mut self, enable: bool) -> Self {
		self.port = enable;
		self
	}

	/// Both flags; multicast listeners sharing a group port need this.
	pub fn both(mut self) -> Self {
		self.addr = true;
		self.port = true;
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S) -> std::io::Result<()> {
		if self.addr {
			set_reuse_addr(socket, true)?;
		}
		if self.port {
			set_reuse_port(socket, true)?;
		}
		Ok(())
	}
}

/// Keep-alive timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
	pub idle_secs: u32,
	pub interval_secs: u32,
	pub count: u32,
}

impl Default for KeepaliveConfig {
	fn default() -> Self {
		Self {
			idle_secs: 60,
			interval_secs: 10,
			count: 5,
		}
	}
}

impl KeepaliveConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn idle(mut self, secs: u32) -> Self {
		self.idle_secs = secs;
		self
	}

	pub fn interval(mut self, secs: u32) -> Self {
		self.interval_secs = secs;
		self
	}

	pub fn count(mut self, count: u32) -> Self {
		self.count = count;
		self
	}

	pub(crate) fn apply<S: AsRawFd>(&self, socket: &S) -> std::io::Result<()> {
		set_keepalive(socket, true)?;
		set_keepalive_idle(socket, self.idle_secs)?;
		set_keepalive_interval(socket, self.interval_secs)?;
		set_keepalive_count(socket, self.count)
	}
}

// ============================================================================
// Per-socket options
// ============================================================================

/// Options a `Socket` applies while opening.
///
/// # Example
/// ```ignore
/// use sockline::{SocketOptions, KeepaliveConfig, AcceptPolicy};
///
/// let options = SocketOptions::new()
///     .keep_alive(KeepaliveConfig::new().idle(60).interval(10).count(5))
///     .dual_stack(true)
///     .allow(AcceptPolicy::new(["192.168.1.", "::1"]));
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
	pub keep_alive: Option<KeepaliveConfig>,
	/// IPv6 sockets also carry IPv4-mapped traffic.
	pub dual_stack: bool,
	/// Verbose per-transfer logging.
	pub debug: bool,
	pub reuse: ReuseConfig,
	pub nodelay: bool,
	/// Upper bound for one non-blocking connect attempt.
	pub connect_timeout: Duration,
	/// Upper bound a send waits for a full socket buffer to drain.
	pub io_timeout: Duration,
	/// Datagram receive only accepts packets from the configured peer.
	pub unicast: bool,
	/// Multicast time-to-live.
	pub ttl: u32,
	pub allow: AcceptPolicy,
}

impl Default for SocketOptions {
	fn default() -> Self {
		Self {
			keep_alive: None,
			dual_stack: false,
			debug: false,
			reuse: ReuseConfig::default(),
			nodelay: false,
			connect_timeout: Duration::from_secs(2),
			io_timeout: Duration::from_secs(5),
			unicast: false,
			ttl: 1,
			allow: AcceptPolicy::allow_all(),
		}
	}
}

impl SocketOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn keep_alive(mut self, config: KeepaliveConfig) -> Self {
		self.keep_alive = Some(config);
		self
	}

	pub fn dual_stack(mut self, enable: bool) -> Self {
		self.dual_stack = enable;
		self
	}

	pub fn debug(mut self, enable: bool) -> Self {
		self.debug = enable;
		self
	}

	pub fn reuse(mut self, config: ReuseConfig) -> Self {
		self.reuse = config;
		self
	}

	pub fn nodelay(mut self, enable: bool) -> Self {
		self.nodelay = enable;
		self
	}

	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn io_timeout(mut self, timeout: Duration) -> Self {
		self.io_timeout = timeout;
		self
	}

	pub fn unicast(mut self, enable: bool) -> Self {
		self.unicast = enable;
		self
	}

	pub fn ttl(mut self, ttl: u32) -> Self {
		self.ttl = ttl;
		self
	}

	pub fn allow(mut self, policy: AcceptPolicy) -> Self {
		self.allow = policy;
		self
	}

	/// Applies the stream tuning options; a no-op for UNIX sockets.
	pub(crate) fn apply_stream<S: AsRawFd>(&self, socket: &S, is_unix: bool) -> std::io::Result<()> {
		if is_unix {
			return Ok(());
		}
		if self.nodelay {
			set_tcp_nodelay(socket, true)?;
		}
		if let Some(config) = self.keep_alive {
			config.apply(socket)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_timeouts() {
		let options = SocketOptions::new();
		assert_eq!(options.connect_timeout, Duration::from_secs(2));
		assert_eq!(options.io_timeout, Duration::from_secs(5));
		assert!(options.reuse.addr);
		assert!(options.keep_alive.is_none());
	}

	#[test]
	fn builder_chains() {
		let options = SocketOptions::new()
			.keep_alive(KeepaliveConfig::new().idle(30))
			.dual_stack(true)
			.reuse(ReuseConfig::new().both());
		assert_eq!(options.keep_alive.map(|k| k.idle_secs), Some(30));
		assert!(options.dual_stack);
		assert!(options.reuse.port);
	}
}
