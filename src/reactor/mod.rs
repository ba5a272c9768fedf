//! The socket controller: one thread multiplexing every registered socket.
//!
//! Each pass waits on the multiplexer without holding the registry lock,
//! then, under the lock, accepts on listening sockets, builds the
//! round-robin reader list and gives every readable connection one turn.
//! Client sockets that lose their peer are retried by the reconnect
//! supervisor.

mod dispatch;
pub mod poller;
pub mod reconnect;

pub use self::poller::{Epoll, Interest, Multiplexer, PollSet, Readiness, Waker, WAKE_TOKEN};
pub use self::reconnect::{PeriodicTimer, Supervisor, RECONNECT_DELAY};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::endpoint::{Endpoint, Handler};
use crate::error::ReactorError;
use crate::socket::{ConnectionId, Socket};
use self::dispatch::Registry;

/// Multiplexer registration key.
pub type Token = u64;

/// Handle of a socket registered with a `Controller`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl fmt::Display for SocketId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "socket-{}", self.0)
	}
}

/// Readiness backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerKind {
	Poll,
	#[default]
	Epoll,
}

/// Who runs the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectDriver {
	/// Every dispatch pass.
	#[default]
	Reactor,
	/// A separate periodic timer thread.
	Timer,
}

/// Controller settings, stored as the `[Reactor]` configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReactorConfig {
	pub multiplexer: MultiplexerKind,
	/// Longest multiplexer wait in milliseconds.
	pub timeout: u64,
	/// Minimum milliseconds between connect attempts of one client.
	pub reconnect_delay: u64,
	pub reconnect_driver: ReconnectDriver,
	/// Tick of the reconnect timer thread in milliseconds.
	pub timer_interval: u64,
	/// Milliseconds a TLS handshake may take.
	pub handshake_timeout: u64,
}

impl Default for ReactorConfig {
	fn default() -> Self {
		Self {
			multiplexer: MultiplexerKind::default(),
			timeout: 500,
			reconnect_delay: RECONNECT_DELAY.as_millis() as u64,
			reconnect_driver: ReconnectDriver::default(),
			timer_interval: 1000,
			handshake_timeout: 10_000,
		}
	}
}

impl ReactorConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn multiplexer(mut self, kind: MultiplexerKind) -> Self {
		self.multiplexer = kind;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout.as_millis() as u64;
		self
	}

	pub fn reconnect_delay(mut self, delay: Duration) -> Self {
		self.reconnect_delay = delay.as_millis() as u64;
		self
	}

	pub fn reconnect_driver(mut self, driver: ReconnectDriver) -> Self {
		self.reconnect_driver = driver;
		self
	}

	pub fn timer_interval(mut self, interval: Duration) -> Self {
		self.timer_interval = interval.as_millis() as u64;
		self
	}

	pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
		self.handshake_timeout = timeout.as_millis() as u64;
		self
	}

	fn wait(&self) -> Duration {
		Duration::from_millis(self.timeout.max(1))
	}
}

struct Shared {
	registry: Mutex<Registry>,
	mux: Box<dyn Multiplexer>,
	waker: Waker,
	stop: AtomicBool,
	config: ReactorConfig,
}

impl Shared {
	/// One wait-and-dispatch pass. Returns the number of events seen.
	fn pass(&self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<usize> {
		if self.config.reconnect_driver == ReconnectDriver::Reactor {
			self.reconnect();
		}
		events.clear();
		let n = self.mux.wait(events, timeout)?;
		self.registry.lock().dispatch(self.mux.as_ref(), events, &self.waker);
		Ok(n)
	}

	fn reconnect(&self) -> usize {
		let mut registry = self.registry.lock();
		if registry.pending_reconnects() == 0 {
			return 0;
		}
		registry.reconnect(self.mux.as_ref(), Instant::now())
	}

	/// Reconnect from off the reactor thread; a sleeping wait must see new registrations.
	fn reconnect_and_wake(&self) -> usize {
		let attempts = self.reconnect();
		if attempts > 0 {
			self.waker.wake();
		}
		attempts
	}

	fn run(&self) {
		info!(multiplexer = self.mux.name(), "reactor running");
		let mut events = Vec::with_capacity(64);
		while !self.stop.load(Ordering::Acquire) {
			if let Err(e) = self.pass(&mut events, self.config.wait()) {
				error!(error = %e, "multiplexer wait failed");
				std::thread::sleep(self.config.wait());
			}
		}
		info!("reactor stopped");
	}
}

/// Owns the registered sockets and the thread that serves them.
///
/// Callbacks run on the reactor thread while the registry is locked;
/// calling back into the controller from a callback deadlocks. Use the
/// callback's `Link` instead.
///
/// # Example
/// ```ignore
/// use sockline::{data_handler, Controller, Endpoint, ReactorConfig, Server};
///
/// let mut controller = Controller::new(ReactorConfig::default())?;
/// let mut echo = Server::new("echo");
/// echo.open_at("127.0.0.1", "7000")?;
/// controller.register(echo, data_handler(|link| {
///     let mut buf = Vec::new();
///     let n = link.receive_to_end(&mut buf)?;
///     link.send(&buf)?;
///     Ok(n)
/// }))?;
/// controller.start()?;
/// ```
pub struct Controller {
	shared: Arc<Shared>,
	reactor: Option<JoinHandle<()>>,
	timer: Option<PeriodicTimer>,
}

impl Controller {
	pub fn new(config: ReactorConfig) -> io::Result<Self> {
		let mux: Box<dyn Multiplexer> = match config.multiplexer {
			MultiplexerKind::Poll => Box::new(PollSet::new()),
			MultiplexerKind::Epoll => Box::new(Epoll::new()?),
		};
		let waker = Waker::new()?;
		mux.add(waker.fd(), WAKE_TOKEN, Interest::Readable)?;

		let registry = Registry::new(
			Duration::from_millis(config.reconnect_delay),
			Duration::from_millis(config.handshake_timeout),
		);
		Ok(Self {
			shared: Arc::new(Shared {
				registry: Mutex::new(registry),
				mux,
				waker,
				stop: AtomicBool::new(false),
				config,
			}),
			reactor: None,
			timer: None,
		})
	}

	pub fn config(&self) -> &ReactorConfig {
		&self.shared.config
	}

	/// Hands a socket and its callbacks to the controller.
	///
	/// Listening sockets and connected clients are armed at once; a client
	/// without a peer is queued for reconnection.
	pub fn register<E, H>(&self, endpoint: E, handler: H) -> io::Result<SocketId>
	where
		E: Endpoint + 'static,
		H: Handler + 'static,
	{
		let id = self.shared.registry.lock().insert(self.shared.mux.as_ref(), Box::new(endpoint), Box::new(handler))?;
		self.shared.waker.wake();
		Ok(id)
	}

	/// Unregisters a socket, closing it and its connections.
	pub fn remove(&self, id: SocketId) -> io::Result<()> {
		let removed = self.shared.registry.lock().remove(self.shared.mux.as_ref(), id);
		match removed {
			Some(_) => {
				self.shared.waker.wake();
				Ok(())
			}
			None => Err(ReactorError::UnknownSocket(id.0).into()),
		}
	}

	/// Sends on one connection of a registered socket.
	pub fn send(&self, id: SocketId, conn: ConnectionId, buf: &[u8]) -> io::Result<usize> {
		let mut registry = self.shared.registry.lock();
		let Some(mut link) = registry.link(id, conn) else {
			return Err(ReactorError::UnknownSocket(id.0).into());
		};
		link.send(buf)
	}

	/// Runs `f` on a registered socket under the registry lock.
	///
	/// Use `remove` rather than closing the socket here.
	pub fn with_socket<R>(&self, id: SocketId, f: impl FnOnce(&mut Socket) -> R) -> io::Result<R> {
		self.shared
			.registry
			.lock()
			.with_endpoint(id, |endpoint| f(endpoint.socket_mut()))
			.ok_or_else(|| ReactorError::UnknownSocket(id.0).into())
	}

	/// Current connections of a registered socket.
	pub fn connections(&self, id: SocketId) -> io::Result<Vec<ConnectionId>> {
		self.with_socket(id, |socket| socket.connection_ids())
	}

	pub fn len(&self) -> usize {
		self.shared.registry.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn pending_reconnects(&self) -> usize {
		self.shared.registry.lock().pending_reconnects()
	}

	pub fn is_running(&self) -> bool {
		self.reactor.as_ref().is_some_and(|thread| !thread.is_finished())
	}

	/// Starts the reactor thread, plus the reconnect timer when configured.
	pub fn start(&mut self) -> io::Result<()> {
		if self.reactor.is_some() {
			return Ok(());
		}
		self.shared.stop.store(false, Ordering::Release);

		let shared = Arc::clone(&self.shared);
		let thread = std::thread::Builder::new()
			.name("socket-reactor".into())
			.spawn(move || shared.run())
			.map_err(|source| ReactorError::Spawn { name: "socket-reactor", source })?;
		self.reactor = Some(thread);

		if self.shared.config.reconnect_driver == ReconnectDriver::Timer {
			let shared = Arc::clone(&self.shared);
			let interval = Duration::from_millis(self.shared.config.timer_interval.max(1));
			self.timer = Some(PeriodicTimer::spawn("socket-reconnect", interval, move || {
				shared.reconnect_and_wake();
			})?);
		}
		Ok(())
	}

	/// Runs one pass on the calling thread. Fails while the reactor thread runs.
	pub fn poll_once(&self, timeout: Duration) -> io::Result<usize> {
		if self.reactor.is_some() {
			return Err(ReactorError::Running.into());
		}
		let mut events = Vec::new();
		self.shared.pass(&mut events, timeout)
	}

	/// Runs the reconnect supervisor now on the calling thread.
	///
	/// Returns the number of attempts made.
	pub fn reconnect_now(&self, now: Instant) -> usize {
		let attempts = self.shared.registry.lock().reconnect(self.shared.mux.as_ref(), now);
		if attempts > 0 {
			self.shared.waker.wake();
		}
		attempts
	}

	/// Stops the threads, then closes every socket. Safe to call twice.
	pub fn shutdown(&mut self) {
		self.shared.stop.store(true, Ordering::Release);
		self.shared.waker.wake();
		if let Some(thread) = self.reactor.take() {
			if thread.join().is_err() {
				error!("reactor thread panicked");
			}
		}
		if let Some(mut timer) = self.timer.take() {
			timer.stop();
		}
		self.shared.registry.lock().close_all(self.shared.mux.as_ref());
	}
}

impl Drop for Controller {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl fmt::Debug for Controller {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Controller")
			.field("multiplexer", &self.shared.mux.name())
			.field("running", &self.is_running())
			.finish()
	}
}
