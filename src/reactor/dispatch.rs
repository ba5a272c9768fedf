//! The registry of sockets and one dispatch pass over readiness events.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::addr::Family;
use crate::endpoint::{admits, Endpoint, Handler, Link};
use crate::error::ReactorError;
use crate::socket::{take_error, Accepted, ConnectionId, Kind, Role, State};
use crate::tls::Handshake;
use super::poller::{Interest, Multiplexer, Readiness, Waker, WAKE_TOKEN};
use super::reconnect::Supervisor;
use super::{SocketId, Token};

/// Upper bound of back-to-back data callbacks for one plain connection per pass.
const MAX_SPINS: usize = 64;

pub(crate) struct Entry {
	pub(crate) endpoint: Box<dyn Endpoint>,
	handler: Box<dyn Handler>,
	/// Registration of the socket's own descriptor.
	token: Option<Token>,
	attempt: Option<Attempt>,
}

/// A reconnect whose connect is still in flight.
#[derive(Debug, Clone, Copy)]
struct Attempt {
	/// Supervisor time of the attempt; a failure is queued with it.
	at: Instant,
	started: Instant,
}

/// What a registered descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
	Listener,
	/// Client descriptor waiting to turn writable.
	Connecting,
	Peer(ConnectionId),
}

#[derive(Debug, Clone, Copy)]
struct Route {
	socket: SocketId,
	leg: Leg,
	fd: RawFd,
}

/// Every registered socket with its callbacks, keyed by id.
///
/// Lives behind the controller's lock; nothing here blocks. Reconnects
/// only start a connect and finish it on a later writable event.
pub(crate) struct Registry {
	entries: BTreeMap<SocketId, Entry>,
	routes: HashMap<Token, Route>,
	next_socket: u64,
	next_token: Token,
	supervisor: Supervisor,
	handshake_limit: Duration,
}

/// Errors after which the peer is gone for good.
fn peer_lost(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::ConnectionReset
			| io::ErrorKind::BrokenPipe
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::UnexpectedEof
	)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
	if let Some(message) = payload.downcast_ref::<&str>() {
		message
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.as_str()
	} else {
		"non-string panic"
	}
}

impl Registry {
	pub(crate) fn new(reconnect_delay: Duration, handshake_limit: Duration) -> Self {
		Self {
			entries: BTreeMap::new(),
			routes: HashMap::new(),
			next_socket: 1,
			next_token: WAKE_TOKEN + 1,
			supervisor: Supervisor::new(reconnect_delay),
			handshake_limit,
		}
	}

	fn token(&mut self) -> Token {
		let token = self.next_token;
		self.next_token += 1;
		token
	}

	pub(crate) fn pending_reconnects(&self) -> usize {
		self.supervisor.len()
	}

	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}

	/// Adds a socket and arms whatever it is ready for.
	///
	/// A client that is open or was opened but has no peer goes to the
	/// reconnect supervisor.
	pub(crate) fn insert(&mut self, mux: &dyn Multiplexer, endpoint: Box<dyn Endpoint>, handler: Box<dyn Handler>) -> io::Result<SocketId> {
		let id = SocketId(self.next_socket);
		self.next_socket += 1;

		let socket = endpoint.socket();
		let waiting = socket.role() == Role::Client
			&& socket.kind() == Kind::Stream
			&& !socket.is_connected()
			&& socket.target().is_some();
		info!(socket = socket.name(), %id, open = socket.is_open(), "registered");

		self.entries.insert(id, Entry { endpoint, handler, token: None, attempt: None });
		if let Err(e) = self.arm(mux, id) {
			self.entries.remove(&id);
			return Err(e);
		}
		if waiting {
			self.supervisor.enqueue(id, Instant::now());
		}
		Ok(id)
	}

	/// Registers the socket's descriptor and starts its attached connection.
	fn arm(&mut self, mux: &dyn Multiplexer, id: SocketId) -> io::Result<()> {
		let token = self.token();
		let Some(entry) = self.entries.get_mut(&id) else {
			return Ok(());
		};
		let socket = entry.endpoint.socket();
		let Some(fd) = socket.fd() else {
			return Ok(());
		};
		let leg = if socket.is_listening() {
			Leg::Listener
		} else if let (true, Some(conn)) = (socket.is_connected(), socket.primary_connection()) {
			Leg::Peer(conn)
		} else {
			return Ok(());
		};

		mux.add(fd, token, Interest::Readable)?;
		entry.token = Some(token);
		self.routes.insert(token, Route { socket: id, leg, fd });
		if let Leg::Peer(conn) = leg {
			self.start(mux, id, conn);
		}
		Ok(())
	}

	/// Drops the socket's registrations, its own and its accepted peers'.
	fn disarm(&mut self, mux: &dyn Multiplexer, id: SocketId) {
		let stale: Vec<Token> = self
			.routes
			.iter()
			.filter(|(_, route)| route.socket == id)
			.map(|(&token, _)| token)
			.collect();
		for token in stale {
			if let Some(route) = self.routes.remove(&token) {
				let _ = mux.remove(route.fd);
			}
		}
		if let Some(entry) = self.entries.get_mut(&id) {
			entry.token = None;
			entry.attempt = None;
		}
	}

	/// Unregisters and closes one socket.
	pub(crate) fn remove(&mut self, mux: &dyn Multiplexer, id: SocketId) -> Option<Box<dyn Endpoint>> {
		self.disarm(mux, id);
		self.supervisor.remove(id);
		let Entry { mut endpoint, mut handler, .. } = self.entries.remove(&id)?;

		let socket = endpoint.socket();
		let name = socket.name().to_owned();
		let established: Vec<ConnectionId> =
			socket.connections().filter(|c| c.is_established()).map(|c| c.id()).collect();
		endpoint.close();
		for conn in established {
			guarded(&name, conn, "close", || handler.on_close(&name, conn));
		}
		info!(socket = %name, %id, "removed");
		Some(endpoint)
	}

	/// Closes every socket and forgets everything.
	pub(crate) fn close_all(&mut self, mux: &dyn Multiplexer) {
		let ids: Vec<SocketId> = self.entries.keys().copied().collect();
		for id in ids {
			self.remove(mux, id);
		}
		self.routes.clear();
		self.supervisor = Supervisor::new(self.supervisor.min_delay());
	}

	/// One dispatch pass over the events of a single wait.
	///
	/// Listening sockets are drained first while the scan builds the reader
	/// list; every reader then gets its turn.
	pub(crate) fn dispatch(&mut self, mux: &dyn Multiplexer, events: &[Readiness], waker: &Waker) {
		self.expire_handshakes(mux);
		self.expire_connects(mux);

		let mut readers: Vec<Token> = Vec::new();
		for event in events {
			if event.token == WAKE_TOKEN {
				waker.drain();
				continue;
			}
			let Some(route) = self.routes.get(&event.token).copied() else {
				continue;
			};
			match route.leg {
				Leg::Listener if event.readable => self.accept_all(mux, route.socket),
				Leg::Listener => {
					if event.is_fatal() {
						let error = match take_error(route.fd) {
							Ok(Some(e)) => e,
							_ => ReactorError::ListenerFailed { socket: self.name_of(route.socket) }.into(),
						};
						self.fail(mux, route.socket, error);
					}
				}
				Leg::Connecting => self.finish_connect(mux, route.socket),
				Leg::Peer(conn) if event.is_fatal() => self.teardown(mux, route.socket, conn, "hang-up"),
				Leg::Peer(_) => {
					if !readers.contains(&event.token) {
						readers.push(event.token);
					}
				}
			}
		}

		for token in readers {
			// Torn down earlier in this pass.
			let Some(route) = self.routes.get(&token).copied() else {
				continue;
			};
			if let Leg::Peer(conn) = route.leg {
				self.service(mux, route.socket, conn);
			}
		}
	}

	fn name_of(&self, id: SocketId) -> String {
		self.entries.get(&id).map(|entry| entry.endpoint.socket().name().to_owned()).unwrap_or_default()
	}

	/// Closes a socket whose own descriptor failed and reports it to its handler.
	///
	/// The socket stays registered, closed, until it is removed.
	fn fail(&mut self, mux: &dyn Multiplexer, id: SocketId, error: io::Error) {
		self.disarm(mux, id);
		self.supervisor.remove(id);
		let Some(Entry { endpoint, handler, .. }) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = endpoint.socket_mut();
		let name = socket.name().to_owned();
		let established: Vec<ConnectionId> =
			socket.connections().filter(|c| c.is_established()).map(|c| c.id()).collect();
		error!(socket = %name, %id, error = %error, "socket failed, closing");
		socket.close();
		for conn in established {
			guarded(&name, conn, "close", || handler.on_close(&name, conn));
		}
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.on_error(&name, &error))) {
			error!(socket = %name, callback = "error", panic = panic_message(payload.as_ref()), "callback panicked");
		}
	}

	/// Drops a route that no longer leads anywhere.
	fn forget(&mut self, mux: &dyn Multiplexer, token: Token) {
		if let Some(route) = self.routes.remove(&token) {
			if !self.routes.values().any(|other| other.fd == route.fd) {
				let _ = mux.remove(route.fd);
			}
		}
	}

	/// Drops routes to a connection that was closed behind the reactor's back.
	fn forget_connection(&mut self, mux: &dyn Multiplexer, id: SocketId, conn: ConnectionId) {
		let stale: Vec<Token> = self
			.routes
			.iter()
			.filter(|(_, route)| route.socket == id && route.leg == Leg::Peer(conn))
			.map(|(&token, _)| token)
			.collect();
		for token in stale {
			self.forget(mux, token);
		}
	}

	/// Accepts until the backlog is empty, then starts every admitted peer.
	///
	/// A hard accept failure closes the listener instead.
	fn accept_all(&mut self, mux: &dyn Multiplexer, id: SocketId) {
		let mut admitted = Vec::new();
		let mut failure = None;
		loop {
			let token = self.next_token;
			let Some(Entry { endpoint, handler, .. }) = self.entries.get_mut(&id) else {
				return;
			};
			let socket = endpoint.socket_mut();
			let (raw, peer) = match socket.accept(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) {
				Ok(Accepted::Connection(raw, peer)) => (raw, peer),
				Ok(Accepted::WouldBlock) => break,
				Err(e) => {
					failure = Some(e);
					break;
				}
			};

			let fd = raw.as_raw_fd();
			let remote = peer.host_string();
			let mut allow = admits(socket, &peer);
			if allow && peer.family() != Family::Unix {
				guarded(socket.name(), ConnectionId(fd), "accept", || handler.on_accept(&remote, &mut allow));
			}
			if !allow {
				info!(socket = socket.name(), %remote, "peer rejected");
				continue;
			}

			let conn = match socket.adopt(raw, peer) {
				Ok(conn) => conn,
				Err(e) => {
					warn!(socket = socket.name(), %remote, error = %e, "cannot adopt peer");
					continue;
				}
			};
			if let Err(e) = mux.add(fd, token, Interest::Readable) {
				warn!(socket = socket.name(), %conn, error = %e, "cannot register peer");
				socket.remove_connection(conn);
				continue;
			}
			if let Some(connection) = socket.connection_mut(conn) {
				connection.token = Some(token);
			}
			self.next_token += 1;
			self.routes.insert(token, Route { socket: id, leg: Leg::Peer(conn), fd });
			admitted.push(conn);
		}

		if let Some(error) = failure {
			self.fail(mux, id, error);
			return;
		}
		for conn in admitted {
			self.start(mux, id, conn);
		}
	}

	/// Plain connections are established at once; secure ones start their handshake.
	fn start(&mut self, mux: &dyn Multiplexer, id: SocketId, conn: ConnectionId) {
		let Some(entry) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = entry.endpoint.socket_mut();
		let tls = socket.tls().cloned();
		let name = socket.name().to_owned();
		let Some(connection) = socket.connection_mut(conn) else {
			return;
		};

		match tls {
			Some(context) if !connection.is_secure() => match context.create_session() {
				Ok(session) => {
					debug!(socket = %name, %conn, remote = connection.remote(), "tls handshake started");
					connection.attach_tls(session);
					self.negotiate(mux, id, conn);
				}
				Err(e) => {
					error!(socket = %name, %conn, error = %e, "cannot create tls session");
					self.teardown(mux, id, conn, "tls setup failed");
				}
			},
			Some(_) => self.negotiate(mux, id, conn),
			None => {
				connection.state_mut().insert(State::ESTABLISHED);
				self.connected(id, conn);
			}
		}
	}

	/// Steps a handshake; completion runs `on_connect` and delivers early data.
	fn negotiate(&mut self, mux: &dyn Multiplexer, id: SocketId, conn: ConnectionId) {
		let Some(entry) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = entry.endpoint.socket_mut();
		let name = socket.name().to_owned();
		let Some(connection) = socket.connection_mut(conn) else {
			return;
		};

		match connection.negotiate() {
			Ok(Handshake::Pending) => {}
			Ok(Handshake::Complete) => {
				info!(socket = %name, %conn, remote = connection.remote(), "tls negotiated");
				let buffered = connection.has_buffered();
				self.connected(id, conn);
				if buffered {
					self.service(mux, id, conn);
				}
			}
			Err(e) => {
				warn!(socket = %name, %conn, remote = connection.remote(), error = %e, "tls handshake failed");
				self.teardown(mux, id, conn, "tls handshake failed");
			}
		}
	}

	fn connected(&mut self, id: SocketId, conn: ConnectionId) {
		let Some(Entry { endpoint, handler, .. }) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = endpoint.socket_mut();
		if socket.kind() != Kind::Stream {
			return;
		}
		let name = socket.name().to_owned();
		if let Some(mut link) = socket.link(conn) {
			info!(socket = %name, %conn, remote = link.remote(), "connected");
			guarded(&name, conn, "connect", || handler.on_connect(&mut link));
		}
	}

	/// Gives one readable connection its turn.
	fn service(&mut self, mux: &dyn Multiplexer, id: SocketId, conn: ConnectionId) {
		let Some(Entry { endpoint, handler, .. }) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = endpoint.socket_mut();
		let Some(state) = socket.connection(conn).map(|c| c.state()) else {
			return;
		};
		if state.contains(State::HANDSHAKING) {
			self.negotiate(mux, id, conn);
			return;
		}
		if !state.contains(State::ESTABLISHED) {
			return;
		}

		let name = socket.name().to_owned();
		let secure = socket.is_secure();
		let mut spins = 0;
		let finished = loop {
			let Some(mut link) = socket.link(conn) else {
				return;
			};
			let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_data(&mut link)));
			drop(link);
			spins += 1;

			let progressed = match outcome {
				Ok(Ok(n)) => n > 0,
				Ok(Err(e)) if peer_lost(&e) => {
					debug!(socket = %name, %conn, error = %e, "peer lost");
					break true;
				}
				Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => false,
				Ok(Err(e)) => {
					warn!(socket = %name, %conn, error = %e, "data callback failed");
					false
				}
				Err(payload) => {
					error!(socket = %name, %conn, panic = panic_message(payload.as_ref()), "data callback panicked");
					false
				}
			};

			let Some(connection) = socket.connection_mut(conn) else {
				return;
			};
			if connection.state().is_finished() {
				break true;
			}
			// A readable TLS socket may hold no application data yet, so
			// secure connections only go again on decrypted leftovers.
			let again = if secure { connection.has_buffered() } else { progressed };
			if !again || spins >= MAX_SPINS {
				break false;
			}
		};

		if finished {
			self.teardown(mux, id, conn, "closed");
		}
	}

	/// Closes connections stuck in the handshake.
	fn expire_handshakes(&mut self, mux: &dyn Multiplexer) {
		let mut expired = Vec::new();
		for (&id, entry) in &self.entries {
			let socket = entry.endpoint.socket();
			let Some(context) = socket.tls() else {
				continue;
			};
			let limit = context.handshake_timeout().min(self.handshake_limit);
			expired.extend(
				socket
					.connections()
					.filter(|c| c.state().contains(State::HANDSHAKING) && c.age() > limit)
					.map(|c| (id, c.id())),
			);
		}
		for (id, conn) in expired {
			self.teardown(mux, id, conn, "tls handshake timed out");
		}
	}

	/// Gives up on reconnects still in flight after `connect_timeout`.
	fn expire_connects(&mut self, mux: &dyn Multiplexer) {
		let expired: Vec<(SocketId, Instant)> = self
			.entries
			.iter()
			.filter_map(|(&id, entry)| {
				let attempt = entry.attempt?;
				let limit = entry.endpoint.socket().options().connect_timeout;
				(attempt.started.elapsed() > limit).then_some((id, attempt.at))
			})
			.collect();
		for (id, at) in expired {
			self.disarm(mux, id);
			if let Some(entry) = self.entries.get_mut(&id) {
				warn!(socket = entry.endpoint.socket().name(), %id, "connect timed out");
				entry.endpoint.close();
			}
			self.supervisor.enqueue(id, at);
		}
	}

	/// Removes a connection.
	///
	/// Accepted peers are dropped from the socket. A client or datagram
	/// socket loses its descriptor and a client goes to the supervisor.
	pub(crate) fn teardown(&mut self, mux: &dyn Multiplexer, id: SocketId, conn: ConnectionId, reason: &'static str) {
		let Some(Entry { endpoint, handler, token, .. }) = self.entries.get_mut(&id) else {
			return;
		};
		let socket = endpoint.socket_mut();
		let name = socket.name().to_owned();
		let Some(connection) = socket.connection(conn) else {
			self.forget_connection(mux, id, conn);
			return;
		};
		let established = connection.is_established();
		let remote = connection.remote().to_owned();

		if connection.is_attached() {
			if let Some(token) = token.take() {
				self.routes.remove(&token);
			}
			if let Some(fd) = socket.fd() {
				let _ = mux.remove(fd);
			}
			socket.close();
			let reconnect = socket.role() == Role::Client && socket.kind() == Kind::Stream;
			info!(socket = %name, %conn, %remote, reason, "disconnected");
			if established {
				guarded(&name, conn, "close", || handler.on_close(&name, conn));
			}
			if reconnect {
				self.supervisor.enqueue(id, Instant::now());
			}
		} else {
			let Some(connection) = socket.remove_connection(conn) else {
				return;
			};
			if let Some(token) = connection.token {
				self.routes.remove(&token);
			}
			let _ = mux.remove(connection.fd());
			connection.close();
			info!(socket = %name, %conn, %remote, reason, "connection closed");
			if established {
				guarded(&name, conn, "close", || handler.on_close(&name, conn));
			}
		}
	}

	/// Retries every due client. Returns the number of attempts.
	pub(crate) fn reconnect(&mut self, mux: &dyn Multiplexer, now: Instant) -> usize {
		let delay = self.supervisor.min_delay();
		let mut supervisor = std::mem::replace(&mut self.supervisor, Supervisor::new(delay));
		let attempts = supervisor.tick(now, |id| self.retry(mux, id, now));
		// Anything queued while retrying (a handshake failing at once).
		supervisor.merge(std::mem::replace(&mut self.supervisor, Supervisor::new(delay)));
		self.supervisor = supervisor;
		attempts
	}

	/// One reconnect attempt.
	///
	/// True once connected, while the connect is in flight, or if the
	/// socket is gone; an attempt that fails later is queued again.
	fn retry(&mut self, mux: &dyn Multiplexer, id: SocketId, now: Instant) -> bool {
		self.disarm(mux, id);
		let Some(entry) = self.entries.get_mut(&id) else {
			return true;
		};
		let name = entry.endpoint.socket().name().to_owned();
		match entry.endpoint.restart() {
			Ok(true) => {}
			Ok(false) => return self.await_connect(mux, id, now),
			Err(e) => {
				warn!(socket = %name, error = %e, "reconnect failed");
				return false;
			}
		}
		info!(socket = %name, %id, "reconnected");
		if let Err(e) = self.arm(mux, id) {
			warn!(socket = %name, error = %e, "cannot register reconnected socket");
			if let Some(entry) = self.entries.get_mut(&id) {
				entry.endpoint.close();
			}
			return false;
		}
		true
	}

	/// Watches a connecting socket for writability.
	fn await_connect(&mut self, mux: &dyn Multiplexer, id: SocketId, now: Instant) -> bool {
		let token = self.token();
		let Some(entry) = self.entries.get_mut(&id) else {
			return true;
		};
		let Some(fd) = entry.endpoint.socket().fd() else {
			return false;
		};
		if let Err(e) = mux.add(fd, token, Interest::Writable) {
			warn!(socket = entry.endpoint.socket().name(), error = %e, "cannot watch connect");
			entry.endpoint.close();
			return false;
		}
		entry.token = Some(token);
		entry.attempt = Some(Attempt { at: now, started: Instant::now() });
		self.routes.insert(token, Route { socket: id, leg: Leg::Connecting, fd });
		true
	}

	/// A connecting socket turned writable: it either connected or failed.
	fn finish_connect(&mut self, mux: &dyn Multiplexer, id: SocketId) {
		let Some(entry) = self.entries.get_mut(&id) else {
			return;
		};
		let attempt = entry.attempt.take();
		if let Some(route) = entry.token.take().and_then(|token| self.routes.remove(&token)) {
			let _ = mux.remove(route.fd);
		}

		let socket = entry.endpoint.socket_mut();
		let name = socket.name().to_owned();
		let at = attempt.map_or_else(Instant::now, |attempt| attempt.at);
		if let Err(e) = socket.complete_connect() {
			warn!(socket = %name, error = %e, "reconnect failed");
			socket.close();
			self.supervisor.enqueue(id, at);
			return;
		}
		info!(socket = %name, %id, "reconnected");
		if let Err(e) = self.arm(mux, id) {
			warn!(socket = %name, error = %e, "cannot register reconnected socket");
			if let Some(entry) = self.entries.get_mut(&id) {
				entry.endpoint.close();
			}
			self.supervisor.enqueue(id, at);
		}
	}

	/// Runs `f` on a registered endpoint.
	pub(crate) fn with_endpoint<R>(&mut self, id: SocketId, f: impl FnOnce(&mut dyn Endpoint) -> R) -> Option<R> {
		let entry = self.entries.get_mut(&id)?;
		Some(f(entry.endpoint.as_mut()))
	}

	/// Link to a connection of a registered socket, for sends from outside the reactor.
	pub(crate) fn link(&mut self, id: SocketId, conn: ConnectionId) -> Option<Link<'_>> {
		self.entries.get_mut(&id)?.endpoint.socket_mut().link(conn)
	}
}

/// Runs a user callback; a panic is logged and swallowed.
fn guarded(socket: &str, conn: ConnectionId, what: &'static str, f: impl FnOnce()) {
	if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
		error!(socket, %conn, callback = what, panic = panic_message(payload.as_ref()), "callback panicked");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::{data_handler, Client, Server};
	use crate::reactor::poller::PollSet;

	fn registry() -> Registry {
		Registry::new(Duration::from_secs(5), Duration::from_secs(10))
	}

	#[test]
	fn listening_socket_gets_a_route() {
		let mux = PollSet::new();
		let mut server = Server::new("srv");
		server.open_at("127.0.0.1", "0").unwrap();

		let mut reg = registry();
		let id = reg.insert(&mux, Box::new(server), Box::new(data_handler(|_| Ok(0)))).unwrap();
		assert_eq!(reg.len(), 1);
		assert_eq!(mux.len(), 1);
		assert_eq!(reg.pending_reconnects(), 0);

		assert!(reg.remove(&mux, id).is_some());
		assert!(mux.is_empty());
		assert_eq!(reg.len(), 0);
	}

	#[test]
	fn unconnected_client_is_queued() {
		let mut reserved = Server::new("reserved");
		reserved.open_at("127.0.0.1", "0").unwrap();
		let port = reserved.socket().local_addr().unwrap().port().unwrap().to_string();
		reserved.close();

		let mux = PollSet::new();
		let mut client = Client::new("cli");
		client.open_at("127.0.0.1", &port).unwrap();

		let mut reg = registry();
		let id = reg.insert(&mux, Box::new(client), Box::new(data_handler(|_| Ok(0)))).unwrap();
		assert_eq!(reg.pending_reconnects(), 1);
		assert!(mux.is_empty());

		// Not due yet.
		assert_eq!(reg.reconnect(&mux, Instant::now()), 0);
		reg.remove(&mux, id);
		assert_eq!(reg.pending_reconnects(), 0);
	}

	#[test]
	fn peer_loss_kinds() {
		assert!(peer_lost(&io::Error::from(io::ErrorKind::ConnectionReset)));
		assert!(peer_lost(&io::Error::from(io::ErrorKind::UnexpectedEof)));
		assert!(!peer_lost(&io::Error::from(io::ErrorKind::InvalidData)));
	}
}
