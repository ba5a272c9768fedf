//! Readiness multiplexers.
//!
//! Two backends deliver the same `Readiness` events: `PollSet` keeps its
//! own interest list and rebuilds the `pollfd` array only after a change,
//! `Epoll` keeps the interest set in the kernel.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{errno, ReactorError};
use super::Token;

/// Token the waker is registered under.
pub const WAKE_TOKEN: Token = 0;

/// Largest number of events one `epoll_wait` returns.
const EPOLL_BATCH: usize = 256;

/// Which readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
	Readable,
	/// Used while a non-blocking connect is in flight.
	Writable,
}

/// What the multiplexer reported for one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
	pub token: Token,
	pub readable: bool,
	pub writable: bool,
	/// Both directions are shut down.
	pub hangup: bool,
	pub error: bool,
	/// The descriptor is not open.
	pub invalid: bool,
}

impl Readiness {
	/// True if the descriptor is dead and nothing can be read from it.
	pub fn is_fatal(&self) -> bool {
		!self.readable && (self.hangup || self.error || self.invalid)
	}
}

/// A readiness multiplexer over registered descriptors.
///
/// `add` and `remove` may be called while another thread sits in `wait`;
/// changes take effect on the next wait at the latest.
pub trait Multiplexer: Send + Sync {
	fn add(&self, fd: RawFd, token: Token, interest: Interest) -> std::io::Result<()>;

	fn remove(&self, fd: RawFd) -> std::io::Result<()>;

	/// Blocks up to `timeout` and appends ready descriptors to `events`.
	///
	/// An interrupted wait returns `Ok(0)`.
	fn wait(&self, events: &mut Vec<Readiness>, timeout: Duration) -> std::io::Result<usize>;

	fn name(&self) -> &'static str;
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
	timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

// ============================================================================
// poll()
// ============================================================================

#[derive(Default)]
struct InterestSet {
	tokens: BTreeMap<RawFd, (Token, Interest)>,
	fds: Vec<libc::pollfd>,
	order: Vec<Token>,
	dirty: bool,
}

impl InterestSet {
	fn rebuild(&mut self) {
		self.fds.clear();
		self.order.clear();
		for (&fd, &(token, interest)) in &self.tokens {
			let events = match interest {
				Interest::Readable => libc::POLLIN,
				Interest::Writable => libc::POLLOUT,
			};
			self.fds.push(libc::pollfd { fd, events, revents: 0 });
			self.order.push(token);
		}
		self.dirty = false;
	}
}

/// `poll()` backend.
#[derive(Default)]
pub struct PollSet {
	interest: Mutex<InterestSet>,
}

impl PollSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.interest.lock().tokens.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Multiplexer for PollSet {
	fn add(&self, fd: RawFd, token: Token, interest: Interest) -> std::io::Result<()> {
		let mut set = self.interest.lock();
		set.tokens.insert(fd, (token, interest));
		set.dirty = true;
		Ok(())
	}

	fn remove(&self, fd: RawFd) -> std::io::Result<()> {
		let mut interest = self.interest.lock();
		if interest.tokens.remove(&fd).is_some() {
			interest.dirty = true;
		}
		Ok(())
	}

	fn wait(&self, events: &mut Vec<Readiness>, timeout: Duration) -> std::io::Result<usize> {
		// Poll a private copy so add/remove never wait on a sleeping poll.
		let (mut fds, order) = {
			let mut interest = self.interest.lock();
			if interest.dirty {
				interest.rebuild();
			}
			(interest.fds.clone(), interest.order.clone())
		};

		let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
		if n == -1 {
			let errno = errno();
			if errno == libc::EINTR {
				return Ok(0);
			}
			return Err(ReactorError::Multiplexer { errno, op: "poll" }.into());
		}

		let before = events.len();
		for (pfd, &token) in fds.iter().zip(&order) {
			if pfd.revents == 0 {
				continue;
			}
			events.push(Readiness {
				token,
				readable: pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0,
				writable: pfd.revents & libc::POLLOUT != 0,
				hangup: pfd.revents & libc::POLLHUP != 0,
				error: pfd.revents & libc::POLLERR != 0,
				invalid: pfd.revents & libc::POLLNVAL != 0,
			});
		}
		Ok(events.len() - before)
	}

	fn name(&self) -> &'static str {
		"poll"
	}
}

// ============================================================================
// epoll
// ============================================================================

/// `epoll` backend.
#[derive(Debug)]
pub struct Epoll {
	fd: OwnedFd,
}

impl Epoll {
	pub fn new() -> std::io::Result<Self> {
		let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
		if fd == -1 {
			return Err(ReactorError::Multiplexer { errno: errno(), op: "epoll_create1" }.into());
		}
		Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
	}
}

impl Multiplexer for Epoll {
	fn add(&self, fd: RawFd, token: Token, interest: Interest) -> std::io::Result<()> {
		let events = match interest {
			Interest::Readable => libc::EPOLLIN,
			Interest::Writable => libc::EPOLLOUT,
		};
		let mut event = libc::epoll_event {
			events: events as u32,
			u64: token,
		};
		let result = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
		if result == -1 {
			return Err(ReactorError::Multiplexer { errno: errno(), op: "epoll_ctl(ADD)" }.into());
		}
		Ok(())
	}

	fn remove(&self, fd: RawFd) -> std::io::Result<()> {
		let mut event = libc::epoll_event { events: 0, u64: 0 };
		let result = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut event) };
		if result == -1 {
			let errno = errno();
			// Closing a descriptor already drops it from the set.
			if errno == libc::ENOENT || errno == libc::EBADF {
				trace!(fd, "not in epoll set");
				return Ok(());
			}
			return Err(ReactorError::Multiplexer { errno, op: "epoll_ctl(DEL)" }.into());
		}
		Ok(())
	}

	fn wait(&self, events: &mut Vec<Readiness>, timeout: Duration) -> std::io::Result<usize> {
		let mut ready = [libc::epoll_event { events: 0, u64: 0 }; EPOLL_BATCH];
		let n = unsafe {
			libc::epoll_wait(self.fd.as_raw_fd(), ready.as_mut_ptr(), EPOLL_BATCH as libc::c_int, timeout_ms(timeout))
		};
		if n == -1 {
			let errno = errno();
			if errno == libc::EINTR {
				return Ok(0);
			}
			return Err(ReactorError::Multiplexer { errno, op: "epoll_wait" }.into());
		}

		for event in &ready[..n as usize] {
			let flags = event.events as libc::c_int;
			let token = event.u64;
			events.push(Readiness {
				token,
				readable: flags & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
				writable: flags & libc::EPOLLOUT != 0,
				hangup: flags & libc::EPOLLHUP != 0,
				error: flags & libc::EPOLLERR != 0,
				invalid: false,
			});
		}
		Ok(n as usize)
	}

	fn name(&self) -> &'static str {
		"epoll"
	}
}

// ============================================================================
// Waker
// ============================================================================

/// Self-pipe that interrupts a multiplexer wait.
#[derive(Debug)]
pub struct Waker {
	read: OwnedFd,
	write: OwnedFd,
}

impl Waker {
	pub fn new() -> std::io::Result<Self> {
		let mut fds = [0 as libc::c_int; 2];
		let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
		if result == -1 {
			return Err(ReactorError::Multiplexer { errno: errno(), op: "pipe2" }.into());
		}
		let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
		Ok(Self { read, write })
	}

	/// Descriptor to register with the multiplexer.
	pub fn fd(&self) -> RawFd {
		self.read.as_raw_fd()
	}

	/// Makes the next (or current) wait return. A full pipe already does.
	pub fn wake(&self) {
		let byte = 1u8;
		unsafe {
			libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1);
		}
	}

	/// Empties the pipe so the waker stops reporting readable.
	pub fn drain(&self) {
		let mut buf = [0u8; 64];
		loop {
			let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
			if n <= 0 {
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn backends() -> Vec<Box<dyn Multiplexer>> {
		vec![Box::new(PollSet::new()), Box::new(Epoll::new().unwrap())]
	}

	#[test]
	fn waker_wakes_every_backend() {
		for mux in backends() {
			let waker = Waker::new().unwrap();
			mux.add(waker.fd(), WAKE_TOKEN, Interest::Readable).unwrap();

			let mut events = Vec::new();
			assert_eq!(mux.wait(&mut events, Duration::from_millis(10)).unwrap(), 0, "{}", mux.name());

			waker.wake();
			assert_eq!(mux.wait(&mut events, Duration::from_secs(1)).unwrap(), 1, "{}", mux.name());
			assert_eq!(events[0].token, WAKE_TOKEN);
			assert!(events[0].readable);

			waker.drain();
			events.clear();
			assert_eq!(mux.wait(&mut events, Duration::from_millis(10)).unwrap(), 0, "{}", mux.name());
		}
	}

	#[test]
	fn removed_descriptor_goes_quiet() {
		for mux in backends() {
			let waker = Waker::new().unwrap();
			mux.add(waker.fd(), 7, Interest::Readable).unwrap();
			waker.wake();
			mux.remove(waker.fd()).unwrap();

			let mut events = Vec::new();
			assert_eq!(mux.wait(&mut events, Duration::from_millis(10)).unwrap(), 0, "{}", mux.name());
		}
	}

	#[test]
	fn hangup_is_reported() {
		for mux in backends() {
			let mut fds = [0 as libc::c_int; 2];
			assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);
			let (local, peer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
			mux.add(local.as_raw_fd(), 3, Interest::Readable).unwrap();
			drop(peer);

			let mut events = Vec::new();
			assert_eq!(mux.wait(&mut events, Duration::from_secs(1)).unwrap(), 1, "{}", mux.name());
			assert_eq!(events[0].token, 3);
			assert!(events[0].hangup);
		}
	}

	#[test]
	fn writable_interest_reports_connected_socket() {
		for mux in backends() {
			let mut fds = [0 as libc::c_int; 2];
			assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);
			let (local, _peer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
			mux.add(local.as_raw_fd(), 5, Interest::Writable).unwrap();

			let mut events = Vec::new();
			assert_eq!(mux.wait(&mut events, Duration::from_secs(1)).unwrap(), 1, "{}", mux.name());
			assert!(events[0].writable);
			assert!(!events[0].readable);
		}
	}

	#[test]
	fn poll_set_tracks_interest() {
		let set = PollSet::new();
		assert!(set.is_empty());
		set.add(10, 1, Interest::Readable).unwrap();
		set.add(11, 2, Interest::Writable).unwrap();
		set.remove(10).unwrap();
		assert_eq!(set.len(), 1);
	}
}
