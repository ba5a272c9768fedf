use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::ReactorError;
use super::SocketId;

/// Default minimum time between two connect attempts of one socket.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Retry {
	socket: SocketId,
	last_attempt: Instant,
}

/// Client sockets waiting for their peer to come back.
///
/// A socket is queued with the time of its failed attempt and retried on
/// the first tick at least `min_delay` later.
#[derive(Debug)]
pub struct Supervisor {
	pending: Vec<Retry>,
	min_delay: Duration,
}

impl Default for Supervisor {
	fn default() -> Self {
		Self::new(RECONNECT_DELAY)
	}
}

impl Supervisor {
	pub fn new(min_delay: Duration) -> Self {
		Self { pending: Vec::new(), min_delay }
	}

	pub fn min_delay(&self) -> Duration {
		self.min_delay
	}

	/// Queues `socket`, or restarts its delay if already queued.
	pub fn enqueue(&mut self, socket: SocketId, now: Instant) {
		match self.pending.iter_mut().find(|retry| retry.socket == socket) {
			Some(retry) => retry.last_attempt = now,
			None => self.pending.push(Retry { socket, last_attempt: now }),
		}
		debug!(%socket, delay_ms = self.min_delay.as_millis() as u64, "queued for reconnect");
	}

	pub fn remove(&mut self, socket: SocketId) {
		self.pending.retain(|retry| retry.socket != socket);
	}

	pub fn contains(&self, socket: SocketId) -> bool {
		self.pending.iter().any(|retry| retry.socket == socket)
	}

	pub fn len(&self) -> usize {
		self.pending.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Takes over the queue of `other`, keeping its attempt times.
	pub(crate) fn merge(&mut self, other: Supervisor) {
		for retry in other.pending {
			self.enqueue(retry.socket, retry.last_attempt);
		}
	}

	/// Calls `retry` for every socket whose delay has passed.
	///
	/// `retry` returns true on success, which dequeues the socket; failures
	/// stay queued with `now` as their new attempt time. Returns the number
	/// of attempts made.
	pub fn tick<F>(&mut self, now: Instant, mut retry: F) -> usize
	where
		F: FnMut(SocketId) -> bool,
	{
		let min_delay = self.min_delay;
		let mut attempts = 0;
		self.pending.retain_mut(|entry| {
			if now.saturating_duration_since(entry.last_attempt) < min_delay {
				return true;
			}
			attempts += 1;
			if retry(entry.socket) {
				return false;
			}
			entry.last_attempt = now;
			true
		});
		if attempts > 0 {
			trace!(attempts, remaining = self.pending.len(), "reconnect tick");
		}
		attempts
	}
}

/// Background thread calling `task` every `interval` until dropped.
#[derive(Debug)]
pub struct PeriodicTimer {
	stop: Arc<AtomicBool>,
	thread: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
	pub fn spawn<F>(name: &'static str, interval: Duration, mut task: F) -> Result<Self, ReactorError>
	where
		F: FnMut() + Send + 'static,
	{
		let stop = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&stop);
		let step = interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
		let thread = std::thread::Builder::new()
			.name(name.to_owned())
			.spawn(move || {
				let mut next = Instant::now() + interval;
				while !flag.load(Ordering::Acquire) {
					let now = Instant::now();
					if now >= next {
						task();
						next = now + interval;
					}
					// Short naps keep shutdown latency low for long intervals.
					std::thread::sleep(step.min(next.saturating_duration_since(now)).max(Duration::from_millis(1)));
				}
			})
			.map_err(|source| ReactorError::Spawn { name, source })?;
		Ok(Self { stop, thread: Some(thread) })
	}

	pub fn stop(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for PeriodicTimer {
	fn drop(&mut self) {
		self.stop();
	}
}
