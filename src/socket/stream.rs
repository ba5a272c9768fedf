use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::{SocketError, IoError, errno};

/// Result of a non-blocking receive.
///
/// Keeps "nothing to read yet" apart from "peer closed", which a bare
/// zero-length read cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
	/// Bytes were copied into the buffer.
	Data(usize),
	/// No data available now; try again on the next readiness event.
	WouldBlock,
	/// The peer performed an orderly shutdown.
	Closed,
}

impl Received {
	/// Number of bytes received, zero for `WouldBlock` and `Closed`.
	pub fn len(self) -> usize {
		match self {
			Received::Data(n) => n,
			_ => 0,
		}
	}

	pub fn is_closed(self) -> bool {
		self == Received::Closed
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
	Read,   // SHUT_RD
	Write,  // SHUT_WR
	ReadWrite,   // SHUT_RDWR
}

/// Shuts down one or both directions of a connected socket.
pub fn shutdown(fd: RawFd, how: Shutdown) -> std::io::Result<()> {
	let how = match how {
		Shutdown::Read => libc::SHUT_RD,
		Shutdown::Write => libc::SHUT_WR,
		Shutdown::ReadWrite => libc::SHUT_RDWR,
	};

	let result = unsafe { libc::shutdown(fd, how) };

	if result == -1 {
		Err(SocketError::SetOption { errno: errno(), option: "shutdown" }.into())
	} else {
		Ok(())
	}
}

/// Waits until `fd` reports any of `events` (or an error/hang-up).
///
/// Returns `false` on timeout. Interrupted polls resume with the remaining time.
pub fn wait_ready(fd: RawFd, events: libc::c_short, timeout: Duration) -> std::io::Result<bool> {
	let deadline = Instant::now() + timeout;
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		let mut pfd = libc::pollfd { fd, events, revents: 0 };
		let n = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis().min(i32::MAX as u128) as libc::c_int) };
		if n == -1 {
			let e = errno();
			if e == libc::EINTR {
				continue;
			}
			return Err(IoError::Read { errno: e }.into());
		}
		return Ok(n > 0);
	}
}

/// Writes the whole buffer to a stream socket.
///
/// Uses `MSG_NOSIGNAL` so a dead peer yields `EPIPE` instead of killing the
/// process. A full socket buffer is waited out for at most `timeout`.
pub fn send_all(fd: RawFd, buf: &[u8], timeout: Duration) -> std::io::Result<usize> {
	let mut sent = 0;
	while sent < buf.len() {
		let n = unsafe {
			libc::send(
				fd,
				buf[sent..].as_ptr() as *const libc::c_void,
				buf.len() - sent,
				libc::MSG_NOSIGNAL,
			)
		};

		if n >= 0 {
			sent += n as usize;
			continue;
		}

		match errno() {
			libc::EINTR => continue,
			e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
				if !wait_ready(fd, libc::POLLOUT, timeout)? {
					return Err(IoError::TimedOut { op: "send" }.into());
				}
			}
			e => return Err(IoError::Write { errno: e }.into()),
		}
	}
	Ok(sent)
}

/// Reads from a non-blocking stream socket until the buffer is full or the
/// socket would block.
///
/// Data already read wins over a close seen in the same call; the close is
/// reported by the next receive.
pub fn receive(fd: RawFd, buf: &mut [u8]) -> std::io::Result<Received> {
	let mut total = 0;
	while total < buf.len() {
		let n = unsafe {
			libc::recv(
				fd,
				buf[total..].as_mut_ptr() as *mut libc::c_void,
				buf.len() - total,
				0,
			)
		};

		if n > 0 {
			total += n as usize;
			continue;
		}
		if n == 0 {
			return Ok(if total > 0 { Received::Data(total) } else { Received::Closed });
		}

		match errno() {
			libc::EINTR => continue,
			e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
				return Ok(if total > 0 { Received::Data(total) } else { Received::WouldBlock });
			}
			e => return Err(IoError::Read { errno: e }.into()),
		}
	}
	Ok(Received::Data(total))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair() -> (RawFd, RawFd) {
		let mut fds = [0; 2];
		let rc = unsafe {
			libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
		};
		assert_eq!(rc, 0);
		(fds[0], fds[1])
	}

	#[test]
	fn would_block_then_data_then_closed() {
		let (a, b) = pair();
		let mut buf = [0u8; 16];
		assert_eq!(receive(b, &mut buf).unwrap(), Received::WouldBlock);

		send_all(a, b"hello", Duration::from_secs(1)).unwrap();
		assert_eq!(receive(b, &mut buf).unwrap(), Received::Data(5));
		assert_eq!(&buf[..5], b"hello");

		unsafe { libc::close(a) };
		assert_eq!(receive(b, &mut buf).unwrap(), Received::Closed);
		unsafe { libc::close(b) };
	}

	#[test]
	fn send_to_closed_peer_is_broken_pipe() {
		let (a, b) = pair();
		unsafe { libc::close(b) };
		let err = send_all(a, b"x", Duration::from_millis(100)).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
		unsafe { libc::close(a) };
	}

	#[test]
	fn full_buffer_times_out() {
		let (a, b) = pair();
		let chunk = vec![0u8; 1 << 20];
		let err = send_all(a, &chunk, Duration::from_millis(50)).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
		unsafe { libc::close(a) };
		unsafe { libc::close(b) };
	}
}
