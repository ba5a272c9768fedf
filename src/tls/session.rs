use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use rustls::{ClientConnection, ServerConnection};

use crate::error::{IoError, TlsError};
use crate::socket::{wait_ready, Received};

/// Largest plaintext slice handed to rustls per write.
const CHUNK: usize = 16 * 1024;

// rustls keeps client and server connections as distinct types.
enum Engine {
	Server(ServerConnection),
	Client(ClientConnection),
}

macro_rules! engine {
	($self:expr, $conn:ident => $body:expr) => {
		match $self {
			Engine::Server($conn) => $body,
			Engine::Client($conn) => $body,
		}
	};
}

/// Progress of a non-blocking handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
	Complete,
	/// Waiting for the peer; step again on the next readable event.
	Pending,
}

/// One TLS session bound to a connection.
pub struct TlsSession {
	engine: Engine,
}

/// Socket I/O for rustls on a borrowed, non-blocking descriptor.
struct FdIo(RawFd);

impl Read for FdIo {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let n = unsafe { libc::recv(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
		if n == -1 {
			return Err(std::io::Error::last_os_error());
		}
		Ok(n as usize)
	}
}

impl Write for FdIo {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let n = unsafe {
			libc::send(self.0, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
		};
		if n == -1 {
			return Err(std::io::Error::last_os_error());
		}
		Ok(n as usize)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

impl TlsSession {
	pub(crate) fn server(conn: ServerConnection) -> Self {
		Self { engine: Engine::Server(conn) }
	}

	pub(crate) fn client(conn: ClientConnection) -> Self {
		Self { engine: Engine::Client(conn) }
	}

	pub fn is_server(&self) -> bool {
		matches!(self.engine, Engine::Server(_))
	}

	/// True once the handshake has finished.
	pub fn is_negotiated(&self) -> bool {
		!engine!(&self.engine, c => c.is_handshaking())
	}

	/// True while rustls holds decrypted bytes not yet handed to the caller.
	pub fn has_buffered(&mut self) -> bool {
		let state = engine!(&mut self.engine, c => c.process_new_packets());
		state.map(|state| state.plaintext_bytes_to_read() > 0).unwrap_or(false)
	}

	/// Advances the handshake as far as the socket allows without blocking.
	///
	/// On failure the alert rustls produced is written best-effort before
	/// the error is returned.
	pub fn negotiate(&mut self, fd: RawFd, timeout: Duration) -> Result<Handshake, TlsError> {
		let mut io = FdIo(fd);
		loop {
			self.flush(fd, timeout)?;
			if self.is_negotiated() {
				return Ok(Handshake::Complete);
			}
			if !engine!(&self.engine, c => c.wants_read()) {
				return Ok(Handshake::Pending);
			}

			match engine!(&mut self.engine, c => c.read_tls(&mut io)) {
				Ok(0) => return Err(TlsError::Closed),
				Ok(_) => {
					if let Err(err) = engine!(&mut self.engine, c => c.process_new_packets()) {
						let _ = engine!(&mut self.engine, c => c.write_tls(&mut io));
						return Err(TlsError::Handshake(err));
					}
				}
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Handshake::Pending),
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(TlsError::Io(e)),
			}
		}
	}

	/// Reads decrypted bytes.
	///
	/// Buffered plaintext is returned first; the socket is only read when
	/// rustls has nothing left.
	pub fn receive(&mut self, fd: RawFd, buf: &mut [u8], timeout: Duration) -> std::io::Result<Received> {
		if buf.is_empty() {
			return Ok(Received::Data(0));
		}
		let mut io = FdIo(fd);
		loop {
			match engine!(&mut self.engine, c => c.reader().read(buf)) {
				Ok(0) => return Ok(Received::Closed),
				Ok(n) => return Ok(Received::Data(n)),
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
				Err(e) => return Err(e),
			}

			match engine!(&mut self.engine, c => c.read_tls(&mut io)) {
				Ok(0) => return Ok(Received::Closed),
				Ok(_) => {
					let state = engine!(&mut self.engine, c => c.process_new_packets());
					state.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
					// Post-handshake messages (tickets, key updates) may need a reply.
					self.flush(fd, timeout)?;
				}
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Received::WouldBlock),
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}
		}
	}

	/// Encrypts and writes the whole buffer.
	pub fn send(&mut self, fd: RawFd, buf: &[u8], timeout: Duration) -> std::io::Result<usize> {
		for chunk in buf.chunks(CHUNK) {
			let queued = engine!(&mut self.engine, c => c.writer().write_all(chunk));
			queued?;
			self.flush(fd, timeout)?;
		}
		Ok(buf.len())
	}

	/// Sends `close_notify`. The descriptor itself is left to the owner.
	pub fn close(&mut self, fd: RawFd) {
		engine!(&mut self.engine, c => c.send_close_notify());
		if let Err(e) = self.flush(fd, Duration::from_millis(100)) {
			tracing::trace!(error = %e, "close_notify not delivered");
		}
	}

	/// Writes every pending TLS record, waiting for writability up to `timeout`.
	fn flush(&mut self, fd: RawFd, timeout: Duration) -> std::io::Result<()> {
		let mut io = FdIo(fd);
		while engine!(&self.engine, c => c.wants_write()) {
			match engine!(&mut self.engine, c => c.write_tls(&mut io)) {
				Ok(_) => {}
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
					if !wait_ready(fd, libc::POLLOUT, timeout)? {
						return Err(IoError::TimedOut { op: "tls write" }.into());
					}
				}
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}
}

impl std::fmt::Debug for TlsSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsSession")
			.field("server", &self.is_server())
			.field("negotiated", &self.is_negotiated())
			.finish()
	}
}
