use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::addr::{Family, SockAddr, ToSockAddr};
use crate::error::{SocketError, errno};
use super::Kind;

/// An owned socket descriptor.
///
/// The descriptor is created with `SOCK_CLOEXEC` and closed on drop.
#[derive(Debug)]
pub struct RawSocket {
	fd: OwnedFd,
}

impl RawSocket {
	/// Creates a new socket.
	///
	/// Calls the `socket()` syscall with the given family and type.
	pub fn new(family: Family, kind: Kind) -> std::io::Result<Self> {
		let fd = unsafe {
			libc::socket(family.raw(), kind.raw() | libc::SOCK_CLOEXEC, 0)
		};
		if fd == -1 {
			return Err(SocketError::Create { errno: errno() }.into());
		}
		Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
	}

	pub(crate) fn from_fd(fd: OwnedFd) -> Self {
		Self { fd }
	}

	/// Returns the raw file descriptor.
	///
	/// Used internally for syscalls. Does not transfer ownership.
	#[inline]
	pub fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}

	/// Sets the socket to non-blocking mode.
	pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
		set_nonblocking(self.as_raw_fd(), nonblocking)
	}

	/// Binds the socket to an address.
	pub fn bind(&self, addr: &SockAddr) -> std::io::Result<()> {
		let result = addr.with_raw(|ptr, len| unsafe {
			libc::bind(self.as_raw_fd(), ptr, len)
		});

		match result {
			Some(-1) => Err(SocketError::Bind {
				errno: errno(),
				addr: addr.to_string(),
			}.into()),
			Some(_) => Ok(()),
			None => Err(SocketError::InvalidAddress {
				reason: "address too long",
			}.into()),
		}
	}

	/// Marks a bound stream socket as passive.
	pub fn listen(&self, backlog: i32) -> std::io::Result<()> {
		let result = unsafe { libc::listen(self.as_raw_fd(), backlog) };
		if result == -1 {
			return Err(SocketError::Listen { errno: errno(), backlog }.into());
		}
		Ok(())
	}

	/// Starts a connection.
	///
	/// Returns `true` when the connection completed immediately and `false`
	/// when a non-blocking connect is in progress (`EINPROGRESS`).
	/// An interrupted connect keeps going in the background, so `EINTR`
	/// is reported as in progress too.
	pub fn start_connect(&self, addr: &SockAddr) -> std::io::Result<bool> {
		let result = addr.with_raw(|ptr, len| unsafe {
			libc::connect(self.as_raw_fd(), ptr, len)
		});

		match result {
			Some(0) => Ok(true),
			Some(_) => {
				let e = errno();
				if e == libc::EINPROGRESS || e == libc::EINTR {
					Ok(false)
				} else {
					Err(SocketError::Connect {
						errno: e,
						addr: addr.to_string(),
					}.into())
				}
			}
			None => Err(SocketError::InvalidAddress {
				reason: "address too long",
			}.into()),
		}
	}

	/// Address the socket is bound to.
	pub fn local_addr(&self) -> std::io::Result<SockAddr> {
		name_of(self.as_raw_fd(), libc::getsockname, "getsockname")
	}

	/// Address of the connected peer.
	pub fn peer_addr(&self) -> std::io::Result<SockAddr> {
		name_of(self.as_raw_fd(), libc::getpeername, "getpeername")
	}
}

/// Sets or clears `O_NONBLOCK` on any descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> std::io::Result<()> {
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags == -1 {
		return Err(SocketError::GetOption { errno: errno(), option: "F_GETFL" }.into());
	}

	let new_flags = if nonblocking {
		flags | libc::O_NONBLOCK
	} else {
		flags & !libc::O_NONBLOCK
	};

	let result = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
	if result == -1 {
		return Err(SocketError::SetOption { errno: errno(), option: "O_NONBLOCK" }.into());
	}
	Ok(())
}

type NameFn = unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn name_of(fd: RawFd, call: NameFn, option: &'static str) -> std::io::Result<SockAddr> {
	let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
	let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

	let result = unsafe { call(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
	if result == -1 {
		return Err(SocketError::GetOption { errno: errno(), option }.into());
	}

	unsafe { SockAddr::from_storage(&storage as *const _ as *const libc::sockaddr, len) }
		.ok_or_else(|| SocketError::InvalidAddress { reason: "unsupported address family" }.into())
}

impl AsRawFd for RawSocket {
	fn as_raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl AsFd for RawSocket {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}

impl FromRawFd for RawSocket {
	unsafe fn from_raw_fd(fd: RawFd) -> Self {
		unsafe { Self { fd: OwnedFd::from_raw_fd(fd) } }
	}
}

impl IntoRawFd for RawSocket {
	fn into_raw_fd(self) -> RawFd {
		self.fd.into_raw_fd()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::SocketAddrV4;

	#[test]
	fn bind_reports_ephemeral_port() {
		let socket = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
		socket.bind(&SockAddr::V4(SocketAddrV4::new([127, 0, 0, 1], 0))).unwrap();
		let local = socket.local_addr().unwrap();
		assert_eq!(local.family(), Family::Ipv4);
		assert_ne!(local.port(), Some(0));
	}

	#[test]
	fn nonblocking_flag_toggles() {
		let socket = RawSocket::new(Family::Ipv4, Kind::Datagram).unwrap();
		socket.set_nonblocking(true).unwrap();
		let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
		assert_ne!(flags & libc::O_NONBLOCK, 0);
		socket.set_nonblocking(false).unwrap();
		let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
		assert_eq!(flags & libc::O_NONBLOCK, 0);
	}
}
