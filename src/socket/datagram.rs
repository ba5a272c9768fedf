use std::os::fd::RawFd;

use crate::addr::{SockAddr, ToSockAddr};
use crate::error::{SocketError, IoError, errno};

/// Sends one datagram to `addr`.
///
/// Returns the number of bytes sent. Interrupted sends are retried.
pub fn send_to(fd: RawFd, buf: &[u8], addr: &SockAddr) -> std::io::Result<usize> {
	loop {
		let result = addr.with_raw(|ptr, len| unsafe {
			libc::sendto(
				fd,
				buf.as_ptr() as *const libc::c_void,
				buf.len(),
				libc::MSG_NOSIGNAL,
				ptr,
				len,
			)
		});

		match result {
			Some(n) if n >= 0 => return Ok(n as usize),
			Some(_) => match errno() {
				libc::EINTR => continue,
				e => return Err(IoError::Write { errno: e }.into()),
			},
			None => return Err(SocketError::InvalidAddress { reason: "address too long" }.into()),
		}
	}
}

/// Receives one datagram and its sender.
///
/// Returns `None` when no datagram is queued.
pub fn receive_from(fd: RawFd, buf: &mut [u8]) -> std::io::Result<Option<(usize, SockAddr)>> {
	loop {
		let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
		let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

		let n = unsafe {
			libc::recvfrom(
				fd,
				buf.as_mut_ptr() as *mut libc::c_void,
				buf.len(),
				0,
				&mut storage as *mut _ as *mut libc::sockaddr,
				&mut len,
			)
		};

		if n == -1 {
			match errno() {
				libc::EINTR => continue,
				e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(None),
				e => return Err(IoError::Read { errno: e }.into()),
			}
		}

		let addr = unsafe {
			SockAddr::from_storage(&storage as *const _ as *const libc::sockaddr, len)
		};
		// Unbound UNIX datagram senders have no address at all.
		let addr = addr.unwrap_or_else(|| SockAddr::Unix(crate::addr::UnixAddr::unnamed()));
		return Ok(Some((n as usize, addr)));
	}
}

/// Receives the next datagram whose sender shares a host with `peer`.
///
/// Datagrams from other hosts are dropped. With no peer every datagram passes.
pub fn receive_filtered(fd: RawFd, buf: &mut [u8], peer: Option<&SockAddr>) -> std::io::Result<Option<(usize, SockAddr)>> {
	loop {
		match receive_from(fd, buf)? {
			Some((n, from)) => match peer {
				Some(peer) if !peer.same_host(&from) => {
					tracing::trace!(%from, expected = %peer, "dropping datagram from foreign host");
					continue;
				}
				_ => return Ok(Some((n, from))),
			},
			None => return Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::{Family, SocketAddrV4};
	use crate::socket::{Kind, RawSocket};

	fn bound() -> (RawSocket, SockAddr) {
		let socket = RawSocket::new(Family::Ipv4, Kind::Datagram).unwrap();
		socket.bind(&SockAddr::V4(SocketAddrV4::new([127, 0, 0, 1], 0))).unwrap();
		socket.set_nonblocking(true).unwrap();
		let addr = socket.local_addr().unwrap();
		(socket, addr)
	}

	#[test]
	fn datagram_keeps_boundaries_and_sender() {
		let (rx, rx_addr) = bound();
		let (tx, tx_addr) = bound();
		let mut buf = [0u8; 64];
		assert!(receive_from(rx.as_raw_fd(), &mut buf).unwrap().is_none());

		send_to(tx.as_raw_fd(), b"one", &rx_addr).unwrap();
		send_to(tx.as_raw_fd(), b"three", &rx_addr).unwrap();
		crate::socket::wait_ready(rx.as_raw_fd(), libc::POLLIN, std::time::Duration::from_secs(1)).unwrap();

		let (n, from) = receive_from(rx.as_raw_fd(), &mut buf).unwrap().unwrap();
		assert_eq!(&buf[..n], b"one");
		assert_eq!(from, tx_addr);
		let (n, _) = receive_from(rx.as_raw_fd(), &mut buf).unwrap().unwrap();
		assert_eq!(&buf[..n], b"three");
	}

	#[test]
	fn filter_drops_foreign_hosts() {
		let (rx, rx_addr) = bound();
		let (tx, _) = bound();
		send_to(tx.as_raw_fd(), b"x", &rx_addr).unwrap();
		crate::socket::wait_ready(rx.as_raw_fd(), libc::POLLIN, std::time::Duration::from_secs(1)).unwrap();

		let other = SockAddr::V4(SocketAddrV4::new([10, 9, 8, 7], 1));
		let mut buf = [0u8; 8];
		assert!(receive_filtered(rx.as_raw_fd(), &mut buf, Some(&other)).unwrap().is_none());
	}
}
