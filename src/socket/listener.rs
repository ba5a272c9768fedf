use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::addr::SockAddr;
use crate::error::{SocketError, errno};
use super::RawSocket;

/// Outcome of a non-blocking accept.
#[derive(Debug)]
pub enum Accepted {
    /// A peer was accepted. Read/write readiness is NOT guaranteed.
    Connection(RawSocket, SockAddr),
    /// No pending connections; wait for readiness.
    WouldBlock,
}

/// Accepts one pending connection from a listening descriptor.
///
/// `flags` go straight to `accept4` (`SOCK_NONBLOCK`, `SOCK_CLOEXEC`).
/// `EINTR` and errors that belong to one queued peer (it gave up, or its
/// network went away) are retried. An empty queue is `WouldBlock`; any
/// other error concerns the listener itself.
pub fn accept(fd: RawFd, flags: libc::c_int) -> std::io::Result<Accepted> {
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let client = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                flags,
            )
        };

        if client == -1 {
            match errno() {
                libc::EINTR | libc::ECONNABORTED | libc::EPROTO | libc::EPERM | libc::ENETDOWN
                | libc::ENETUNREACH | libc::EHOSTDOWN | libc::EHOSTUNREACH | libc::ENONET => continue,
                e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(Accepted::WouldBlock),
                e => return Err(SocketError::Accept { errno: e }.into()),
            }
        }

        let stream = RawSocket::from_fd(unsafe { OwnedFd::from_raw_fd(client) });
        let peer = unsafe {
            SockAddr::from_storage(&storage as *const _ as *const libc::sockaddr, len)
                .ok_or(SocketError::InvalidAddress {
                    reason: "invalid client address",
                })?
        };

        return Ok(Accepted::Connection(stream, peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Family, SocketAddrV4};
    use crate::socket::Kind;

    #[test]
    fn empty_queue_would_block() {
        let listener = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
        listener.bind(&SockAddr::V4(SocketAddrV4::new([127, 0, 0, 1], 0))).unwrap();
        listener.listen(4).unwrap();
        listener.set_nonblocking(true).unwrap();
        assert!(matches!(accept(listener.as_raw_fd(), libc::SOCK_CLOEXEC).unwrap(), Accepted::WouldBlock));
    }

    #[test]
    fn accepted_peer_carries_address() {
        let listener = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
        listener.bind(&SockAddr::V4(SocketAddrV4::new([127, 0, 0, 1], 0))).unwrap();
        listener.listen(4).unwrap();
        let local = listener.local_addr().unwrap();

        let client = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
        assert!(client.start_connect(&local).unwrap());

        match accept(listener.as_raw_fd(), libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK).unwrap() {
            Accepted::Connection(_, peer) => assert_eq!(peer.host_string(), "127.0.0.1"),
            Accepted::WouldBlock => panic!("expected a connection"),
        }
    }
}
