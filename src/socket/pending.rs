use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{IoError, SocketError, errno};
use super::stream::wait_ready;

/// Reads and clears the socket error status (`SO_ERROR`).
///
/// Returns `None` if no error (connect succeeded).
/// Reading clears the error, so only call once per attempt.
pub fn take_error(fd: RawFd) -> std::io::Result<Option<std::io::Error>> {
    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == -1 {
        return Err(SocketError::GetOption { errno: errno(), option: "SO_ERROR" }.into());
    }

    if error == 0 {
        Ok(None)
    } else {
        Ok(Some(std::io::Error::from_raw_os_error(error)))
    }
}

/// Completes a non-blocking connect started with `RawSocket::start_connect`.
///
/// Waits up to `timeout` for writability, then checks `SO_ERROR`.
pub fn finish_connect(fd: RawFd, timeout: Duration) -> std::io::Result<()> {
    if !wait_ready(fd, libc::POLLOUT, timeout)? {
        return Err(IoError::TimedOut { op: "connect" }.into());
    }
    match take_error(fd)? {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Family, SockAddr, SocketAddrV4};
    use crate::socket::{Kind, RawSocket};

    #[test]
    fn refused_connect_surfaces_errno() {
        // Bind without listening so the port is reserved but refuses connects.
        let reserved = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
        reserved.bind(&SockAddr::V4(SocketAddrV4::new([127, 0, 0, 1], 0))).unwrap();
        let target = reserved.local_addr().unwrap();

        let client = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
        client.set_nonblocking(true).unwrap();
        let result = match client.start_connect(&target) {
            Ok(true) => Ok(()),
            Ok(false) => finish_connect(client.as_raw_fd(), Duration::from_secs(2)),
            Err(e) => Err(e),
        };
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::ConnectionRefused);
    }
}
