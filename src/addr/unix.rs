use std::fmt;
use std::path::PathBuf;
use crate::addr::ToSockAddr;

/// Unix domain socket address (file path or abstract).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixAddr {
	path: Vec<u8>,
	/// True if this is an abstract socket (Linux-only, no filesystem entry).
	is_abstract: bool,
}

/// Capacity of `sun_path`, including the terminating NUL.
pub(crate) const SUN_PATH_MAX: usize = 108;

impl UnixAddr {
	/// Creates a new Unix address from a filesystem path.
	pub fn new<P: AsRef<[u8]>>(path: P) -> Self {
		Self {
			path: path.as_ref().to_vec(),
			is_abstract: false,
		}
	}

	/// Creates an abstract socket address (Linux-only).
	///
	/// Abstract sockets exist only in memory, so there is nothing to unlink.
	pub fn abstract_socket<P: AsRef<[u8]>>(name: P) -> Self {
		Self {
			path: name.as_ref().to_vec(),
			is_abstract: true,
		}
	}

	/// Address of an unnamed socket (the client end of an accepted connection).
	pub fn unnamed() -> Self {
		Self { path: Vec::new(), is_abstract: false }
	}

	/// Returns true if this is an abstract socket.
	pub fn is_abstract(&self) -> bool {
		self.is_abstract
	}

	pub fn is_unnamed(&self) -> bool {
		self.path.is_empty()
	}

	/// Returns the path bytes.
	pub fn path(&self) -> &[u8] {
		&self.path
	}

	/// Filesystem path to unlink, None for abstract and unnamed addresses.
	pub fn to_path(&self) -> Option<PathBuf> {
		use std::os::unix::ffi::OsStrExt;
		if self.is_abstract || self.is_unnamed() {
			return None;
		}
		Some(PathBuf::from(std::ffi::OsStr::from_bytes(&self.path)))
	}

	/// Converts to the raw sockaddr_un and the length to pass to the kernel.
	pub(crate) fn to_raw(&self) -> Option<(libc::sockaddr_un, libc::socklen_t)> {
		let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
		addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
		let offset = std::mem::size_of::<libc::sa_family_t>();

		if self.is_abstract {
			// sun_path[0] stays NUL, the name follows.
			if self.path.len() + 1 > addr.sun_path.len() {
				return None;
			}
			for (i, &byte) in self.path.iter().enumerate() {
				addr.sun_path[i + 1] = byte as libc::c_char;
			}
			Some((addr, (offset + 1 + self.path.len()) as libc::socklen_t))
		} else {
			if self.path.len() >= addr.sun_path.len() {
				return None;
			}
			for (i, &byte) in self.path.iter().enumerate() {
				addr.sun_path[i] = byte as libc::c_char;
			}
			Some((addr, (offset + self.path.len() + 1) as libc::socklen_t))
		}
	}

	/// Creates from raw sockaddr_un; `path_len` is the kernel length minus the family field.
	pub(crate) fn from_raw(raw: &libc::sockaddr_un, path_len: usize) -> Self {
		let path_len = path_len.min(raw.sun_path.len());
		if path_len == 0 {
			return Self::unnamed();
		}
		if raw.sun_path[0] == 0 {
			let path = raw.sun_path[1..path_len].iter().map(|&c| c as u8).collect();
			Self { path, is_abstract: true }
		} else {
			let end = raw.sun_path[..path_len]
				.iter()
				.position(|&c| c == 0)
				.unwrap_or(path_len);
			let path = raw.sun_path[..end].iter().map(|&c| c as u8).collect();
			Self { path, is_abstract: false }
		}
	}
}

impl fmt::Display for UnixAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_unnamed() {
			f.write_str("(unnamed)")
		} else if self.is_abstract {
			write!(f, "@{}", String::from_utf8_lossy(&self.path))
		} else {
			f.write_str(&String::from_utf8_lossy(&self.path))
		}
	}
}

impl ToSockAddr for UnixAddr {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		// None if the path does not fit in sun_path.
		let (raw, len) = self.to_raw()?;
		let ptr = &raw as *const _ as *const libc::sockaddr;
		Some(f(ptr, len))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn abstract_length_excludes_padding() {
		let addr = UnixAddr::abstract_socket("ctl");
		let (raw, len) = addr.to_raw().unwrap();
		assert_eq!(len as usize, std::mem::size_of::<libc::sa_family_t>() + 4);
		assert_eq!(UnixAddr::from_raw(&raw, 4), addr);
		assert_eq!(addr.to_string(), "@ctl");
		assert!(addr.to_path().is_none());
	}

	#[test]
	fn overlong_path_is_rejected() {
		let long = "x".repeat(SUN_PATH_MAX);
		assert!(UnixAddr::new(&long).to_raw().is_none());
		assert!(UnixAddr::new(&long[1..]).to_raw().is_some());
	}

	#[test]
	fn filesystem_path_roundtrip() {
		let addr = UnixAddr::new("/tmp/media.sock");
		let (raw, len) = addr.to_raw().unwrap();
		let path_len = len as usize - std::mem::size_of::<libc::sa_family_t>();
		assert_eq!(UnixAddr::from_raw(&raw, path_len), addr);
		assert_eq!(addr.to_path().unwrap(), PathBuf::from("/tmp/media.sock"));
	}
}
