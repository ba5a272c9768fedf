use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::TlsError;
use crate::socket::Role;
use super::session::TlsSession;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum Side {
	Server(Arc<ServerConfig>),
	Client {
		config: Arc<ClientConfig>,
		server_name: ServerName<'static>,
	},
}

/// Certificate material and settings shared by every session of one socket.
pub struct TlsContext {
	side: Side,
	handshake_timeout: Duration,
}

impl TlsContext {
	/// Server context presenting `certs` (leaf first) signed by `key`.
	pub fn server(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self, TlsError> {
		let config = ServerConfig::builder_with_provider(provider())
			.with_safe_default_protocol_versions()?
			.with_no_client_auth()
			.with_single_cert(certs, key)?;
		Ok(Self::from_server_config(Arc::new(config)))
	}

	/// Server context from PEM files.
	pub fn server_from_pem(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, TlsError> {
		let certs = load_certs(cert_path.as_ref())?;
		let key = load_key(key_path.as_ref())?;
		Self::server(certs, key)
	}

	/// Client context trusting `roots` and expecting the peer to be `server_name`.
	pub fn client(roots: Vec<CertificateDer<'static>>, server_name: &str) -> Result<Self, TlsError> {
		let mut store = RootCertStore::empty();
		for root in roots {
			store.add(root)?;
		}
		let config = ClientConfig::builder_with_provider(provider())
			.with_safe_default_protocol_versions()?
			.with_root_certificates(store)
			.with_no_client_auth();
		Self::from_client_config(Arc::new(config), server_name)
	}

	/// Client context trusting the certificates in a PEM bundle.
	pub fn client_from_pem(ca_path: impl AsRef<Path>, server_name: &str) -> Result<Self, TlsError> {
		Self::client(load_certs(ca_path.as_ref())?, server_name)
	}

	pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
		Self {
			side: Side::Server(config),
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		}
	}

	pub fn from_client_config(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
		let server_name = ServerName::try_from(server_name)
			.map_err(|_| TlsError::ServerName(server_name.to_owned()))?
			.to_owned();
		Ok(Self {
			side: Side::Client { config, server_name },
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
		})
	}

	pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
		self.handshake_timeout = timeout;
		self
	}

	/// How long a connection may stay in the handshake before it is dropped.
	pub fn handshake_timeout(&self) -> Duration {
		self.handshake_timeout
	}

	pub fn role(&self) -> Role {
		match self.side {
			Side::Server(_) => Role::Server,
			Side::Client { .. } => Role::Client,
		}
	}

	/// Starts a fresh session for one connection.
	pub fn create_session(&self) -> Result<TlsSession, TlsError> {
		match &self.side {
			Side::Server(config) => Ok(TlsSession::server(ServerConnection::new(config.clone())?)),
			Side::Client { config, server_name } => {
				Ok(TlsSession::client(ClientConnection::new(config.clone(), server_name.clone())?))
			}
		}
	}
}

impl std::fmt::Debug for TlsContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsContext")
			.field("role", &self.role())
			.field("handshake_timeout", &self.handshake_timeout)
			.finish()
	}
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
	File::open(path)
		.map(BufReader::new)
		.map_err(|source| TlsError::Pem { path: path.display().to_string(), source })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let mut reader = open(path)?;
	rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|source| TlsError::Pem { path: path.display().to_string(), source })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let mut reader = open(path)?;
	rustls_pemfile::private_key(&mut reader)
		.map_err(|source| TlsError::Pem { path: path.display().to_string(), source })?
		.ok_or_else(|| TlsError::MissingKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_bad_server_name() {
		let err = TlsContext::client(Vec::new(), "not a host name!").unwrap_err();
		assert!(matches!(err, TlsError::ServerName(_)));
	}

	#[test]
	fn missing_pem_is_reported_with_path() {
		let err = TlsContext::server_from_pem("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
		match err {
			TlsError::Pem { path, .. } => assert!(path.contains("cert.pem")),
			other => panic!("unexpected error {other}"),
		}
	}

	#[test]
	fn client_context_creates_sessions() {
		let ctx = TlsContext::client(Vec::new(), "localhost").unwrap();
		assert_eq!(ctx.role(), Role::Client);
		let session = ctx.create_session().unwrap();
		assert!(!session.is_negotiated());
	}
}
