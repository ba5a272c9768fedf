//! TLS engine interface over rustls.
//!
//! `TlsContext` holds certificate material for one socket; every connection
//! gets its own `TlsSession`, driven non-blockingly from readiness events.

mod config;
mod session;

pub use self::config::TlsContext;
pub use self::session::{Handshake, TlsSession};
