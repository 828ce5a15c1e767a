//! Connection configuration consumed (not produced) by this crate.
//!
//! DSN/credential resolution, config-file loading, and environment lookup
//! are external collaborators (spec §1); this module only defines the
//! resolved shape they hand to [`Pool`](crate::connection::pool::Pool) and
//! [`ProtocolConnection`](crate::connection::ProtocolConnection).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// TLS verification strictness, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSecurity {
    /// Skip all certificate verification. Only ever appropriate for local
    /// development against a throwaway server.
    Insecure,
    /// Validate the certificate chain but not the hostname.
    NoHostVerification,
    /// Validate both the chain and the hostname.
    Strict,
}

/// The network address of the server.
#[derive(Debug, Clone)]
pub enum Addr {
    /// `host:port`, connected to over TCP.
    Tcp { host: String, port: u16 },
    /// A filesystem path to a Unix domain socket.
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

/// Resolved connection parameters. Produced by an external DSN/credential
/// resolver; this crate only ever reads it.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub addr: Addr,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub branch: Option<String>,
    pub secret_key: Option<String>,
    pub connect_timeout: Duration,
    pub wait_until_available: Duration,
    pub tls_ca_pem: Option<String>,
    pub tls_security: TlsSecurity,
    pub tls_server_name: Option<String>,
    pub server_settings: HashMap<String, Vec<u8>>,
}

impl ConnectionConfig {
    /// The `host:port` used for TCP dialing. Panics if `addr` is a Unix
    /// socket; callers on that path should match on `addr` directly.
    pub fn tcp_target(&self) -> Option<(&str, u16)> {
        match &self.addr {
            Addr::Tcp { host, port } => Some((host.as_str(), *port)),
            #[cfg(unix)]
            Addr::Unix(_) => None,
        }
    }

    /// The name used for the branch/database parameter in the handshake,
    /// preferring `branch` (protocol >= 2.0) and falling back to `database`.
    pub fn branch_or_database(&self) -> Result<&str> {
        self.branch
            .as_deref()
            .or(self.database.as_deref())
            .ok_or_else(|| {
                Error::Configuration("one of `branch` or `database` must be set".into())
            })
    }
}

/// A seam for obtaining the system's trusted root certificates.
///
/// Platform-specific certificate-store lookup is explicitly out of scope
/// for this crate's core (spec §1); this trait is what that external
/// lookup plugs into. [`NativeRootCertSource`] provides a ready-made
/// implementation for callers who don't want to supply their own.
pub trait RootCertSource: Send + Sync {
    fn root_store(&self) -> Result<rustls::RootCertStore>;
}

/// Default [`RootCertSource`], backed by `rustls-native-certs`.
#[derive(Debug, Default)]
pub struct NativeRootCertSource;

impl RootCertSource for NativeRootCertSource {
    fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut store = rustls::RootCertStore::empty();
        let result = rustls_native_certs::load_native_certs();

        for err in &result.errors {
            log::warn!("error loading a native root certificate: {err}");
        }

        let (added, _skipped) = store.add_parsable_certificates(result.certs);
        if added == 0 {
            return Err(Error::Configuration(
                "no usable root certificates found in the platform trust store".into(),
            ));
        }

        Ok(store)
    }
}

/// Builds a [`rustls::RootCertStore`] from `tls_ca_pem` if present,
/// otherwise consults `source`.
pub fn root_store_for(
    tls_ca_pem: Option<&str>,
    source: &Arc<dyn RootCertSource>,
) -> Result<rustls::RootCertStore> {
    match tls_ca_pem {
        Some(pem) if !pem.is_empty() => {
            let mut store = rustls::RootCertStore::empty();
            let mut reader = std::io::Cursor::new(pem.as_bytes());
            let certs: std::result::Result<Vec<_>, _> =
                rustls_pemfile::certs(&mut reader).collect();
            let certs = certs.map_err(|e| {
                Error::Configuration(format!("invalid `tls_ca_pem`: {e}"))
            })?;

            let (added, _skipped) = store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(Error::Configuration(
                    "`tls_ca_pem` contained no usable certificates".into(),
                ));
            }

            Ok(store)
        }
        _ => source.root_store(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_preferred_over_database() {
        let cfg = base_config();
        assert_eq!(cfg.branch_or_database().unwrap(), "main");
    }

    #[test]
    fn database_used_when_branch_absent() {
        let mut cfg = base_config();
        cfg.branch = None;
        assert_eq!(cfg.branch_or_database().unwrap(), "mydb");
    }

    #[test]
    fn neither_set_is_a_configuration_error() {
        let mut cfg = base_config();
        cfg.branch = None;
        cfg.database = None;
        assert!(matches!(
            cfg.branch_or_database(),
            Err(Error::Configuration(_))
        ));
    }

    fn base_config() -> ConnectionConfig {
        ConnectionConfig {
            addr: Addr::Tcp {
                host: "localhost".into(),
                port: 5656,
            },
            user: "admin".into(),
            password: None,
            database: Some("mydb".into()),
            branch: Some("main".into()),
            secret_key: None,
            connect_timeout: Duration::from_secs(10),
            wait_until_available: Duration::from_secs(30),
            tls_ca_pem: None,
            tls_security: TlsSecurity::Strict,
            tls_server_name: None,
            server_settings: HashMap::new(),
        }
    }
}
