use std::sync::{Arc, Mutex};

use spcore::{SpError, SpResult};

/// Which side of the handshake this configuration drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Peer certificate requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Optional,
    Required,
}

/// Permitted protocol versions. Anything older than 1.2 is rejected at
///  configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

#[derive(Debug, Clone)]
pub struct CertKey {
    pub cert: String,
    pub key: String,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Psk {
    pub identity: String,
    pub key: Vec<u8>,
}

struct ConfigInner {
    server_name: Option<String>,
    auth_mode: AuthMode,
    min_version: TlsVersion,
    max_version: TlsVersion,
    ca_chain: Vec<String>,
    own_certs: Vec<CertKey>,
    psks: Vec<Psk>,
    busy: bool,
}

/// Shared TLS configuration. Once bound to a dialer or listener (or otherwise used
///  to start an operation) it becomes busy and the setters fail with `Busy`; the
///  engine may then read it from any thread without further coordination.
pub struct TlsConfig {
    mode: Mode,
    inner: Mutex<ConfigInner>,
}

impl TlsConfig {
    pub fn new(mode: Mode) -> Arc<TlsConfig> {
        Arc::new(TlsConfig {
            mode,
            inner: Mutex::new(ConfigInner {
                server_name: None,
                auth_mode: match mode {
                    Mode::Client => AuthMode::Required,
                    Mode::Server => AuthMode::None,
                },
                min_version: TlsVersion::Tls12,
                max_version: TlsVersion::Tls13,
                ca_chain: Vec::new(),
                own_certs: Vec::new(),
                psks: Vec::new(),
                busy: false,
            }),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mark the configuration immutable. Called by dialers/listeners on first use.
    pub fn mark_busy(&self) {
        self.inner.lock().unwrap().busy = true;
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    fn mutate(&self, f: impl FnOnce(&mut ConfigInner) -> SpResult<()>) -> SpResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.busy {
            return Err(SpError::Busy);
        }
        f(&mut inner)
    }

    pub fn set_server_name(&self, name: &str) -> SpResult<()> {
        self.mutate(|c| {
            c.server_name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn set_auth_mode(&self, mode: AuthMode) -> SpResult<()> {
        self.mutate(|c| {
            c.auth_mode = mode;
            Ok(())
        })
    }

    pub fn set_versions(&self, min: TlsVersion, max: TlsVersion) -> SpResult<()> {
        if min > max {
            return Err(SpError::InvalidArgument);
        }
        self.mutate(|c| {
            c.min_version = min;
            c.max_version = max;
            Ok(())
        })
    }

    /// Append a PEM CA chain used to validate peers.
    pub fn add_ca_chain(&self, pem: &str) -> SpResult<()> {
        if pem.is_empty() {
            return Err(SpError::InvalidArgument);
        }
        self.mutate(|c| {
            c.ca_chain.push(pem.to_string());
            Ok(())
        })
    }

    /// Install our own certificate and key. Servers may call this repeatedly to
    ///  offer several certificates (e.g. RSA and ECDSA).
    pub fn set_own_cert(&self, cert: &str, key: &str, passphrase: Option<&str>) -> SpResult<()> {
        if cert.is_empty() || key.is_empty() {
            return Err(SpError::InvalidArgument);
        }
        self.mutate(|c| {
            c.own_certs.push(CertKey {
                cert: cert.to_string(),
                key: key.to_string(),
                passphrase: passphrase.map(str::to_string),
            });
            Ok(())
        })
    }

    /// Register a pre-shared key. A server accumulates identities (looked up at
    ///  handshake time); a client may hold exactly one.
    pub fn set_psk(&self, identity: &str, key: &[u8]) -> SpResult<()> {
        if identity.is_empty() || key.is_empty() {
            return Err(SpError::InvalidArgument);
        }
        let client = self.mode == Mode::Client;
        self.mutate(|c| {
            if client && !c.psks.is_empty() {
                return Err(SpError::Busy);
            }
            c.psks.retain(|p| p.identity != identity);
            c.psks.push(Psk {
                identity: identity.to_string(),
                key: key.to_vec(),
            });
            Ok(())
        })
    }

    // Read side, for engines.

    pub fn server_name(&self) -> Option<String> {
        self.inner.lock().unwrap().server_name.clone()
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.inner.lock().unwrap().auth_mode
    }

    pub fn versions(&self) -> (TlsVersion, TlsVersion) {
        let inner = self.inner.lock().unwrap();
        (inner.min_version, inner.max_version)
    }

    pub fn ca_chain(&self) -> Vec<String> {
        self.inner.lock().unwrap().ca_chain.clone()
    }

    pub fn own_certs(&self) -> Vec<CertKey> {
        self.inner.lock().unwrap().own_certs.clone()
    }

    pub fn psks(&self) -> Vec<Psk> {
        self.inner.lock().unwrap().psks.clone()
    }

    pub fn psk_for(&self, identity: &str) -> Option<Psk> {
        self.inner
            .lock()
            .unwrap()
            .psks
            .iter()
            .find(|p| p.identity == identity)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_fail_once_busy() {
        let cfg = TlsConfig::new(Mode::Client);
        cfg.set_server_name("example.org").unwrap();
        cfg.mark_busy();
        assert_eq!(cfg.set_server_name("other.org"), Err(SpError::Busy));
        assert_eq!(cfg.set_auth_mode(AuthMode::None), Err(SpError::Busy));
        assert_eq!(cfg.server_name().as_deref(), Some("example.org"));
    }

    #[test]
    fn test_version_bounds() {
        let cfg = TlsConfig::new(Mode::Server);
        cfg.set_versions(TlsVersion::Tls12, TlsVersion::Tls13).unwrap();
        cfg.set_versions(TlsVersion::Tls13, TlsVersion::Tls13).unwrap();
        assert_eq!(
            cfg.set_versions(TlsVersion::Tls13, TlsVersion::Tls12),
            Err(SpError::InvalidArgument)
        );
    }

    #[test]
    fn test_psk_single_on_client() {
        let cfg = TlsConfig::new(Mode::Client);
        cfg.set_psk("me", &[1, 2, 3]).unwrap();
        assert_eq!(cfg.set_psk("me2", &[4]), Err(SpError::Busy));
    }

    #[test]
    fn test_psk_multiple_on_server() {
        let cfg = TlsConfig::new(Mode::Server);
        cfg.set_psk("alice", &[1]).unwrap();
        cfg.set_psk("bob", &[2]).unwrap();
        cfg.set_psk("alice", &[3]).unwrap(); // replaces
        assert_eq!(cfg.psks().len(), 2);
        assert_eq!(cfg.psk_for("alice").unwrap().key, vec![3]);
        assert!(cfg.psk_for("carol").is_none());
    }

    #[test]
    fn test_default_auth_modes() {
        assert_eq!(TlsConfig::new(Mode::Client).auth_mode(), AuthMode::Required);
        assert_eq!(TlsConfig::new(Mode::Server).auth_mode(), AuthMode::None);
    }
}
