use std::sync::{Arc, Mutex, OnceLock};

use spcore::ipc::{IpcDialer, IpcListener};
use spcore::tcp::{TcpDialer, TcpListener};
use spcore::url::Scheme;
use spcore::{SpError, SpResult, SpUrl, StreamDialer, StreamListener};
use tls::{Mode, TlsConfig, TlsDialer, TlsListener};
use websocket::{WsConfig, WsDialer, WsListener};

/// Options an endpoint carries into transport construction.
#[derive(Default)]
pub struct EpOptions {
    pub tls: Option<Arc<TlsConfig>>,
    pub ws: Option<WsConfig>,
}

/// A stream transport known to the SP layer: it turns URLs into stream dialers
///  and listeners. The SP framing on top is identical for all of them.
pub trait SpTransport: Send + Sync + std::fmt::Debug {
    fn schemes(&self) -> &'static [Scheme];

    fn dialer(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamDialer>>;

    fn listener(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamListener>>;
}

fn registry() -> &'static Mutex<Vec<Arc<dyn SpTransport>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<dyn SpTransport>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(vec![
            Arc::new(TcpTran) as Arc<dyn SpTransport>,
            Arc::new(IpcTran),
            Arc::new(TlsTran),
            Arc::new(WsTran),
        ])
    })
}

/// Register an additional transport for its schemes.
pub fn register(tran: Arc<dyn SpTransport>) {
    registry().lock().unwrap().push(tran);
}

/// Find the transport handling `scheme`; later registrations win.
pub fn find(scheme: Scheme) -> SpResult<Arc<dyn SpTransport>> {
    let reg = registry().lock().unwrap();
    reg.iter()
        .rev()
        .find(|t| t.schemes().contains(&scheme))
        .cloned()
        .ok_or(SpError::NotSupported)
}

#[derive(Debug)]
struct TcpTran;

impl SpTransport for TcpTran {
    fn schemes(&self) -> &'static [Scheme] {
        &[Scheme::Tcp, Scheme::Tcp4, Scheme::Tcp6]
    }

    fn dialer(&self, url: &SpUrl, _opts: &EpOptions) -> SpResult<Box<dyn StreamDialer>> {
        Ok(Box::new(TcpDialer::new(url.clone())?))
    }

    fn listener(&self, url: &SpUrl, _opts: &EpOptions) -> SpResult<Box<dyn StreamListener>> {
        Ok(Box::new(TcpListener::new(url.clone())?))
    }
}

#[derive(Debug)]
struct IpcTran;

impl SpTransport for IpcTran {
    fn schemes(&self) -> &'static [Scheme] {
        &[Scheme::Ipc, Scheme::Abstract]
    }

    fn dialer(&self, url: &SpUrl, _opts: &EpOptions) -> SpResult<Box<dyn StreamDialer>> {
        Ok(Box::new(IpcDialer::new(url.clone())?))
    }

    fn listener(&self, url: &SpUrl, _opts: &EpOptions) -> SpResult<Box<dyn StreamListener>> {
        Ok(Box::new(IpcListener::new(url.clone())?))
    }
}

#[derive(Debug)]
struct TlsTran;

impl SpTransport for TlsTran {
    fn schemes(&self) -> &'static [Scheme] {
        &[Scheme::TlsTcp, Scheme::TlsTcp4, Scheme::TlsTcp6]
    }

    fn dialer(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamDialer>> {
        let cfg = match &opts.tls {
            Some(cfg) => cfg.clone(),
            None => TlsConfig::new(Mode::Client),
        };
        Ok(Box::new(TlsDialer::for_url(url, cfg)?))
    }

    fn listener(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamListener>> {
        let cfg = match &opts.tls {
            Some(cfg) => cfg.clone(),
            None => TlsConfig::new(Mode::Server),
        };
        Ok(Box::new(TlsListener::for_url(url, cfg)?))
    }
}

#[derive(Debug)]
struct WsTran;

/// The SP transport runs the WebSocket layer in message mode: every framing
///  unit (negotiation header, length-prefixed message) travels as one binary
///  WebSocket message.
fn sp_ws_config(opts: &EpOptions) -> WsConfig {
    let mut cfg = opts.ws.clone().unwrap_or_default();
    cfg.stream_mode = false;
    cfg.send_text = false;
    cfg
}

impl SpTransport for WsTran {
    fn schemes(&self) -> &'static [Scheme] {
        &[
            Scheme::Ws,
            Scheme::Ws4,
            Scheme::Ws6,
            Scheme::Wss,
            Scheme::Wss4,
            Scheme::Wss6,
        ]
    }

    fn dialer(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamDialer>> {
        let cfg = sp_ws_config(opts);
        match url.scheme {
            Scheme::Ws | Scheme::Ws4 | Scheme::Ws6 => Ok(Box::new(WsDialer::for_url(url, cfg)?)),
            Scheme::Wss | Scheme::Wss4 | Scheme::Wss6 => {
                let tls_cfg = match &opts.tls {
                    Some(cfg) => cfg.clone(),
                    None => TlsConfig::new(Mode::Client),
                };
                let tls_url = wss_to_tls(url);
                let lower = TlsDialer::for_url(&tls_url, tls_cfg)?;
                Ok(Box::new(WsDialer::new(
                    Box::new(lower),
                    &url.host_port(),
                    &url.path,
                    cfg,
                )))
            }
            _ => Err(SpError::InvalidAddress),
        }
    }

    fn listener(&self, url: &SpUrl, opts: &EpOptions) -> SpResult<Box<dyn StreamListener>> {
        let cfg = sp_ws_config(opts);
        match url.scheme {
            Scheme::Ws | Scheme::Ws4 | Scheme::Ws6 => {
                Ok(Box::new(WsListener::for_url(url, cfg)?))
            }
            Scheme::Wss | Scheme::Wss4 | Scheme::Wss6 => {
                let tls_cfg = match &opts.tls {
                    Some(cfg) => cfg.clone(),
                    None => TlsConfig::new(Mode::Server),
                };
                let tls_url = wss_to_tls(url);
                let lower = TlsListener::for_url(&tls_url, tls_cfg)?;
                Ok(Box::new(WsListener::new(Box::new(lower), cfg)))
            }
            _ => Err(SpError::InvalidAddress),
        }
    }
}

fn wss_to_tls(url: &SpUrl) -> SpUrl {
    let scheme = match url.scheme {
        Scheme::Wss4 => Scheme::TlsTcp4,
        Scheme::Wss6 => Scheme::TlsTcp6,
        _ => Scheme::TlsTcp,
    };
    SpUrl {
        scheme,
        host: url.host.clone(),
        port: url.port,
        path: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_builtin_schemes() {
        for scheme in [
            Scheme::Tcp,
            Scheme::Tcp6,
            Scheme::Ipc,
            Scheme::TlsTcp,
            Scheme::Ws,
            Scheme::Wss,
        ] {
            assert!(find(scheme).is_ok(), "{:?} must resolve", scheme);
        }
    }

    #[test]
    fn test_inproc_is_not_registered() {
        assert_eq!(find(Scheme::Inproc).unwrap_err(), SpError::NotSupported);
    }
}
