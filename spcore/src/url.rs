use std::fmt;

use crate::error::{SpError, SpResult};

/// The URL schemes understood by the stream-transport core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Tcp4,
    Tcp6,
    Ipc,
    Abstract,
    Inproc,
    TlsTcp,
    TlsTcp4,
    TlsTcp6,
    Ws,
    Ws4,
    Ws6,
    Wss,
    Wss4,
    Wss6,
}

impl Scheme {
    pub fn parse(s: &str) -> SpResult<Scheme> {
        Ok(match s {
            "tcp" => Scheme::Tcp,
            "tcp4" => Scheme::Tcp4,
            "tcp6" => Scheme::Tcp6,
            // unix is an alias kept for interoperability
            "ipc" | "unix" => Scheme::Ipc,
            "abstract" => Scheme::Abstract,
            "inproc" => Scheme::Inproc,
            "tls+tcp" => Scheme::TlsTcp,
            "tls+tcp4" => Scheme::TlsTcp4,
            "tls+tcp6" => Scheme::TlsTcp6,
            "ws" => Scheme::Ws,
            "ws4" => Scheme::Ws4,
            "ws6" => Scheme::Ws6,
            "wss" => Scheme::Wss,
            "wss4" => Scheme::Wss4,
            "wss6" => Scheme::Wss6,
            _ => return Err(SpError::InvalidAddress),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tcp4 => "tcp4",
            Scheme::Tcp6 => "tcp6",
            Scheme::Ipc => "ipc",
            Scheme::Abstract => "abstract",
            Scheme::Inproc => "inproc",
            Scheme::TlsTcp => "tls+tcp",
            Scheme::TlsTcp4 => "tls+tcp4",
            Scheme::TlsTcp6 => "tls+tcp6",
            Scheme::Ws => "ws",
            Scheme::Ws4 => "ws4",
            Scheme::Ws6 => "ws6",
            Scheme::Wss => "wss",
            Scheme::Wss4 => "wss4",
            Scheme::Wss6 => "wss6",
        }
    }

    /// Does this scheme address a host:port endpoint (as opposed to a path)?
    pub fn has_host(&self) -> bool {
        !matches!(self, Scheme::Ipc | Scheme::Abstract | Scheme::Inproc)
    }

    /// Restriction to one IP family, if the scheme carries one.
    pub fn ip_family(&self) -> Option<IpFamily> {
        match self {
            Scheme::Tcp4 | Scheme::TlsTcp4 | Scheme::Ws4 | Scheme::Wss4 => Some(IpFamily::V4),
            Scheme::Tcp6 | Scheme::TlsTcp6 | Scheme::Ws6 | Scheme::Wss6 => Some(IpFamily::V6),
            _ => None,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(
            self,
            Scheme::Ws | Scheme::Ws4 | Scheme::Ws6 | Scheme::Wss | Scheme::Wss4 | Scheme::Wss6
        )
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Scheme::Ws | Scheme::Ws4 | Scheme::Ws6 => Some(80),
            Scheme::Wss | Scheme::Wss4 | Scheme::Wss6 => Some(443),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// A parsed SP address, e.g. `tcp://127.0.0.1:4000`, `ipc:///tmp/echo.sock`,
///  `ws://[::1]:8080/chat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl SpUrl {
    pub fn parse(raw: &str) -> SpResult<SpUrl> {
        let (scheme_str, rest) = raw.split_once("://").ok_or(SpError::InvalidAddress)?;
        let scheme = Scheme::parse(scheme_str)?;

        if !scheme.has_host() {
            // everything after :// is the path / name
            if rest.is_empty() {
                return Err(SpError::InvalidAddress);
            }
            return Ok(SpUrl {
                scheme,
                host: String::new(),
                port: 0,
                path: rest.to_string(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(SpError::InvalidAddress);
        }

        let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
            // bracketed IPv6 literal
            let close = stripped.find(']').ok_or(SpError::InvalidAddress)?;
            let host = &stripped[..close];
            let after = &stripped[close + 1..];
            let port = match after.strip_prefix(':') {
                Some(p) => p,
                None if after.is_empty() => "",
                None => return Err(SpError::InvalidAddress),
            };
            (host, port)
        } else if let Some((h, p)) = authority.rsplit_once(':') {
            if h.contains(':') {
                // unbracketed IPv6 is ambiguous
                return Err(SpError::InvalidAddress);
            }
            (h, p)
        } else {
            (authority, "")
        };

        let port = if port_str.is_empty() {
            scheme.default_port().unwrap_or(0)
        } else {
            port_str.parse().map_err(|_| SpError::InvalidAddress)?
        };

        Ok(SpUrl {
            scheme,
            host: host.to_string(),
            port,
            path: if path.is_empty() && scheme.is_websocket() {
                "/".to_string()
            } else {
                path.to_string()
            },
        })
    }

    /// host:port form suitable for the resolver, with IPv6 re-bracketed.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for SpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.has_host() {
            write!(f, "{}://{}{}", self.scheme.as_str(), self.host_port(), self.path)
        } else {
            write!(f, "{}://{}", self.scheme.as_str(), self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tcp://127.0.0.1:4000", Scheme::Tcp, "127.0.0.1", 4000, "")]
    #[case("tcp4://10.0.0.1:80", Scheme::Tcp4, "10.0.0.1", 80, "")]
    #[case("tcp6://[::1]:9000", Scheme::Tcp6, "::1", 9000, "")]
    #[case("tcp://[2001:db8::2]:17", Scheme::Tcp, "2001:db8::2", 17, "")]
    #[case("tls+tcp://localhost:4433", Scheme::TlsTcp, "localhost", 4433, "")]
    #[case("ws://h:8080/chat", Scheme::Ws, "h", 8080, "/chat")]
    #[case("ws://h", Scheme::Ws, "h", 80, "/")]
    #[case("wss://h/x", Scheme::Wss, "h", 443, "/x")]
    #[case("ws6://[::1]/p", Scheme::Ws6, "::1", 80, "/p")]
    fn test_parse_host_urls(
        #[case] raw: &str,
        #[case] scheme: Scheme,
        #[case] host: &str,
        #[case] port: u16,
        #[case] path: &str,
    ) {
        let url = SpUrl::parse(raw).unwrap();
        assert_eq!(url.scheme, scheme);
        assert_eq!(url.host, host);
        assert_eq!(url.port, port);
        assert_eq!(url.path, path);
    }

    #[rstest]
    #[case("ipc:///tmp/test.sock", Scheme::Ipc, "/tmp/test.sock")]
    #[case("unix:///tmp/u.sock", Scheme::Ipc, "/tmp/u.sock")]
    #[case("abstract://name", Scheme::Abstract, "name")]
    #[case("inproc://bus", Scheme::Inproc, "bus")]
    fn test_parse_path_urls(#[case] raw: &str, #[case] scheme: Scheme, #[case] path: &str) {
        let url = SpUrl::parse(raw).unwrap();
        assert_eq!(url.scheme, scheme);
        assert_eq!(url.path, path);
    }

    #[rstest]
    #[case("tcp:127.0.0.1:80")]
    #[case("ftp://example.com")]
    #[case("tcp://")]
    #[case("tcp://1:2:3:80")]
    #[case("tcp://[::1:80")]
    #[case("tcp://h:notaport")]
    #[case("ipc://")]
    fn test_parse_rejects(#[case] raw: &str) {
        assert_eq!(SpUrl::parse(raw), Err(SpError::InvalidAddress));
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["tcp://127.0.0.1:4000", "ws://h:8080/chat", "ipc:///tmp/s"] {
            let url = SpUrl::parse(raw).unwrap();
            assert_eq!(SpUrl::parse(&url.to_string()).unwrap(), url);
        }
    }
}
