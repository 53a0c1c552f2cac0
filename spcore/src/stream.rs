use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::aio::Aio;
use crate::error::{SpError, SpResult};

/// Typed value for named stream / endpoint properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Size(usize),
    Duration(Duration),
    Str(String),
    Sockaddr(SocketAddr),
}

impl PropertyValue {
    pub fn as_bool(&self) -> SpResult<bool> {
        match self {
            PropertyValue::Bool(b) => Ok(*b),
            _ => Err(SpError::InvalidArgument),
        }
    }

    pub fn as_size(&self) -> SpResult<usize> {
        match self {
            PropertyValue::Size(s) => Ok(*s),
            PropertyValue::Int(i) if *i >= 0 => Ok(*i as usize),
            _ => Err(SpError::InvalidArgument),
        }
    }

    pub fn as_sockaddr(&self) -> SpResult<SocketAddr> {
        match self {
            PropertyValue::Sockaddr(sa) => Ok(*sa),
            _ => Err(SpError::InvalidArgument),
        }
    }
}

/// Well-known property names.
pub mod prop {
    pub const LOCAL_ADDR: &str = "local-address";
    pub const REMOTE_ADDR: &str = "remote-address";
    pub const TCP_NODELAY: &str = "tcp-nodelay";
    pub const TCP_KEEPALIVE: &str = "tcp-keepalive";
    pub const RECV_MAX: &str = "recv-max";
    pub const WS_FRAGSIZE: &str = "ws-fragsize";
    pub const WS_MAXFRAME: &str = "ws-maxframe";
    pub const WS_PROTOCOL: &str = "ws-protocol";
    pub const TLS_VERIFIED: &str = "tls-verified";
    pub const TLS_PEER_CN: &str = "tls-peer-cn";
}

/// Polymorphic byte-oriented duplex channel. Providers complete short transfers;
///  callers advance their buffers and resubmit.
pub trait Stream: Send + Sync {
    /// Write bytes from the aio's gather list. The aio finishes with the number of
    ///  bytes actually written; short writes are legal.
    fn send(&self, aio: &Arc<Aio>);

    /// Read into the aio's receive buffer, at most its remaining target. The aio
    ///  finishes with the number of bytes read; a clean zero-byte read finishes
    ///  with `ConnShutdown`.
    fn recv(&self, aio: &Arc<Aio>);

    /// Abort all pending operations with `Closed` and shut the channel down.
    fn close(&self);

    /// Close, then block until the provider's internal machinery has drained.
    /// Runs on the reap thread during teardown; never call from a callback.
    fn stop(&self);

    fn get(&self, name: &str) -> SpResult<PropertyValue>;

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()>;
}

/// Produces outbound streams. `dial` finishes its aio with a `Box<dyn Stream>` in
///  output slot 0.
pub trait StreamDialer: Send + Sync {
    fn dial(&self, aio: &Arc<Aio>);

    fn close(&self);

    fn get(&self, name: &str) -> SpResult<PropertyValue>;

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()>;
}

/// Accepts inbound streams. `listen` binds synchronously (`AddrInUse` surfaces
///  there); `accept` finishes its aio with a `Box<dyn Stream>` in output slot 0.
pub trait StreamListener: Send + Sync {
    fn listen(&self) -> SpResult<()>;

    fn accept(&self, aio: &Arc<Aio>);

    fn close(&self);

    fn get(&self, name: &str) -> SpResult<PropertyValue>;

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()>;
}

impl<T: Stream + ?Sized> Stream for Arc<T> {
    fn send(&self, aio: &Arc<Aio>) {
        (**self).send(aio)
    }

    fn recv(&self, aio: &Arc<Aio>) {
        (**self).recv(aio)
    }

    fn close(&self) {
        (**self).close()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        (**self).get(name)
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        (**self).set(name, value)
    }
}

impl<T: StreamDialer + ?Sized> StreamDialer for Arc<T> {
    fn dial(&self, aio: &Arc<Aio>) {
        (**self).dial(aio)
    }

    fn close(&self) {
        (**self).close()
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        (**self).get(name)
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        (**self).set(name, value)
    }
}

impl<T: StreamListener + ?Sized> StreamListener for Arc<T> {
    fn listen(&self) -> SpResult<()> {
        (**self).listen()
    }

    fn accept(&self, aio: &Arc<Aio>) {
        (**self).accept(aio)
    }

    fn close(&self) {
        (**self).close()
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        (**self).get(name)
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        (**self).set(name, value)
    }
}

/// Pull the boxed stream a dialer/listener deposited in output slot 0.
pub fn take_stream_output(aio: &Arc<Aio>) -> Option<Box<dyn Stream>> {
    aio.take_output(0)
        .and_then(|any| any.downcast::<Box<dyn Stream>>().ok())
        .map(|b| *b)
}
