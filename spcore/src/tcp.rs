use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{self, TcpSocket};
use tracing::{debug, trace};

use crate::aio::Aio;
use crate::conn_io::{AbortSig, ConnIo};
use crate::error::{SpError, SpResult};
use crate::platform::platform;
use crate::stream::{prop, PropertyValue, Stream, StreamDialer, StreamListener};
use crate::url::{IpFamily, SpUrl};

/// One established TCP byte stream.
pub struct TcpConn {
    io: Arc<ConnIo>,
    local: SocketAddr,
    remote: SocketAddr,
    nodelay: bool,
    keepalive: bool,
}

impl TcpConn {
    fn wrap(stream: net::TcpStream, nodelay: bool, keepalive: bool) -> SpResult<TcpConn> {
        stream
            .set_nodelay(nodelay)
            .map_err(|e| SpError::from_io(&e))?;
        let local = stream.local_addr().map_err(|e| SpError::from_io(&e))?;
        let remote = stream.peer_addr().map_err(|e| SpError::from_io(&e))?;
        let (rd, wr) = stream.into_split();
        Ok(TcpConn {
            io: ConnIo::spawn(rd, wr),
            local,
            remote,
            nodelay,
            keepalive,
        })
    }
}

impl Stream for TcpConn {
    fn send(&self, aio: &Arc<Aio>) {
        self.io.send(aio);
    }

    fn recv(&self, aio: &Arc<Aio>) {
        self.io.recv(aio);
    }

    fn close(&self) {
        self.io.close();
    }

    fn stop(&self) {
        self.io.stop();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropertyValue::Sockaddr(self.local)),
            prop::REMOTE_ADDR => Ok(PropertyValue::Sockaddr(self.remote)),
            prop::TCP_NODELAY => Ok(PropertyValue::Bool(self.nodelay)),
            prop::TCP_KEEPALIVE => Ok(PropertyValue::Bool(self.keepalive)),
            _ => Err(SpError::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropertyValue) -> SpResult<()> {
        Err(SpError::NotSupported)
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.io.close();
    }
}

fn family_matches(addr: &SocketAddr, family: Option<IpFamily>) -> bool {
    match family {
        None => true,
        Some(IpFamily::V4) => addr.is_ipv4(),
        Some(IpFamily::V6) => addr.is_ipv6(),
    }
}

async fn resolve(url: &SpUrl) -> SpResult<Vec<SocketAddr>> {
    let family = url.scheme.ip_family();
    let addrs: Vec<SocketAddr> = net::lookup_host(url.host_port())
        .await
        .map_err(|_| SpError::InvalidAddress)?
        .filter(|a| family_matches(a, family))
        .collect();
    if addrs.is_empty() {
        return Err(SpError::InvalidAddress);
    }
    Ok(addrs)
}

/// Tracks in-flight dial/accept jobs so endpoint close can abort them all.
pub(crate) struct OpTracker {
    closed: AtomicBool,
    pending: Mutex<Vec<Arc<AbortSig>>>,
}

impl OpTracker {
    pub(crate) fn new() -> OpTracker {
        OpTracker {
            closed: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self) -> SpResult<Arc<AbortSig>> {
        let sig = AbortSig::new();
        let mut pending = self.pending.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(SpError::Closed);
        }
        pending.push(sig.clone());
        Ok(sig)
    }

    pub(crate) fn deregister(&self, sig: &Arc<AbortSig>) {
        self.pending
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, sig));
    }

    pub(crate) fn close(&self) {
        let pending = {
            let mut p = self.pending.lock().unwrap();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *p)
        };
        for sig in pending {
            sig.fire(SpError::Closed);
        }
    }
}

/// Outgoing TCP connector for one URL.
pub struct TcpDialer {
    url: SpUrl,
    nodelay: AtomicBool,
    keepalive: AtomicBool,
    ops: Arc<OpTracker>,
}

impl TcpDialer {
    pub fn new(url: SpUrl) -> SpResult<Arc<TcpDialer>> {
        if !url.scheme.has_host() || url.host.is_empty() {
            return Err(SpError::InvalidAddress);
        }
        if url.port == 0 {
            return Err(SpError::InvalidAddress);
        }
        Ok(Arc::new(TcpDialer {
            url,
            nodelay: AtomicBool::new(true),
            keepalive: AtomicBool::new(false),
            ops: Arc::new(OpTracker::new()),
        }))
    }
}

impl StreamDialer for TcpDialer {
    fn dial(&self, aio: &Arc<Aio>) {
        aio.reset();
        let sig = match self.ops.register() {
            Ok(sig) => sig,
            Err(rv) => {
                if aio.start(None) {
                    aio.finish_error(rv);
                }
                return;
            }
        };

        let cancel_sig = sig.clone();
        if !aio.start(Some(Box::new(move |_aio, rv| cancel_sig.fire(rv)))) {
            self.ops.deregister(&sig);
            return;
        }

        let url = self.url.clone();
        let nodelay = self.nodelay.load(Ordering::Relaxed);
        let keepalive = self.keepalive.load(Ordering::Relaxed);
        let ops = self.ops.clone();
        let aio = aio.clone();
        platform().handle().spawn(async move {
            let result = tokio::select! {
                biased;
                _ = sig.wait() => Err(sig.error()),
                r = dial_one(&url, nodelay, keepalive) => r,
            };
            ops.deregister(&sig);
            match result {
                Ok(conn) => {
                    trace!("dialed {}", url);
                    let stream: Box<dyn Stream> = Box::new(conn);
                    aio.set_output(0, Box::new(stream));
                    aio.finish(Ok(()), 0);
                }
                Err(rv) => aio.finish_error(rv),
            }
        });
    }

    fn close(&self) {
        self.ops.close();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::TCP_NODELAY => Ok(PropertyValue::Bool(self.nodelay.load(Ordering::Relaxed))),
            prop::TCP_KEEPALIVE => Ok(PropertyValue::Bool(self.keepalive.load(Ordering::Relaxed))),
            _ => Err(SpError::NotSupported),
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        match name {
            prop::TCP_NODELAY => {
                self.nodelay.store(value.as_bool()?, Ordering::Relaxed);
                Ok(())
            }
            prop::TCP_KEEPALIVE => {
                self.keepalive.store(value.as_bool()?, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(SpError::NotSupported),
        }
    }
}

async fn dial_one(url: &SpUrl, nodelay: bool, keepalive: bool) -> SpResult<TcpConn> {
    let addrs = resolve(url).await?;
    let mut last = SpError::ConnRefused;
    for addr in addrs {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| SpError::from_io(&e))?;
        socket
            .set_keepalive(keepalive)
            .map_err(|e| SpError::from_io(&e))?;
        match socket.connect(addr).await {
            Ok(stream) => return TcpConn::wrap(stream, nodelay, keepalive),
            Err(e) => last = SpError::from_io(&e),
        }
    }
    Err(last)
}

/// Accepting side of a TCP endpoint.
pub struct TcpListener {
    url: SpUrl,
    bound: Mutex<Option<Arc<net::TcpListener>>>,
    nodelay: AtomicBool,
    keepalive: AtomicBool,
    ops: Arc<OpTracker>,
}

impl TcpListener {
    pub fn new(url: SpUrl) -> SpResult<Arc<TcpListener>> {
        if !url.scheme.has_host() || url.host.is_empty() {
            return Err(SpError::InvalidAddress);
        }
        Ok(Arc::new(TcpListener {
            url,
            bound: Mutex::new(None),
            nodelay: AtomicBool::new(true),
            keepalive: AtomicBool::new(false),
            ops: Arc::new(OpTracker::new()),
        }))
    }

    /// The address actually bound; differs from the URL when port 0 was requested.
    pub fn local_addr(&self) -> SpResult<SocketAddr> {
        let bound = self.bound.lock().unwrap();
        let listener = bound.as_ref().ok_or(SpError::Closed)?;
        listener.local_addr().map_err(|e| SpError::from_io(&e))
    }
}

impl StreamListener for TcpListener {
    fn listen(&self) -> SpResult<()> {
        use std::net::ToSocketAddrs;

        let mut bound = self.bound.lock().unwrap();
        if bound.is_some() {
            return Err(SpError::Busy);
        }
        let family = self.url.scheme.ip_family();
        let addr = self
            .url
            .host_port()
            .to_socket_addrs()
            .map_err(|_| SpError::InvalidAddress)?
            .find(|a| family_matches(a, family))
            .ok_or(SpError::InvalidAddress)?;

        // Bind via TcpSocket so the reactor registration happens on our runtime
        // regardless of the caller's thread.
        let _guard = platform().handle().enter();
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| SpError::from_io(&e))?;
        socket.set_reuseaddr(true).map_err(|e| SpError::from_io(&e))?;
        socket.bind(addr).map_err(|e| SpError::from_io(&e))?;
        let listener = socket.listen(128).map_err(|e| SpError::from_io(&e))?;
        debug!("listening on {:?}", listener.local_addr());
        *bound = Some(Arc::new(listener));
        Ok(())
    }

    fn accept(&self, aio: &Arc<Aio>) {
        aio.reset();
        let listener = match self.bound.lock().unwrap().clone() {
            Some(l) => l,
            None => {
                if aio.start(None) {
                    aio.finish_error(SpError::Closed);
                }
                return;
            }
        };

        let sig = match self.ops.register() {
            Ok(sig) => sig,
            Err(rv) => {
                if aio.start(None) {
                    aio.finish_error(rv);
                }
                return;
            }
        };

        let cancel_sig = sig.clone();
        if !aio.start(Some(Box::new(move |_aio, rv| cancel_sig.fire(rv)))) {
            self.ops.deregister(&sig);
            return;
        }

        let nodelay = self.nodelay.load(Ordering::Relaxed);
        let keepalive = self.keepalive.load(Ordering::Relaxed);
        let ops = self.ops.clone();
        let aio = aio.clone();
        platform().handle().spawn(async move {
            let result = tokio::select! {
                biased;
                _ = sig.wait() => Err(sig.error()),
                r = listener.accept() => match r {
                    Ok((stream, from)) => {
                        trace!("accepted connection from {}", from);
                        TcpConn::wrap(stream, nodelay, keepalive)
                    }
                    Err(e) => Err(SpError::from_io(&e)),
                },
            };
            ops.deregister(&sig);
            match result {
                Ok(conn) => {
                    let stream: Box<dyn Stream> = Box::new(conn);
                    aio.set_output(0, Box::new(stream));
                    aio.finish(Ok(()), 0);
                }
                Err(rv) => aio.finish_error(rv),
            }
        });
    }

    fn close(&self) {
        self.ops.close();
        self.bound.lock().unwrap().take();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropertyValue::Sockaddr(self.local_addr()?)),
            prop::TCP_NODELAY => Ok(PropertyValue::Bool(self.nodelay.load(Ordering::Relaxed))),
            prop::TCP_KEEPALIVE => Ok(PropertyValue::Bool(self.keepalive.load(Ordering::Relaxed))),
            _ => Err(SpError::NotSupported),
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        match name {
            prop::TCP_NODELAY => {
                self.nodelay.store(value.as_bool()?, Ordering::Relaxed);
                Ok(())
            }
            prop::TCP_KEEPALIVE => {
                self.keepalive.store(value.as_bool()?, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(SpError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::RecvBuf;
    use bytes::Bytes;

    fn dial_listen_pair() -> (Box<dyn Stream>, Box<dyn Stream>) {
        let listener = TcpListener::new(SpUrl::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        listener.listen().unwrap();
        let port = listener.local_addr().unwrap().port();

        let acc_aio = Aio::new_sync();
        listener.accept(&acc_aio);

        let dialer =
            TcpDialer::new(SpUrl::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap()).unwrap();
        let dial_aio = Aio::new_sync();
        dialer.dial(&dial_aio);

        dial_aio.wait();
        acc_aio.wait();
        assert_eq!(dial_aio.result(), Ok(()));
        assert_eq!(acc_aio.result(), Ok(()));

        let client = crate::stream::take_stream_output(&dial_aio).unwrap();
        let server = crate::stream::take_stream_output(&acc_aio).unwrap();
        (client, server)
    }

    #[test]
    fn test_dial_accept_send_recv() {
        let (client, server) = dial_listen_pair();

        let tx = Aio::new_sync();
        tx.set_iov(vec![Bytes::from_static(b"hello")]).unwrap();
        client.send(&tx);
        tx.wait();
        assert_eq!(tx.result(), Ok(()));
        assert_eq!(tx.count(), 5);

        let rx = Aio::new_sync();
        rx.set_recv(RecvBuf::with_want(5));
        let mut got = 0;
        while got < 5 {
            server.recv(&rx);
            rx.wait();
            assert_eq!(rx.result(), Ok(()));
            got += rx.count();
        }
        let recv = rx.take_recv().unwrap();
        assert_eq!(&recv.buf[..], b"hello");

        client.stop();
        server.stop();
    }

    #[test]
    fn test_recv_on_closed_peer_reports_shutdown() {
        let (client, server) = dial_listen_pair();
        client.close();

        let rx = Aio::new_sync();
        rx.set_recv(RecvBuf::with_want(1));
        server.recv(&rx);
        rx.wait();
        assert_eq!(rx.result(), Err(SpError::ConnShutdown));
        server.stop();
    }

    #[test]
    fn test_dial_refused() {
        // bind + drop to get a port that very likely refuses
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let dialer =
            TcpDialer::new(SpUrl::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap()).unwrap();
        let aio = Aio::new_sync();
        dialer.dial(&aio);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::ConnRefused));
    }

    #[test]
    fn test_accept_abort() {
        let listener = TcpListener::new(SpUrl::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        listener.listen().unwrap();
        let aio = Aio::new_sync();
        listener.accept(&aio);
        aio.abort(SpError::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Canceled));
    }

    #[test]
    fn test_listen_addr_in_use() {
        let first = TcpListener::new(SpUrl::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        first.listen().unwrap();
        let port = first.local_addr().unwrap().port();

        // A second bind of the same port must fail synchronously. reuseaddr does
        // not allow two live listeners on the same addr+port.
        let second =
            TcpListener::new(SpUrl::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap()).unwrap();
        assert_eq!(second.listen(), Err(SpError::AddrInUse));
    }
}
