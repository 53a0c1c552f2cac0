use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::net::{UnixListener as TokioUnixListener, UnixStream};
use tracing::{debug, trace};

use crate::aio::Aio;
use crate::conn_io::ConnIo;
use crate::error::{SpError, SpResult};
use crate::platform::platform;
use crate::stream::{prop, PropertyValue, Stream, StreamDialer, StreamListener};
use crate::tcp::OpTracker;
use crate::url::{Scheme, SpUrl};

/// One established IPC (unix domain socket) byte stream.
pub struct IpcConn {
    io: Arc<ConnIo>,
    path: String,
}

impl IpcConn {
    fn wrap(stream: UnixStream, path: &str) -> IpcConn {
        let (rd, wr) = stream.into_split();
        IpcConn {
            io: ConnIo::spawn(rd, wr),
            path: path.to_string(),
        }
    }
}

impl Stream for IpcConn {
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
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Ok(PropertyValue::Str(self.path.clone())),
            _ => Err(SpError::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropertyValue) -> SpResult<()> {
        Err(SpError::NotSupported)
    }
}

impl Drop for IpcConn {
    fn drop(&mut self) {
        self.io.close();
    }
}

fn check_url(url: &SpUrl) -> SpResult<()> {
    match url.scheme {
        Scheme::Ipc => Ok(()),
        // the abstract namespace only exists on Linux
        Scheme::Abstract if cfg!(target_os = "linux") => Ok(()),
        Scheme::Abstract => Err(SpError::NotSupported),
        _ => Err(SpError::InvalidAddress),
    }
}

#[cfg(target_os = "linux")]
fn abstract_listener(name: &str) -> SpResult<std::os::unix::net::UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(|e| SpError::from_io(&e))?;
    std::os::unix::net::UnixListener::bind_addr(&addr).map_err(|e| SpError::from_io(&e))
}

#[cfg(target_os = "linux")]
fn abstract_connect(name: &str) -> SpResult<std::os::unix::net::UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(|e| SpError::from_io(&e))?;
    std::os::unix::net::UnixStream::connect_addr(&addr).map_err(|e| SpError::from_io(&e))
}

/// Outgoing IPC connector for one URL.
pub struct IpcDialer {
    url: SpUrl,
    ops: Arc<OpTracker>,
}

impl IpcDialer {
    pub fn new(url: SpUrl) -> SpResult<Arc<IpcDialer>> {
        check_url(&url)?;
        Ok(Arc::new(IpcDialer {
            url,
            ops: Arc::new(OpTracker::new()),
        }))
    }
}

impl StreamDialer for IpcDialer {
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
        let ops = self.ops.clone();
        let aio = aio.clone();
        platform().handle().spawn(async move {
            let result = tokio::select! {
                biased;
                _ = sig.wait() => Err(sig.error()),
                r = dial_one(&url) => r,
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

    fn get(&self, _name: &str) -> SpResult<PropertyValue> {
        Err(SpError::NotSupported)
    }

    fn set(&self, _name: &str, _value: PropertyValue) -> SpResult<()> {
        Err(SpError::NotSupported)
    }
}

async fn dial_one(url: &SpUrl) -> SpResult<IpcConn> {
    let stream = match url.scheme {
        #[cfg(target_os = "linux")]
        Scheme::Abstract => {
            let std_stream = abstract_connect(&url.path)?;
            std_stream
                .set_nonblocking(true)
                .map_err(|e| SpError::from_io(&e))?;
            UnixStream::from_std(std_stream).map_err(|e| SpError::from_io(&e))?
        }
        _ => UnixStream::connect(&url.path)
            .await
            .map_err(|e| SpError::from_io(&e))?,
    };
    Ok(IpcConn::wrap(stream, &url.path))
}

/// Accepting side of an IPC endpoint. Binding unlinks nothing; a stale socket
///  file surfaces as AddrInUse exactly like a live one.
pub struct IpcListener {
    url: SpUrl,
    bound: Mutex<Option<Arc<TokioUnixListener>>>,
    unlink: Mutex<Option<PathBuf>>,
    ops: Arc<OpTracker>,
}

impl IpcListener {
    pub fn new(url: SpUrl) -> SpResult<Arc<IpcListener>> {
        check_url(&url)?;
        Ok(Arc::new(IpcListener {
            url,
            bound: Mutex::new(None),
            unlink: Mutex::new(None),
            ops: Arc::new(OpTracker::new()),
        }))
    }
}

impl StreamListener for IpcListener {
    fn listen(&self) -> SpResult<()> {
        let mut bound = self.bound.lock().unwrap();
        if bound.is_some() {
            return Err(SpError::Busy);
        }

        let _guard = platform().handle().enter();
        let listener = match self.url.scheme {
            #[cfg(target_os = "linux")]
            Scheme::Abstract => {
                let std_listener = abstract_listener(&self.url.path)?;
                std_listener
                    .set_nonblocking(true)
                    .map_err(|e| SpError::from_io(&e))?;
                TokioUnixListener::from_std(std_listener).map_err(|e| SpError::from_io(&e))?
            }
            _ => {
                let l = TokioUnixListener::bind(&self.url.path).map_err(|e| SpError::from_io(&e))?;
                *self.unlink.lock().unwrap() = Some(PathBuf::from(&self.url.path));
                l
            }
        };
        debug!("listening on {}", self.url);
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

        let path = self.url.path.clone();
        let ops = self.ops.clone();
        let aio = aio.clone();
        platform().handle().spawn(async move {
            let result = tokio::select! {
                biased;
                _ = sig.wait() => Err(sig.error()),
                r = listener.accept() => match r {
                    Ok((stream, _)) => Ok(IpcConn::wrap(stream, &path)),
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
        if let Some(path) = self.unlink.lock().unwrap().take() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropertyValue::Str(self.url.path.clone())),
            _ => Err(SpError::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropertyValue) -> SpResult<()> {
        Err(SpError::NotSupported)
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Some(path) = self.unlink.lock().unwrap().take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::RecvBuf;
    use bytes::Bytes;

    fn temp_path(tag: &str) -> String {
        format!(
            "/tmp/spcore-ipc-test-{}-{}",
            tag,
            std::process::id()
        )
    }

    #[test]
    fn test_ipc_echo_roundtrip() {
        let path = temp_path("echo");
        let _ = std::fs::remove_file(&path);
        let url = SpUrl::parse(&format!("ipc://{}", path)).unwrap();

        let listener = IpcListener::new(url.clone()).unwrap();
        listener.listen().unwrap();

        let acc = Aio::new_sync();
        listener.accept(&acc);

        let dialer = IpcDialer::new(url).unwrap();
        let dial = Aio::new_sync();
        dialer.dial(&dial);

        dial.wait();
        acc.wait();
        let client = crate::stream::take_stream_output(&dial).unwrap();
        let server = crate::stream::take_stream_output(&acc).unwrap();

        let tx = Aio::new_sync();
        tx.set_iov(vec![Bytes::from_static(b"ping")]).unwrap();
        client.send(&tx);
        tx.wait();
        assert_eq!(tx.result(), Ok(()));

        let rx = Aio::new_sync();
        rx.set_recv(RecvBuf::with_want(4));
        let mut got = 0;
        while got < 4 {
            server.recv(&rx);
            rx.wait();
            assert_eq!(rx.result(), Ok(()));
            got += rx.count();
        }
        assert_eq!(&rx.take_recv().unwrap().buf[..], b"ping");

        client.stop();
        server.stop();
        listener.close();
    }

    #[test]
    fn test_ipc_listen_conflict() {
        let path = temp_path("conflict");
        let _ = std::fs::remove_file(&path);
        let url = SpUrl::parse(&format!("ipc://{}", path)).unwrap();

        let first = IpcListener::new(url.clone()).unwrap();
        first.listen().unwrap();
        let second = IpcListener::new(url).unwrap();
        assert_eq!(second.listen(), Err(SpError::AddrInUse));
        first.close();
    }
}
