use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use spcore::{SpError, SpResult, SpUrl};
use tracing::{debug, info, warn};

use crate::dialer::Dialer;
use crate::listener::Listener;
use crate::pipe::{Pipe, PipeEvent};
use crate::proto::Protocol;
use crate::stats::SocketStats;

static SOCKET_IDS: AtomicU32 = AtomicU32::new(1);

/// Callback registered for pipe lifecycle events.
pub type PipeNotify = Arc<dyn Fn(&Arc<Pipe>, PipeEvent) + Send + Sync>;

struct SockState {
    pipes: FxHashMap<u32, Arc<Pipe>>,
    dialers: Vec<Arc<Dialer>>,
    listeners: Vec<Arc<Listener>>,
    closed: bool,
    pipe_cb: Option<PipeNotify>,
}

/// An application handle: owns one protocol identity plus a set of endpoints
///  and the pipes they produced. The pattern logic itself (REQ/REP and friends)
///  lives behind the [`Protocol`] trait.
pub struct Socket {
    id: u32,
    proto: Box<dyn Protocol>,
    recvmax: AtomicUsize,
    state: Mutex<SockState>,
    stats: SocketStats,
}

impl Socket {
    pub fn new(proto: Box<dyn Protocol>) -> Arc<Socket> {
        let sock = Arc::new(Socket {
            id: SOCKET_IDS.fetch_add(1, Ordering::Relaxed),
            proto,
            recvmax: AtomicUsize::new(0),
            state: Mutex::new(SockState {
                pipes: FxHashMap::default(),
                dialers: Vec::new(),
                listeners: Vec::new(),
                closed: false,
                pipe_cb: None,
            }),
            stats: SocketStats::default(),
        });
        info!(
            "opened socket<{}> ({}/{})",
            sock.id,
            sock.proto.self_name(),
            sock.proto.peer_name()
        );
        sock
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn proto(&self) -> &dyn Protocol {
        self.proto.as_ref()
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }

    /// Default per-message receive limit inherited by new endpoints; 0 disables.
    pub fn set_recvmax(&self, max: usize) {
        self.recvmax.store(max, Ordering::Relaxed);
    }

    pub fn recvmax(&self) -> usize {
        self.recvmax.load(Ordering::Relaxed)
    }

    /// Register for pipe lifecycle events.
    pub fn set_pipe_notify(&self, cb: PipeNotify) {
        self.state.lock().unwrap().pipe_cb = Some(cb);
    }

    /// Create a dialer without starting it, so options can be set first.
    pub fn dialer_create(self: &Arc<Self>, url: &str) -> SpResult<Arc<Dialer>> {
        let url = SpUrl::parse(url)?;
        let dialer = Dialer::create(self, url)?;
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return Err(SpError::Closed);
        }
        st.dialers.push(dialer.clone());
        Ok(dialer)
    }

    /// Create and start a dialer. Connection establishment is asynchronous;
    ///  use [`Dialer::wait_connected`] for synchronous behavior.
    pub fn dial(self: &Arc<Self>, url: &str) -> SpResult<Arc<Dialer>> {
        let dialer = self.dialer_create(url)?;
        dialer.start()?;
        Ok(dialer)
    }

    /// Create a listener without starting it.
    pub fn listener_create(self: &Arc<Self>, url: &str) -> SpResult<Arc<Listener>> {
        let url = SpUrl::parse(url)?;
        let listener = Listener::create(self, url)?;
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return Err(SpError::Closed);
        }
        st.listeners.push(listener.clone());
        Ok(listener)
    }

    /// Create a listener and bind it. Bind errors surface here synchronously.
    pub fn listen(self: &Arc<Self>, url: &str) -> SpResult<Arc<Listener>> {
        let listener = self.listener_create(url)?;
        listener.start()?;
        Ok(listener)
    }

    /// Start a created-but-unstarted endpoint.
    pub fn start_dialer(&self, dialer: &Arc<Dialer>) -> SpResult<()> {
        dialer.start()
    }

    pub fn start_listener(&self, listener: &Arc<Listener>) -> SpResult<()> {
        listener.start()
    }

    /// The active pipe set, for protocols and diagnostics.
    pub fn pipes(&self) -> Vec<Arc<Pipe>> {
        self.state.lock().unwrap().pipes.values().cloned().collect()
    }

    pub(crate) fn run_pipe_cb(&self, pipe: &Arc<Pipe>, event: PipeEvent) {
        let cb = self.state.lock().unwrap().pipe_cb.clone();
        if let Some(cb) = cb {
            cb(pipe, event);
        }
    }

    /// Attach a negotiated pipe. The peer must present the protocol number our
    ///  protocol expects; otherwise the pipe is rejected and closed while the
    ///  socket keeps running.
    pub(crate) fn add_pipe(self: &Arc<Self>, pipe: &Arc<Pipe>) -> bool {
        self.run_pipe_cb(pipe, PipeEvent::AddPre);

        let expected = self.proto.peer_id();
        if pipe.peer() != expected {
            warn!(
                "socket<{}>: rejecting pipe<{}>: peer speaks {:#06x}, want {:#06x}",
                self.id,
                pipe.id(),
                pipe.peer(),
                expected
            );
            self.stats.rejects.fetch_add(1, Ordering::Relaxed);
            pipe.close();
            return false;
        }
        if let Err(rv) = self.proto.pipe_attach(pipe) {
            debug!(
                "socket<{}>: protocol refused pipe<{}>: {}",
                self.id,
                pipe.id(),
                rv
            );
            self.stats.rejects.fetch_add(1, Ordering::Relaxed);
            pipe.close();
            return false;
        }

        let mut st = self.state.lock().unwrap();
        if st.closed {
            drop(st);
            pipe.close();
            return false;
        }
        st.pipes.insert(pipe.id(), pipe.clone());
        drop(st);

        debug!("socket<{}>: pipe<{}> active", self.id, pipe.id());
        self.run_pipe_cb(pipe, PipeEvent::AddPost);
        true
    }

    pub(crate) fn remove_pipe(&self, id: u32) {
        self.state.lock().unwrap().pipes.remove(&id);
    }

    pub(crate) fn close_pipes_of_dialer(&self, dialer_id: u32) {
        let doomed: Vec<_> = {
            let st = self.state.lock().unwrap();
            st.pipes
                .values()
                .filter(|p| p.dialer().map(|d| d.id() == dialer_id).unwrap_or(false))
                .cloned()
                .collect()
        };
        for pipe in doomed {
            pipe.close();
        }
    }

    pub(crate) fn close_pipes_of_listener(&self, listener_id: u32) {
        let doomed: Vec<_> = {
            let st = self.state.lock().unwrap();
            st.pipes
                .values()
                .filter(|p| p.listener().map(|l| l.id() == listener_id).unwrap_or(false))
                .cloned()
                .collect()
        };
        for pipe in doomed {
            pipe.close();
        }
    }

    /// Close every endpoint and pipe. Idempotent.
    pub fn close(self: &Arc<Self>) {
        let (dialers, listeners, pipes) = {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.dialers),
                std::mem::take(&mut st.listeners),
                st.pipes.values().cloned().collect::<Vec<_>>(),
            )
        };
        info!("closing socket<{}>", self.id);
        for d in dialers {
            d.close();
        }
        for l in listeners {
            l.close();
        }
        for p in pipes {
            p.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ids, RawProtocol};
    use spcore::platform::platform;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_dial_listen_attach() {
        let server = Socket::new(Box::new(RawProtocol::pair()));
        let listener = server.listen("tcp://127.0.0.1:0").unwrap();
        let port = listener.bound_port().unwrap();

        let client = Socket::new(Box::new(RawProtocol::pair()));
        let dialer = client.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        dialer.wait_connected().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            client.pipes().len() == 1 && server.pipes().len() == 1
        }));
        let cp = &client.pipes()[0];
        assert_eq!(cp.peer(), ids::PAIR0);
        assert!(cp.dialer().is_some());
        assert!(cp.listener().is_none());

        client.close();
        server.close();
        platform().reaper().flush();
    }

    #[test]
    fn test_protocol_mismatch_bumps_reject() {
        // req expects rep; a pub listener must be turned away
        let server = Socket::new(Box::new(RawProtocol::new(ids::PUB0, ids::SUB0)));
        let listener = server.listen("tcp://127.0.0.1:0").unwrap();
        let port = listener.bound_port().unwrap();

        let client = Socket::new(Box::new(RawProtocol::new(ids::REQ0, ids::REP0)));
        let _dialer = client.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            client.stats().rejects.load(Ordering::Relaxed) >= 1
                || server.stats().rejects.load(Ordering::Relaxed) >= 1
        }));
        assert!(client.pipes().is_empty());

        client.close();
        server.close();
        platform().reaper().flush();
    }

    #[test]
    fn test_listen_addr_in_use_is_synchronous() {
        let a = Socket::new(Box::new(RawProtocol::pair()));
        let first = a.listen("tcp://127.0.0.1:0").unwrap();
        let port = first.bound_port().unwrap();

        let b = Socket::new(Box::new(RawProtocol::pair()));
        assert_eq!(
            b.listen(&format!("tcp://127.0.0.1:{}", port)).unwrap_err(),
            SpError::AddrInUse
        );
        a.close();
        b.close();
    }

    #[test]
    fn test_unsupported_scheme() {
        let sock = Socket::new(Box::new(RawProtocol::pair()));
        assert_eq!(
            sock.dial("inproc://nowhere").unwrap_err(),
            SpError::NotSupported
        );
        sock.close();
    }

    #[test]
    fn test_pipe_events_fire_in_order() {
        let server = Socket::new(Box::new(RawProtocol::pair()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = events.clone();
        server.set_pipe_notify(Arc::new(move |_p, e| {
            ev.lock().unwrap().push(e);
        }));
        let listener = server.listen("tcp://127.0.0.1:0").unwrap();
        let port = listener.bound_port().unwrap();

        let client = Socket::new(Box::new(RawProtocol::pair()));
        let dialer = client.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        dialer.wait_connected().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            events.lock().unwrap().len() >= 2
        }));
        client.close();
        server.close();
        platform().reaper().flush();

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen[0], PipeEvent::AddPre);
        assert_eq!(seen[1], PipeEvent::AddPost);
        assert!(seen.contains(&PipeEvent::RemPost));
    }
}
