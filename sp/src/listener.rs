use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use spcore::{Aio, SpError, SpResult, SpUrl, StreamListener};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipe::{Creator, Pipe};
use crate::socket::Socket;
use crate::stats::EndpointStats;
use crate::transport::{self, EpOptions};

static LISTENER_IDS: AtomicU32 = AtomicU32::new(1);

/// Cool-down before re-accepting after resource exhaustion.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

struct EpState {
    started: bool,
    closed: bool,
    accepting: bool,
    nego_pipes: Vec<Arc<Pipe>>,
    wait_pipes: VecDeque<Arc<Pipe>>,
    user_aio: Option<Arc<Aio>>,
}

/// An accepting endpoint: binds a transport stream listener for one URL and
///  accepts indefinitely, negotiating each inbound connection before handing
///  the pipe to the socket.
pub struct Listener {
    id: u32,
    url: SpUrl,
    sock: Weak<Socket>,
    tran_listener: OnceLock<Box<dyn StreamListener>>,
    opts: Mutex<EpOptions>,
    recvmax: AtomicUsize,
    state: Mutex<EpState>,
    acc_aio: OnceLock<Arc<Aio>>,
    pipe_aio: OnceLock<Arc<Aio>>,
    tmo_aio: OnceLock<Arc<Aio>>,
    stats: EndpointStats,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish()
    }
}

impl Listener {
    pub(crate) fn create(sock: &Arc<Socket>, url: SpUrl) -> SpResult<Arc<Listener>> {
        transport::find(url.scheme)?;

        let l = Arc::new(Listener {
            id: LISTENER_IDS.fetch_add(1, Ordering::Relaxed),
            url,
            sock: Arc::downgrade(sock),
            tran_listener: OnceLock::new(),
            opts: Mutex::new(EpOptions::default()),
            recvmax: AtomicUsize::new(sock.recvmax()),
            state: Mutex::new(EpState {
                started: false,
                closed: false,
                accepting: false,
                nego_pipes: Vec::new(),
                wait_pipes: VecDeque::new(),
                user_aio: None,
            }),
            acc_aio: OnceLock::new(),
            pipe_aio: OnceLock::new(),
            tmo_aio: OnceLock::new(),
            stats: EndpointStats::default(),
        });

        let weak = Arc::downgrade(&l);
        let _ = l.acc_aio.set(Aio::new(move || {
            if let Some(l) = weak.upgrade() {
                l.accept_cb();
            }
        }));
        let weak = Arc::downgrade(&l);
        let _ = l.pipe_aio.set(Aio::new(move || {
            if let Some(l) = weak.upgrade() {
                l.pipe_ready_cb();
            }
        }));
        let weak = Arc::downgrade(&l);
        let _ = l.tmo_aio.set(Aio::new(move || {
            if let Some(l) = weak.upgrade() {
                l.timer_cb();
            }
        }));
        Ok(l)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn url(&self) -> &SpUrl {
        &self.url
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn set_recvmax(&self, max: usize) {
        self.recvmax.store(max, Ordering::Relaxed);
    }

    /// TLS parameters for `tls+tcp` / `wss` URLs. Before start only.
    pub fn set_tls(&self, cfg: Arc<tls::TlsConfig>) -> SpResult<()> {
        if self.state.lock().unwrap().started {
            return Err(SpError::Busy);
        }
        self.opts.lock().unwrap().tls = Some(cfg);
        Ok(())
    }

    /// WebSocket tuning for `ws` / `wss` URLs. Before start only.
    pub fn set_ws_config(&self, cfg: websocket::WsConfig) -> SpResult<()> {
        if self.state.lock().unwrap().started {
            return Err(SpError::Busy);
        }
        self.opts.lock().unwrap().ws = Some(cfg);
        Ok(())
    }

    /// The concrete TCP port the transport bound, when it has one. Useful with
    ///  port 0 in the URL.
    pub fn bound_port(&self) -> SpResult<u16> {
        let listener = self.tran_listener.get().ok_or(SpError::Closed)?;
        match listener.get(spcore::stream::prop::LOCAL_ADDR)? {
            spcore::PropertyValue::Sockaddr(sa) => Ok(sa.port()),
            _ => Err(SpError::NotSupported),
        }
    }

    /// Bind and start accepting. A bind failure (`AddrInUse` and friends) is
    ///  returned synchronously and leaves the endpoint unstarted.
    pub(crate) fn start(self: &Arc<Self>) -> SpResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.started {
                return Err(SpError::Busy);
            }
            if st.closed {
                return Err(SpError::Closed);
            }
            st.started = true;
        }

        let tran = match transport::find(self.url.scheme) {
            Ok(tran) => tran,
            Err(rv) => {
                self.state.lock().unwrap().started = false;
                return Err(rv);
            }
        };
        let listener = {
            let opts = self.opts.lock().unwrap();
            tran.listener(&self.url, &opts)
        };
        let listener = match listener {
            Ok(l) => l,
            Err(rv) => {
                self.state.lock().unwrap().started = false;
                return Err(rv);
            }
        };
        if let Err(rv) = listener.listen() {
            warn!("listener<{}>: binding {} failed: {}", self.id, self.url, rv);
            self.stats.bump_error(rv);
            self.state.lock().unwrap().started = false;
            return Err(rv);
        }
        let _ = self.tran_listener.set(listener);

        info!("starting listener<{}> on {}", self.id, self.url);
        self.arm_pipe_wait();
        let mut st = self.state.lock().unwrap();
        self.kick_accept(&mut st);
        Ok(())
    }

    fn kick_accept(self: &Arc<Self>, st: &mut std::sync::MutexGuard<'_, EpState>) {
        if st.accepting || st.closed || !st.started {
            return;
        }
        let Some(listener) = self.tran_listener.get() else {
            return;
        };
        st.accepting = true;
        let aio = self.acc_aio.get().expect("installed at create");
        listener.accept(aio);
    }

    fn accept_cb(self: &Arc<Self>) {
        let aio = self.acc_aio.get().expect("installed at create").clone();
        let correlation_id = Uuid::new_v4();

        let mut st = self.state.lock().unwrap();
        st.accepting = false;

        match aio.result() {
            Ok(()) => {
                let Some(stream) = spcore::stream::take_stream_output(&aio) else {
                    self.kick_accept(&mut st);
                    return;
                };
                let Some(sock) = self.sock.upgrade() else {
                    return;
                };
                if st.closed {
                    drop(st);
                    stream.close();
                    return;
                }
                let recvmax = self.recvmax.load(Ordering::Relaxed);
                match Pipe::create(
                    &sock,
                    Creator::Listener(Arc::downgrade(self)),
                    stream,
                    recvmax,
                ) {
                    Ok(pipe) => {
                        debug!(
                            "listener<{}>: accepted, negotiating pipe<{}> ({})",
                            self.id,
                            pipe.id(),
                            correlation_id
                        );
                        st.nego_pipes.push(pipe.clone());
                        let l = self.clone();
                        let p = pipe.clone();
                        pipe.conn().negotiate(move |res| l.nego_done(&p, res));
                    }
                    Err(rv) => self.stats.bump_error(rv),
                }
                self.kick_accept(&mut st);
            }
            Err(rv) => {
                self.stats.bump_error(rv);
                match rv {
                    // remote conditions: no cool-down, accept again
                    SpError::ConnShutdown
                    | SpError::ConnRefused
                    | SpError::TimedOut
                    | SpError::PermissionDenied
                    | SpError::ProtocolError => {
                        warn!("listener<{}>: accept failed: {}", self.id, rv);
                        self.kick_accept(&mut st);
                    }
                    // teardown: no further action
                    SpError::Stopped | SpError::Closed | SpError::Canceled => {}
                    // likely resource exhaustion; cool down before retrying
                    _ => {
                        warn!(
                            "listener<{}>: accept failed: {}, backing off briefly",
                            self.id, rv
                        );
                        drop(st);
                        let tmo = self.tmo_aio.get().expect("installed at create");
                        tmo.sleep(Some(ACCEPT_RETRY));
                    }
                }
            }
        }
    }

    fn timer_cb(self: &Arc<Self>) {
        let aio = self.tmo_aio.get().expect("installed at create");
        if aio.result().is_ok() {
            let mut st = self.state.lock().unwrap();
            self.kick_accept(&mut st);
        }
    }

    fn nego_done(self: &Arc<Self>, pipe: &Arc<Pipe>, res: SpResult<u16>) {
        let mut st = self.state.lock().unwrap();
        st.nego_pipes.retain(|p| !Arc::ptr_eq(p, pipe));

        match res {
            Ok(peer) => {
                pipe.set_peer(peer);
                st.wait_pipes.push_back(pipe.clone());
                self.match_pipes(&mut st);
            }
            Err(rv) => {
                drop(st);
                debug!("listener<{}>: negotiation failed: {}", self.id, rv);
                self.stats.bump_error(rv);
                pipe.close();
            }
        }
    }

    fn match_pipes(self: &Arc<Self>, st: &mut std::sync::MutexGuard<'_, EpState>) {
        if st.user_aio.is_none() || st.wait_pipes.is_empty() {
            return;
        }
        let aio = st.user_aio.take().expect("user aio was just checked");
        let pipe = st.wait_pipes.pop_front().expect("wait pipe was just checked");
        aio.set_output(0, Box::new(pipe));
        aio.finish(Ok(()), 0);
    }

    fn arm_pipe_wait(self: &Arc<Self>) {
        let aio = self.pipe_aio.get().expect("installed at create").clone();
        aio.reset();
        let l = self.clone();
        let started = aio.start(Some(Box::new(move |aio, rv| {
            let mut st = l.state.lock().unwrap();
            if st
                .user_aio
                .as_ref()
                .map(|a| Arc::ptr_eq(a, aio))
                .unwrap_or(false)
            {
                st.user_aio = None;
                drop(st);
                aio.finish_error(rv);
            }
        })));
        if !started {
            return;
        }
        let mut st = self.state.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(SpError::Closed);
            return;
        }
        st.user_aio = Some(aio);
        self.match_pipes(&mut st);
    }

    fn pipe_ready_cb(self: &Arc<Self>) {
        let aio = self.pipe_aio.get().expect("installed at create").clone();
        match aio.result() {
            Ok(()) => {
                let Some(pipe) = aio
                    .take_output(0)
                    .and_then(|any| any.downcast::<Arc<Pipe>>().ok())
                    .map(|b| *b)
                else {
                    return;
                };
                let Some(sock) = self.sock.upgrade() else {
                    return;
                };
                self.stats.established.fetch_add(1, Ordering::Relaxed);
                if !sock.add_pipe(&pipe) {
                    self.stats.reject.fetch_add(1, Ordering::Relaxed);
                }
                self.arm_pipe_wait();
            }
            Err(SpError::Closed) | Err(SpError::Stopped) => {}
            Err(_) => self.arm_pipe_wait(),
        }
    }

    pub(crate) fn pipe_closed(self: &Arc<Self>, pipe: &Arc<Pipe>) {
        let mut st = self.state.lock().unwrap();
        st.nego_pipes.retain(|p| !Arc::ptr_eq(p, pipe));
        st.wait_pipes.retain(|p| !Arc::ptr_eq(p, pipe));
    }

    /// Close the endpoint and every pipe it produced.
    pub fn close(self: &Arc<Self>) {
        let (negos, waits) = {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            if let Some(aio) = st.user_aio.take() {
                aio.finish_error(SpError::Closed);
            }
            (
                std::mem::take(&mut st.nego_pipes),
                std::mem::take(&mut st.wait_pipes),
            )
        };
        debug!("closing listener<{}>", self.id);

        if let Some(acc) = self.acc_aio.get() {
            acc.close();
        }
        if let Some(tmo) = self.tmo_aio.get() {
            tmo.close();
        }
        if let Some(listener) = self.tran_listener.get() {
            listener.close();
        }
        for pipe in negos.into_iter().chain(waits) {
            pipe.close();
        }
        if let Some(sock) = self.sock.upgrade() {
            sock.close_pipes_of_listener(self.id);
        }
    }
}
