use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use rand::Rng;
use spcore::{Aio, SpError, SpResult, SpUrl, StreamDialer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipe::{Creator, Pipe};
use crate::socket::Socket;
use crate::stats::EndpointStats;
use crate::transport::{self, EpOptions};

static DIALER_IDS: AtomicU32 = AtomicU32::new(1);

/// Reconnect pacing: exponential with jitter, bounded between min and max.
pub(crate) struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Backoff {
        Backoff {
            current: min,
            min,
            max,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        // jitter to half..full of the nominal delay, so a fleet of dialers
        // does not thunder in lockstep
        let millis = base.as_millis().max(1) as u64;
        Duration::from_millis(millis / 2 + rand::rng().random_range(0..=millis / 2))
    }
}

struct EpState {
    started: bool,
    closed: bool,
    dialing: bool,
    redialing: bool,
    nego_pipes: Vec<Arc<Pipe>>,
    wait_pipes: VecDeque<Arc<Pipe>>,
    user_aio: Option<Arc<Aio>>,
}

/// An outgoing endpoint: owns the transport stream dialer for one URL and keeps
///  exactly one pipe alive, reconnecting with backoff whenever it dies.
pub struct Dialer {
    id: u32,
    url: SpUrl,
    sock: Weak<Socket>,
    tran_dialer: OnceLock<Box<dyn StreamDialer>>,
    opts: Mutex<EpOptions>,
    recvmax: AtomicUsize,
    state: Mutex<EpState>,
    con_aio: OnceLock<Arc<Aio>>,
    pipe_aio: OnceLock<Arc<Aio>>,
    tmo_aio: OnceLock<Arc<Aio>>,
    backoff: Mutex<Backoff>,
    stats: EndpointStats,
    first: Mutex<Option<SpResult<()>>>,
    first_cv: Condvar,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish()
    }
}

impl Dialer {
    pub(crate) fn create(sock: &Arc<Socket>, url: SpUrl) -> SpResult<Arc<Dialer>> {
        transport::find(url.scheme)?;

        let d = Arc::new(Dialer {
            id: DIALER_IDS.fetch_add(1, Ordering::Relaxed),
            url,
            sock: Arc::downgrade(sock),
            tran_dialer: OnceLock::new(),
            opts: Mutex::new(EpOptions::default()),
            recvmax: AtomicUsize::new(sock.recvmax()),
            state: Mutex::new(EpState {
                started: false,
                closed: false,
                dialing: false,
                redialing: false,
                nego_pipes: Vec::new(),
                wait_pipes: VecDeque::new(),
                user_aio: None,
            }),
            con_aio: OnceLock::new(),
            pipe_aio: OnceLock::new(),
            tmo_aio: OnceLock::new(),
            backoff: Mutex::new(Backoff::new(
                Duration::from_millis(10),
                Duration::from_secs(10),
            )),
            stats: EndpointStats::default(),
            first: Mutex::new(None),
            first_cv: Condvar::new(),
        });

        let weak = Arc::downgrade(&d);
        let _ = d.con_aio.set(Aio::new(move || {
            if let Some(d) = weak.upgrade() {
                d.conn_cb();
            }
        }));
        let weak = Arc::downgrade(&d);
        let _ = d.pipe_aio.set(Aio::new(move || {
            if let Some(d) = weak.upgrade() {
                d.pipe_ready_cb();
            }
        }));
        let weak = Arc::downgrade(&d);
        let _ = d.tmo_aio.set(Aio::new(move || {
            if let Some(d) = weak.upgrade() {
                d.timer_cb();
            }
        }));
        Ok(d)
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

    /// Per-message receive limit for pipes of this endpoint; 0 disables.
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

    /// Reconnect backoff bounds.
    pub fn set_reconnect(&self, min: Duration, max: Duration) -> SpResult<()> {
        if min.is_zero() || max < min {
            return Err(SpError::InvalidArgument);
        }
        *self.backoff.lock().unwrap() = Backoff::new(min, max);
        Ok(())
    }

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
        let tran = transport::find(self.url.scheme)?;
        let opts = self.opts.lock().unwrap();
        let dialer = tran.dialer(&self.url, &opts)?;
        drop(opts);
        let _ = self.tran_dialer.set(dialer);

        info!("starting dialer<{}> for {}", self.id, self.url);
        self.arm_pipe_wait();
        let mut st = self.state.lock().unwrap();
        self.kick_dial(&mut st);
        Ok(())
    }

    /// Block until the first connection attempt resolved. Later reconnects do
    ///  not update this; it exists for synchronous-style callers.
    pub fn wait_connected(&self) -> SpResult<()> {
        let mut first = self.first.lock().unwrap();
        loop {
            if let Some(res) = *first {
                return res;
            }
            first = self.first_cv.wait(first).unwrap();
        }
    }

    fn set_first(&self, res: SpResult<()>) {
        let mut first = self.first.lock().unwrap();
        if first.is_none() {
            *first = Some(res);
            self.first_cv.notify_all();
        }
    }

    fn kick_dial(self: &Arc<Self>, st: &mut std::sync::MutexGuard<'_, EpState>) {
        if st.dialing || st.closed || !st.started {
            return;
        }
        let Some(dialer) = self.tran_dialer.get() else {
            return;
        };
        st.dialing = true;
        let aio = self.con_aio.get().expect("installed at create");
        debug!("dialer<{}>: connecting to {}", self.id, self.url);
        dialer.dial(aio);
    }

    fn conn_cb(self: &Arc<Self>) {
        let aio = self.con_aio.get().expect("installed at create").clone();
        let correlation_id = Uuid::new_v4();

        let mut st = self.state.lock().unwrap();
        st.dialing = false;

        match aio.result() {
            Ok(()) => {
                let Some(stream) = spcore::stream::take_stream_output(&aio) else {
                    drop(st);
                    self.set_first(Err(SpError::ConnShutdown));
                    self.schedule_redial();
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
                let pipe = match Pipe::create(
                    &sock,
                    Creator::Dialer(Arc::downgrade(self)),
                    stream,
                    recvmax,
                ) {
                    Ok(pipe) => pipe,
                    Err(rv) => {
                        drop(st);
                        self.stats.bump_error(rv);
                        self.schedule_redial();
                        return;
                    }
                };
                debug!(
                    "dialer<{}>: connected, negotiating pipe<{}> ({})",
                    self.id,
                    pipe.id(),
                    correlation_id
                );
                st.nego_pipes.push(pipe.clone());
                drop(st);
                let d = self.clone();
                let p = pipe.clone();
                pipe.conn().negotiate(move |res| d.nego_done(&p, res));
            }
            Err(rv) => {
                drop(st);
                self.stats.bump_error(rv);
                self.set_first(Err(rv));
                match rv {
                    SpError::Closed | SpError::Stopped | SpError::Canceled => {}
                    _ => {
                        warn!("dialer<{}>: connect to {} failed: {}", self.id, self.url, rv);
                        self.schedule_redial();
                    }
                }
            }
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
                debug!("dialer<{}>: negotiation failed: {}", self.id, rv);
                self.stats.bump_error(rv);
                self.set_first(Err(rv));
                pipe.close();
            }
        }
    }

    /// Hand a negotiated pipe to the armed pipe aio, if both are present.
    fn match_pipes(self: &Arc<Self>, st: &mut std::sync::MutexGuard<'_, EpState>) {
        if st.user_aio.is_none() || st.wait_pipes.is_empty() {
            return;
        }
        let aio = st.user_aio.take().expect("user aio was just checked");
        let pipe = st.wait_pipes.pop_front().expect("wait pipe was just checked");
        aio.set_output(0, Box::new(pipe));
        aio.finish(Ok(()), 0);
    }

    /// Arm the endpoint's pipe-delivery aio; negotiated pipes match against it.
    fn arm_pipe_wait(self: &Arc<Self>) {
        let aio = self.pipe_aio.get().expect("installed at create").clone();
        aio.reset();
        let d = self.clone();
        let started = aio.start(Some(Box::new(move |aio, rv| {
            let mut st = d.state.lock().unwrap();
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
                if sock.add_pipe(&pipe) {
                    self.backoff.lock().unwrap().reset();
                    self.set_first(Ok(()));
                } else {
                    self.stats.reject.fetch_add(1, Ordering::Relaxed);
                    self.set_first(Err(SpError::ProtocolError));
                }
                self.arm_pipe_wait();
            }
            Err(SpError::Closed) | Err(SpError::Stopped) => {}
            Err(_) => self.arm_pipe_wait(),
        }
    }

    fn schedule_redial(self: &Arc<Self>) {
        let delay = {
            let mut st = self.state.lock().unwrap();
            if st.closed || !st.started || st.redialing {
                return;
            }
            st.redialing = true;
            self.backoff.lock().unwrap().next()
        };
        debug!("dialer<{}>: reconnecting in {:?}", self.id, delay);
        let aio = self.tmo_aio.get().expect("installed at create");
        aio.sleep(Some(delay));
    }

    fn timer_cb(self: &Arc<Self>) {
        let aio = self.tmo_aio.get().expect("installed at create");
        let mut st = self.state.lock().unwrap();
        st.redialing = false;
        if aio.result().is_ok() {
            self.kick_dial(&mut st);
        }
    }

    /// A pipe created here went away; reconnect unless we are shutting down.
    pub(crate) fn pipe_closed(self: &Arc<Self>, pipe: &Arc<Pipe>) {
        let mut st = self.state.lock().unwrap();
        st.nego_pipes.retain(|p| !Arc::ptr_eq(p, pipe));
        st.wait_pipes.retain(|p| !Arc::ptr_eq(p, pipe));
        if st.closed || !st.started {
            return;
        }
        drop(st);
        self.schedule_redial();
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
        debug!("closing dialer<{}>", self.id);
        self.set_first(Err(SpError::Closed));

        if let Some(con) = self.con_aio.get() {
            con.close();
        }
        if let Some(tmo) = self.tmo_aio.get() {
            tmo.close();
        }
        if let Some(dialer) = self.tran_dialer.get() {
            dialer.close();
        }
        for pipe in negos.into_iter().chain(waits) {
            pipe.close();
        }
        if let Some(sock) = self.sock.upgrade() {
            sock.close_pipes_of_dialer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        let mut nominal = Vec::new();
        for _ in 0..6 {
            let d = b.next();
            nominal.push(d);
            assert!(d >= Duration::from_millis(5));
        }
        // the last delays are jittered off the cap
        assert!(nominal[5] <= Duration::from_millis(100));
        b.reset();
        assert!(b.next() <= Duration::from_millis(10));
    }
}
