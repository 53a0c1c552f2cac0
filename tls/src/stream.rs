use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::BufMut;
use spcore::aio::RecvBuf;
use spcore::stream::{prop, take_stream_output, PropertyValue};
use spcore::tcp::{TcpDialer, TcpListener};
use spcore::url::Scheme;
use spcore::{Aio, SpError, SpResult, SpUrl, Stream, StreamDialer, StreamListener};
use tracing::{debug, trace};

use crate::config::{Mode, TlsConfig};
use crate::engine::{engine, BufIo, EngineConn, EngineError};

struct TlsState {
    engine: Box<dyn EngineConn>,
    hs_done: bool,
    failed: Option<SpError>,
    closed: bool,
    send_queue: VecDeque<Arc<Aio>>,
    recv_queue: VecDeque<Arc<Aio>>,
    lower_sending: bool,
    lower_recving: bool,
}

/// The wrapper proper. Lives behind `Arc`; the public [`TlsStream`] handle clones
///  freely (dialer output, accept output) while this stays unique.
struct Tls {
    lower: Box<dyn Stream>,
    io: Arc<BufIo>,
    state: Mutex<TlsState>,
    tx_aio: OnceLock<Arc<Aio>>,
    rx_aio: OnceLock<Arc<Aio>>,
}

/// TLS over any byte stream. User sends complete once the engine has accepted the
///  plaintext (it may still sit in the outbound ring); user receives complete with
///  the first nonzero chunk the engine yields. The handshake is interleaved with
///  the service loop, so the stream is usable immediately after creation - early
///  operations simply queue until the handshake finishes.
#[derive(Clone)]
pub struct TlsStream {
    tls: Arc<Tls>,
}

impl TlsStream {
    pub fn start(lower: Box<dyn Stream>, cfg: &Arc<TlsConfig>) -> SpResult<TlsStream> {
        cfg.mark_busy();
        let io = BufIo::new();
        let eng = engine().open(cfg, cfg.mode(), io.clone())?;

        let tls = Arc::new(Tls {
            lower,
            io,
            state: Mutex::new(TlsState {
                engine: eng,
                hs_done: false,
                failed: None,
                closed: false,
                send_queue: VecDeque::new(),
                recv_queue: VecDeque::new(),
                lower_sending: false,
                lower_recving: false,
            }),
            tx_aio: OnceLock::new(),
            rx_aio: OnceLock::new(),
        });

        let weak = Arc::downgrade(&tls);
        let _ = tls.tx_aio.set(Aio::new(move || {
            if let Some(t) = weak.upgrade() {
                t.tx_cb();
            }
        }));
        let weak = Arc::downgrade(&tls);
        let _ = tls.rx_aio.set(Aio::new(move || {
            if let Some(t) = weak.upgrade() {
                t.rx_cb();
            }
        }));

        tls.run();
        Ok(TlsStream { tls })
    }
}

impl Tls {
    fn tx_aio(&self) -> &Arc<Aio> {
        self.tx_aio.get().expect("tx aio is installed at construction")
    }

    fn rx_aio(&self) -> &Arc<Aio> {
        self.rx_aio.get().expect("rx aio is installed at construction")
    }

    /// The operation loop: run the handshake if pending, satisfy the heads of the
    ///  user queues, then keep ciphertext moving on the lower stream.
    fn run(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();

        if st.failed.is_none() && !st.closed && !st.hs_done {
            match st.engine.handshake() {
                Ok(()) => {
                    debug!("TLS handshake complete");
                    st.hs_done = true;
                }
                Err(EngineError::WouldBlock) => {}
                Err(EngineError::Failed(rv)) => self.fail(&mut st, rv),
            }
        }

        if st.hs_done && st.failed.is_none() && !st.closed {
            self.service_sends(&mut st);
            self.service_recvs(&mut st);
        }

        // Outbound ciphertext: one lower send in flight at a time.
        if !st.lower_sending {
            if let Some(chunk) = self.io.drain_tx() {
                st.lower_sending = true;
                let aio = self.tx_aio();
                aio.reset();
                aio.set_iov(vec![chunk]).expect("a single chunk always fits the gather list");
                self.lower.send(aio);
            }
        }

        // Inbound ciphertext: read whenever the handshake or a user recv wants
        // data and the slab has room. Not reading a full slab is the back-pressure.
        let interested = !st.hs_done || !st.recv_queue.is_empty();
        if st.failed.is_none() && !st.closed && interested && !st.lower_recving {
            let space = self.io.rx_space();
            if space > 0 {
                st.lower_recving = true;
                let aio = self.rx_aio();
                aio.reset();
                aio.set_recv(RecvBuf::with_want(space));
                self.lower.recv(aio);
            }
        }
    }

    fn service_sends(&self, st: &mut MutexGuard<'_, TlsState>) {
        while let Some(aio) = st.send_queue.front().cloned() {
            let bufs = aio.iov();
            let Some(chunk) = bufs.iter().find(|b| !b.is_empty()) else {
                st.send_queue.pop_front();
                aio.finish(Ok(()), 0);
                continue;
            };
            match st.engine.send(chunk) {
                Ok(n) => {
                    // Engine took the bytes; short writes are legal upstream.
                    st.send_queue.pop_front();
                    aio.finish(Ok(()), n);
                }
                Err(EngineError::WouldBlock) => break,
                Err(EngineError::Failed(rv)) => {
                    st.send_queue.pop_front();
                    aio.finish_error(rv);
                }
            }
        }
    }

    fn service_recvs(&self, st: &mut MutexGuard<'_, TlsState>) {
        while let Some(aio) = st.recv_queue.front().cloned() {
            let Some(mut rb) = aio.take_recv() else {
                st.recv_queue.pop_front();
                aio.finish_error(SpError::InvalidArgument);
                continue;
            };
            let want = rb.remaining().min(crate::engine::RECORD_BUF);
            if want == 0 {
                st.recv_queue.pop_front();
                aio.set_recv(rb);
                aio.finish(Ok(()), 0);
                continue;
            }
            let mut tmp = vec![0u8; want];
            match st.engine.recv(&mut tmp) {
                Ok(0) => {
                    st.recv_queue.pop_front();
                    aio.set_recv(rb);
                    aio.finish_error(SpError::ConnShutdown);
                }
                Ok(n) => {
                    rb.buf.put_slice(&tmp[..n]);
                    st.recv_queue.pop_front();
                    aio.set_recv(rb);
                    aio.finish(Ok(()), n);
                }
                Err(EngineError::WouldBlock) => {
                    aio.set_recv(rb);
                    break;
                }
                Err(EngineError::Failed(rv)) => {
                    st.recv_queue.pop_front();
                    aio.set_recv(rb);
                    aio.finish_error(rv);
                }
            }
        }
    }

    fn fail(&self, st: &mut MutexGuard<'_, TlsState>, rv: SpError) {
        if st.failed.is_some() {
            return;
        }
        debug!("TLS stream failed: {}", rv);
        st.failed = Some(rv);
        for aio in st.send_queue.drain(..) {
            aio.finish_error(rv);
        }
        for aio in st.recv_queue.drain(..) {
            aio.finish_error(rv);
        }
        self.lower.close();
    }

    fn tx_cb(self: &Arc<Self>) {
        let aio = self.tx_aio().clone();
        {
            let mut st = self.state.lock().unwrap();
            match aio.result() {
                Ok(()) => {
                    aio.iov_advance(aio.count());
                    if aio.iov_count() > 0 {
                        // partial write; push the rest down
                        self.lower.send(&aio);
                        return;
                    }
                    st.lower_sending = false;
                    if st.closed {
                        drop(st);
                        self.lower.close();
                        return;
                    }
                }
                Err(rv) => {
                    st.lower_sending = false;
                    self.fail(&mut st, rv);
                    return;
                }
            }
        }
        self.run();
    }

    fn rx_cb(self: &Arc<Self>) {
        let aio = self.rx_aio().clone();
        {
            let mut st = self.state.lock().unwrap();
            st.lower_recving = false;
            match aio.result() {
                Ok(()) => {
                    if let Some(rb) = aio.take_recv() {
                        trace!("lower stream yielded {} ciphertext bytes", rb.buf.len());
                        self.io.fill_rx(&rb.buf);
                    }
                }
                Err(rv) => {
                    self.fail(&mut st, rv);
                    return;
                }
            }
        }
        self.run();
    }

    fn cancel_user(&self, is_send: bool, aio: &Arc<Aio>, rv: SpError) {
        let mut st = self.state.lock().unwrap();
        let q = if is_send {
            &mut st.send_queue
        } else {
            &mut st.recv_queue
        };
        if let Some(pos) = q.iter().position(|a| Arc::ptr_eq(a, aio)) {
            q.remove(pos);
            drop(st);
            aio.finish_error(rv);
        }
    }

    fn close_impl(self: &Arc<Self>) {
        let flush = {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            st.engine.close();
            let rv = st.failed.unwrap_or(SpError::Closed);
            for aio in st.send_queue.drain(..) {
                aio.finish_error(rv);
            }
            for aio in st.recv_queue.drain(..) {
                aio.finish_error(rv);
            }
            // Best effort close-notify: if a lower send is already in flight the
            // tx callback closes the lower stream after it drains.
            if !st.lower_sending {
                if let Some(chunk) = self.io.drain_tx() {
                    st.lower_sending = true;
                    let aio = self.tx_aio();
                    aio.reset();
                    aio.set_iov(vec![chunk]).expect("a single chunk always fits the gather list");
                    self.lower.send(aio);
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };
        if flush {
            self.lower.close();
        }
    }
}

impl Stream for TlsStream {
    fn send(&self, aio: &Arc<Aio>) {
        aio.reset();
        let t = self.tls.clone();
        if !aio.start(Some(Box::new(move |aio, rv| t.cancel_user(true, aio, rv)))) {
            return;
        }
        {
            let mut st = self.tls.state.lock().unwrap();
            if st.closed || st.failed.is_some() {
                let rv = st.failed.unwrap_or(SpError::Closed);
                drop(st);
                aio.finish_error(rv);
                return;
            }
            st.send_queue.push_back(aio.clone());
        }
        self.tls.run();
    }

    fn recv(&self, aio: &Arc<Aio>) {
        aio.reset();
        let t = self.tls.clone();
        if !aio.start(Some(Box::new(move |aio, rv| t.cancel_user(false, aio, rv)))) {
            return;
        }
        {
            let mut st = self.tls.state.lock().unwrap();
            if st.closed || st.failed.is_some() {
                let rv = st.failed.unwrap_or(SpError::Closed);
                drop(st);
                aio.finish_error(rv);
                return;
            }
            st.recv_queue.push_back(aio.clone());
        }
        self.tls.run();
    }

    fn close(&self) {
        self.tls.close_impl();
    }

    fn stop(&self) {
        self.tls.close_impl();
        self.tls.lower.stop();
        self.tls.tx_aio().stop();
        self.tls.rx_aio().stop();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::TLS_VERIFIED => {
                let st = self.tls.state.lock().unwrap();
                Ok(PropertyValue::Bool(st.engine.verified()))
            }
            prop::TLS_PEER_CN => {
                let st = self.tls.state.lock().unwrap();
                st.engine
                    .peer_cn()
                    .map(PropertyValue::Str)
                    .ok_or(SpError::NotSupported)
            }
            _ => self.tls.lower.get(name),
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        self.tls.lower.set(name, value)
    }
}

// Dialing: each attempt owns a private lower-dial aio; the user's cancel simply
// aborts it. The user aio completes as soon as the TLS wrapper is constructed;
// the handshake continues under the service loop.

struct PendingConn {
    user: Arc<Aio>,
    cfg: Arc<TlsConfig>,
    conn_aio: Mutex<Option<Arc<Aio>>>,
}

impl PendingConn {
    fn launch(
        user: &Arc<Aio>,
        cfg: &Arc<TlsConfig>,
        start: impl FnOnce(&Arc<Aio>),
    ) -> bool {
        let pending = Arc::new(PendingConn {
            user: user.clone(),
            cfg: cfg.clone(),
            conn_aio: Mutex::new(None),
        });

        let cancel = {
            let pending = pending.clone();
            move |_aio: &Arc<Aio>, rv: SpError| {
                if let Some(conn_aio) = pending.conn_aio.lock().unwrap().clone() {
                    conn_aio.abort(rv);
                }
            }
        };
        user.reset();
        if !user.start(Some(Box::new(cancel))) {
            return false;
        }

        let cb_pending = pending.clone();
        let conn_aio = Aio::new(move || cb_pending.conn_cb());
        *pending.conn_aio.lock().unwrap() = Some(conn_aio.clone());
        start(&conn_aio);
        true
    }

    fn conn_cb(&self) {
        // Taking the aio out breaks the pending<->aio cycle once we are done.
        let Some(conn_aio) = self.conn_aio.lock().unwrap().take() else {
            return;
        };
        if let Err(rv) = conn_aio.result() {
            self.user.finish_error(rv);
            return;
        }
        let Some(lower) = take_stream_output(&conn_aio) else {
            self.user.finish_error(SpError::ConnShutdown);
            return;
        };
        match TlsStream::start(lower, &self.cfg) {
            Ok(stream) => {
                let boxed: Box<dyn Stream> = Box::new(stream);
                self.user.set_output(0, Box::new(boxed));
                self.user.finish(Ok(()), 0);
            }
            Err(rv) => self.user.finish_error(rv),
        }
    }
}

/// TLS stream dialer: wraps a lower (typically TCP) stream dialer.
pub struct TlsDialer {
    lower: Box<dyn StreamDialer>,
    cfg: Arc<TlsConfig>,
}

impl TlsDialer {
    pub fn new(lower: Box<dyn StreamDialer>, cfg: Arc<TlsConfig>) -> SpResult<Arc<TlsDialer>> {
        if cfg.mode() != Mode::Client {
            return Err(SpError::InvalidArgument);
        }
        Ok(Arc::new(TlsDialer { lower, cfg }))
    }

    /// Build the lower TCP dialer from a `tls+tcp[46]` URL. The URL host becomes
    ///  the expected server name unless one was configured already.
    pub fn for_url(url: &SpUrl, cfg: Arc<TlsConfig>) -> SpResult<Arc<TlsDialer>> {
        let tcp_url = strip_tls(url)?;
        if cfg.server_name().is_none() {
            let _ = cfg.set_server_name(&url.host);
        }
        let lower = TcpDialer::new(tcp_url)?;
        TlsDialer::new(Box::new(lower), cfg)
    }

    pub fn config(&self) -> &Arc<TlsConfig> {
        &self.cfg
    }
}

impl StreamDialer for TlsDialer {
    fn dial(&self, aio: &Arc<Aio>) {
        self.cfg.mark_busy();
        PendingConn::launch(aio, &self.cfg, |conn_aio| self.lower.dial(conn_aio));
    }

    fn close(&self) {
        self.lower.close();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        self.lower.get(name)
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        self.lower.set(name, value)
    }
}

/// TLS stream listener: wraps a lower (typically TCP) stream listener.
pub struct TlsListener {
    lower: Box<dyn StreamListener>,
    cfg: Arc<TlsConfig>,
}

impl TlsListener {
    pub fn new(lower: Box<dyn StreamListener>, cfg: Arc<TlsConfig>) -> SpResult<Arc<TlsListener>> {
        if cfg.mode() != Mode::Server {
            return Err(SpError::InvalidArgument);
        }
        Ok(Arc::new(TlsListener { lower, cfg }))
    }

    pub fn for_url(url: &SpUrl, cfg: Arc<TlsConfig>) -> SpResult<Arc<TlsListener>> {
        let tcp_url = strip_tls(url)?;
        let lower = TcpListener::new(tcp_url)?;
        TlsListener::new(Box::new(lower), cfg)
    }

    pub fn config(&self) -> &Arc<TlsConfig> {
        &self.cfg
    }
}

impl StreamListener for TlsListener {
    fn listen(&self) -> SpResult<()> {
        self.cfg.mark_busy();
        self.lower.listen()
    }

    fn accept(&self, aio: &Arc<Aio>) {
        self.cfg.mark_busy();
        PendingConn::launch(aio, &self.cfg, |conn_aio| self.lower.accept(conn_aio));
    }

    fn close(&self) {
        self.lower.close();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        self.lower.get(name)
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        self.lower.set(name, value)
    }
}

fn strip_tls(url: &SpUrl) -> SpResult<SpUrl> {
    let scheme = match url.scheme {
        Scheme::TlsTcp => Scheme::Tcp,
        Scheme::TlsTcp4 => Scheme::Tcp4,
        Scheme::TlsTcp6 => Scheme::Tcp6,
        _ => return Err(SpError::InvalidAddress),
    };
    Ok(SpUrl {
        scheme,
        host: url.host.clone(),
        port: url.port,
        path: url.path.clone(),
    })
}
