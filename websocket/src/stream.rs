use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use spcore::aio::RecvBuf;
use spcore::stream::{prop, PropertyValue};
use spcore::{Aio, SpError, SpResult, Stream};
use tracing::{debug, trace};

use crate::frame::{apply_mask, close_code, FrameHead, Opcode, MAX_CONTROL_PAYLOAD};

/// How much we ask the lower stream for per read.
const READ_CHUNK: usize = 8192;

/// Tuning and mode switches for one WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Stream mode (default): each inbound frame's payload feeds pending recv
    ///  operations as it arrives, and one send maps to at most one frame.
    ///  Message mode (used by the SP transport): inbound frames accumulate until
    ///  FIN and a send is fragmented and delivered atomically.
    pub stream_mode: bool,
    /// Send text frames instead of binary.
    pub send_text: bool,
    /// Largest payload per outbound frame; 0 = unlimited.
    pub fragsize: usize,
    /// Largest acceptable inbound frame; 0 = unlimited. Violation closes with 1009.
    pub maxframe: usize,
    /// Largest acceptable assembled message (message mode); 0 = unlimited.
    pub recvmax: usize,
    /// Sub-protocols offered (client) or supported (server).
    pub protocols: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> WsConfig {
        WsConfig {
            stream_mode: true,
            send_text: false,
            fragsize: 64 * 1024,
            maxframe: 1024 * 1024,
            recvmax: 1024 * 1024,
            protocols: Vec::new(),
        }
    }
}

enum RxPhase {
    Head2,
    Ext { b0: u8, b1: u8, need: usize },
    Payload { head: FrameHead },
}

enum TxKind {
    Data { payload: usize },
    Ctl(Opcode),
}

struct WsState {
    send_queue: VecDeque<Arc<Aio>>,
    // bytes of the head-of-queue message already framed (message mode)
    tx_sent: usize,
    head_abort: Option<SpError>,
    ctl_queue: VecDeque<(Opcode, Bytes)>,
    tx_kind: Option<TxKind>,
    lower_sending: bool,
    lower_recving: bool,

    recv_queue: VecDeque<Arc<Aio>>,
    rx_raw: BytesMut,
    rx_phase: RxPhase,
    rx_frame: BytesMut,
    rx_msg: BytesMut,
    rx_pend: BytesMut,
    rx_op: Option<Opcode>,
    rx_eof: bool,

    close_sent: bool,
    close_recvd: bool,
    closing: bool,
    closed: bool,
    failed: Option<SpError>,
}

pub(crate) struct Ws {
    lower: Box<dyn Stream>,
    server: bool,
    cfg: WsConfig,
    proto: Option<String>,
    state: Mutex<WsState>,
    tx_aio: OnceLock<Arc<Aio>>,
    rx_aio: OnceLock<Arc<Aio>>,
}

/// One WebSocket connection over a lower byte stream, after the HTTP upgrade.
///
/// The receive side walks READ_HEAD2 -> (extended length / mask) -> payload ->
///  dispatch, per frame. Control frames preempt data at the head of the send
///  queue. A close frame from either side enters the CLOSING state: in-flight
///  sends drain, pending and subsequent operations fail with `Closed`, and the
///  lower stream is torn down once both close frames have passed.
#[derive(Clone)]
pub struct WsStream {
    ws: Arc<Ws>,
}

impl WsStream {
    /// Wrap an upgraded stream. `spill` holds any bytes read past the end of the
    ///  HTTP head during the handshake.
    pub(crate) fn new(
        lower: Box<dyn Stream>,
        server: bool,
        cfg: WsConfig,
        proto: Option<String>,
        spill: BytesMut,
    ) -> WsStream {
        let ws = Arc::new(Ws {
            lower,
            server,
            cfg,
            proto,
            state: Mutex::new(WsState {
                send_queue: VecDeque::new(),
                tx_sent: 0,
                head_abort: None,
                ctl_queue: VecDeque::new(),
                tx_kind: None,
                lower_sending: false,
                lower_recving: false,
                recv_queue: VecDeque::new(),
                rx_raw: spill,
                rx_phase: RxPhase::Head2,
                rx_frame: BytesMut::new(),
                rx_msg: BytesMut::new(),
                rx_pend: BytesMut::new(),
                rx_op: None,
                rx_eof: false,
                close_sent: false,
                close_recvd: false,
                closing: false,
                closed: false,
                failed: None,
            }),
            tx_aio: OnceLock::new(),
            rx_aio: OnceLock::new(),
        });

        let weak = Arc::downgrade(&ws);
        let _ = ws.tx_aio.set(Aio::new(move || {
            if let Some(w) = weak.upgrade() {
                w.tx_cb();
            }
        }));
        let weak = Arc::downgrade(&ws);
        let _ = ws.rx_aio.set(Aio::new(move || {
            if let Some(w) = weak.upgrade() {
                w.rx_cb();
            }
        }));

        ws.run();
        WsStream { ws }
    }

    /// The sub-protocol agreed during the upgrade, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.ws.proto.as_deref()
    }
}

impl Ws {
    fn tx_aio(&self) -> &Arc<Aio> {
        self.tx_aio.get().expect("tx aio is installed at construction")
    }

    fn rx_aio(&self) -> &Arc<Aio> {
        self.rx_aio.get().expect("rx aio is installed at construction")
    }

    fn run(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        self.parse_rx(&mut st);
        self.service_recvs(&mut st);
        self.start_tx(&mut st);
        self.start_rx(&mut st);
    }

    // ---- receive path ----

    fn parse_rx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>) {
        enum Step {
            Head(u8, u8),
            Ext(u8, u8, usize),
            Payload(usize),
        }

        loop {
            if st.failed.is_some() || st.closed || st.rx_eof {
                return;
            }
            let step = match &st.rx_phase {
                RxPhase::Head2 => {
                    if st.rx_raw.len() < 2 {
                        return;
                    }
                    Step::Head(st.rx_raw[0], st.rx_raw[1])
                }
                RxPhase::Ext { b0, b1, need } => {
                    if st.rx_raw.len() < *need {
                        return;
                    }
                    Step::Ext(*b0, *b1, *need)
                }
                RxPhase::Payload { head } => Step::Payload(head.len as usize),
            };
            match step {
                Step::Head(b0, b1) => {
                    st.rx_raw.advance(2);
                    let need =
                        FrameHead::ext_len(b1) + if FrameHead::is_masked(b1) { 4 } else { 0 };
                    if need == 0 {
                        if !self.accept_head(st, b0, b1, &[]) {
                            return;
                        }
                    } else {
                        st.rx_phase = RxPhase::Ext { b0, b1, need };
                    }
                }
                Step::Ext(b0, b1, need) => {
                    let ext = st.rx_raw.split_to(need);
                    if !self.accept_head(st, b0, b1, &ext) {
                        return;
                    }
                }
                Step::Payload(total) => {
                    let take = (total - st.rx_frame.len()).min(st.rx_raw.len());
                    let chunk = st.rx_raw.split_to(take);
                    st.rx_frame.extend_from_slice(&chunk);
                    if st.rx_frame.len() < total {
                        return;
                    }
                    self.dispatch_frame(st);
                }
            }
        }
    }

    /// Validate a completed header and move to the payload phase. Returns false
    ///  when the connection entered error shutdown.
    fn accept_head(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, WsState>,
        b0: u8,
        b1: u8,
        ext: &[u8],
    ) -> bool {
        let head = match FrameHead::assemble(b0, b1, ext) {
            Ok(head) => head,
            Err(_) => {
                self.close_error(st, close_code::PROTOCOL_ERR, SpError::ProtocolError);
                return false;
            }
        };

        // Client-to-server traffic must be masked, the reverse must not be.
        if head.masked != self.server {
            self.close_error(st, close_code::PROTOCOL_ERR, SpError::ProtocolError);
            return false;
        }

        if self.cfg.maxframe > 0 && head.len > self.cfg.maxframe as u64 {
            debug!("inbound frame of {} bytes exceeds maxframe", head.len);
            self.close_error(st, close_code::TOO_BIG, SpError::MsgTooBig);
            return false;
        }

        if !head.op.is_control() {
            match (head.op, st.rx_op) {
                (Opcode::Cont, None) => {
                    self.close_error(st, close_code::PROTOCOL_ERR, SpError::ProtocolError);
                    return false;
                }
                (Opcode::Cont, Some(_)) => {}
                (_, Some(_)) => {
                    // new message before the previous one finished
                    self.close_error(st, close_code::PROTOCOL_ERR, SpError::ProtocolError);
                    return false;
                }
                (op, None) => st.rx_op = Some(op),
            }

            if !self.cfg.stream_mode && self.cfg.recvmax > 0 {
                let total = st.rx_msg.len() as u64 + head.len;
                if total > self.cfg.recvmax as u64 {
                    debug!("inbound message of {} bytes exceeds recvmax", total);
                    self.close_error(st, close_code::TOO_BIG, SpError::MsgTooBig);
                    return false;
                }
            }
        }

        st.rx_frame.clear();
        st.rx_phase = RxPhase::Payload { head };
        true
    }

    fn dispatch_frame(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>) {
        let RxPhase::Payload { head } = std::mem::replace(&mut st.rx_phase, RxPhase::Head2)
        else {
            return;
        };

        let mut payload = std::mem::take(&mut st.rx_frame);
        if head.masked {
            apply_mask(&mut payload, head.mask, 0);
        }
        trace!("frame {:?} fin={} len={}", head.op, head.fin, payload.len());

        match head.op {
            Opcode::Ping => {
                st.ctl_queue.push_back((Opcode::Pong, payload.freeze()));
            }
            Opcode::Pong => {}
            Opcode::Close => {
                st.close_recvd = true;
                st.closing = true;
                st.rx_eof = true;
                if !st.close_sent {
                    // reciprocal orderly close
                    let mut body = BytesMut::with_capacity(2);
                    body.put_u16(close_code::NORMAL);
                    st.ctl_queue.push_back((Opcode::Close, body.freeze()));
                } else {
                    st.closed = true;
                    self.lower.close();
                }
            }
            _ => {
                if head.fin {
                    st.rx_op = None;
                }
                if self.cfg.stream_mode {
                    st.rx_pend.extend_from_slice(&payload);
                } else {
                    st.rx_msg.extend_from_slice(&payload);
                    if head.fin {
                        let msg = std::mem::take(&mut st.rx_msg);
                        st.rx_pend.extend_from_slice(&msg);
                    }
                }
            }
        }
    }

    fn service_recvs(&self, st: &mut MutexGuard<'_, WsState>) {
        while let Some(aio) = st.recv_queue.front().cloned() {
            if !st.rx_pend.is_empty() {
                let Some(mut rb) = aio.take_recv() else {
                    st.recv_queue.pop_front();
                    aio.finish_error(SpError::InvalidArgument);
                    continue;
                };
                let n = rb.remaining().min(st.rx_pend.len());
                let chunk = st.rx_pend.split_to(n);
                rb.buf.extend_from_slice(&chunk);
                st.recv_queue.pop_front();
                aio.set_recv(rb);
                aio.finish(Ok(()), n);
            } else if let Some(rv) = st.failed {
                st.recv_queue.pop_front();
                aio.finish_error(rv);
            } else if st.rx_eof || st.closed {
                st.recv_queue.pop_front();
                aio.finish_error(SpError::Closed);
            } else {
                return;
            }
        }
    }

    fn start_rx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>) {
        if st.lower_recving || st.closed || st.rx_eof || st.failed.is_some() {
            return;
        }
        // Keep a read pending so control frames are handled promptly, but stop
        // once undelivered payload piles up; that is the back-pressure.
        let cap = self.cfg.maxframe.max(READ_CHUNK);
        if st.rx_pend.len() >= cap && st.recv_queue.is_empty() {
            return;
        }
        st.lower_recving = true;
        let aio = self.rx_aio();
        aio.reset();
        aio.set_recv(RecvBuf::with_want(READ_CHUNK));
        self.lower.recv(aio);
    }

    fn rx_cb(self: &Arc<Self>) {
        let aio = self.rx_aio().clone();
        {
            let mut st = self.state.lock().unwrap();
            st.lower_recving = false;
            match aio.result() {
                Ok(()) => {
                    if let Some(rb) = aio.take_recv() {
                        st.rx_raw.extend_from_slice(&rb.buf);
                    }
                }
                Err(rv) => {
                    if st.close_sent || st.close_recvd || st.closing {
                        // expected teardown after the close exchange
                        st.closed = true;
                        st.rx_eof = true;
                    } else {
                        self.fail(&mut st, rv);
                    }
                    self.service_recvs(&mut st);
                    return;
                }
            }
        }
        self.run();
    }

    // ---- transmit path ----

    fn start_tx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>) {
        if st.lower_sending || st.closed || st.failed.is_some() {
            return;
        }

        // Control frames preempt any queued data.
        if let Some((op, payload)) = st.ctl_queue.pop_front() {
            debug_assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
            let mut head = FrameHead {
                fin: true,
                op,
                masked: !self.server,
                mask: [0; 4],
                len: payload.len() as u64,
            };
            let mut bufs = Vec::with_capacity(2);
            if head.masked {
                rand::rng().fill_bytes(&mut head.mask);
                let mut data = BytesMut::from(&payload[..]);
                apply_mask(&mut data, head.mask, 0);
                let mut hb = BytesMut::new();
                head.ser(&mut hb);
                bufs.push(hb.freeze());
                bufs.push(data.freeze());
            } else {
                let mut hb = BytesMut::new();
                head.ser(&mut hb);
                bufs.push(hb.freeze());
                bufs.push(payload);
            }
            st.tx_kind = Some(TxKind::Ctl(op));
            st.lower_sending = true;
            let aio = self.tx_aio();
            aio.reset();
            aio.set_iov(bufs).expect("control frames use two chunks");
            self.lower.send(aio);
            return;
        }

        if st.closing || st.close_sent {
            return;
        }
        let Some(user) = st.send_queue.front().cloned() else {
            return;
        };

        // One data frame out of the head of the user queue.
        let chunks = user.iov();
        let remaining: usize = chunks.iter().map(Bytes::len).sum();
        let payload_len = if self.cfg.fragsize > 0 {
            remaining.min(self.cfg.fragsize)
        } else {
            remaining
        };
        let fin = if self.cfg.stream_mode {
            true
        } else {
            payload_len == remaining
        };
        let op = if st.tx_sent == 0 {
            if self.cfg.send_text {
                Opcode::Text
            } else {
                Opcode::Binary
            }
        } else {
            Opcode::Cont
        };

        let mut head = FrameHead {
            fin,
            op,
            masked: !self.server,
            mask: [0; 4],
            len: payload_len as u64,
        };

        let mut bufs: Vec<Bytes> = Vec::with_capacity(chunks.len() + 1);
        if head.masked {
            rand::rng().fill_bytes(&mut head.mask);
            let mut data = BytesMut::with_capacity(payload_len);
            let mut left = payload_len;
            for c in &chunks {
                if left == 0 {
                    break;
                }
                let n = c.len().min(left);
                data.extend_from_slice(&c[..n]);
                left -= n;
            }
            apply_mask(&mut data, head.mask, 0);
            let mut hb = BytesMut::new();
            head.ser(&mut hb);
            bufs.push(hb.freeze());
            bufs.push(data.freeze());
        } else {
            let mut hb = BytesMut::new();
            head.ser(&mut hb);
            bufs.push(hb.freeze());
            let mut left = payload_len;
            for c in &chunks {
                if left == 0 {
                    break;
                }
                let n = c.len().min(left);
                bufs.push(c.slice(..n));
                left -= n;
            }
        }
        user.iov_advance(payload_len);

        st.tx_kind = Some(TxKind::Data { payload: payload_len });
        st.lower_sending = true;
        let aio = self.tx_aio();
        aio.reset();
        if aio.set_iov(bufs).is_err() {
            // more than 8 chunks: flatten instead (rare, large gather lists)
            let mut flat = BytesMut::new();
            let mut hb = BytesMut::new();
            head.ser(&mut hb);
            flat.extend_from_slice(&hb);
            let mut left = payload_len;
            for c in &chunks {
                if left == 0 {
                    break;
                }
                let n = c.len().min(left);
                flat.extend_from_slice(&c[..n]);
                left -= n;
            }
            aio.set_iov(vec![flat.freeze()]).expect("one chunk always fits");
        }
        self.lower.send(aio);
    }

    fn tx_cb(self: &Arc<Self>) {
        let aio = self.tx_aio().clone();
        {
            let mut st = self.state.lock().unwrap();
            match aio.result() {
                Ok(()) => {
                    aio.iov_advance(aio.count());
                    if aio.iov_count() > 0 {
                        self.lower.send(&aio);
                        return;
                    }
                    st.lower_sending = false;
                }
                Err(rv) => {
                    st.lower_sending = false;
                    self.fail(&mut st, rv);
                    return;
                }
            }

            match st.tx_kind.take() {
                Some(TxKind::Data { payload }) => {
                    st.tx_sent += payload;
                    if let Some(rv) = st.head_abort.take() {
                        if let Some(user) = st.send_queue.pop_front() {
                            st.tx_sent = 0;
                            user.finish_error(rv);
                        }
                    } else if let Some(user) = st.send_queue.front().cloned() {
                        let done = if self.cfg.stream_mode {
                            true
                        } else {
                            user.iov_count() == 0
                        };
                        if done {
                            st.send_queue.pop_front();
                            let n = if self.cfg.stream_mode {
                                payload
                            } else {
                                st.tx_sent
                            };
                            st.tx_sent = 0;
                            user.finish(Ok(()), n);
                        }
                    }
                }
                Some(TxKind::Ctl(Opcode::Close)) => {
                    st.close_sent = true;
                    for user in st.send_queue.drain(..) {
                        user.finish_error(SpError::Closed);
                    }
                    st.tx_sent = 0;
                    if st.close_recvd {
                        st.closed = true;
                        self.lower.close();
                    }
                }
                _ => {}
            }
        }
        self.run();
    }

    // ---- shutdown ----

    /// Protocol violation or limit breach: send a close with `code`, fail
    ///  everything pending with `rv`, stop reading.
    fn close_error(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>, code: u16, rv: SpError) {
        debug!("closing connection with code {}: {}", code, rv);
        st.failed = Some(rv);
        st.rx_eof = true;
        if !st.close_sent && !st.closing {
            let mut body = BytesMut::with_capacity(2);
            body.put_u16(code);
            st.ctl_queue.push_back((Opcode::Close, body.freeze()));
        }
        st.closing = true;
        for user in st.send_queue.drain(..) {
            user.finish_error(rv);
        }
        st.tx_sent = 0;
        self.service_recvs(st);
        self.start_tx(st);
    }

    /// Lower-stream failure: no close handshake is possible any more.
    fn fail(self: &Arc<Self>, st: &mut MutexGuard<'_, WsState>, rv: SpError) {
        if st.failed.is_none() {
            st.failed = Some(rv);
        }
        st.closed = true;
        st.rx_eof = true;
        for user in st.send_queue.drain(..) {
            user.finish_error(rv);
        }
        st.tx_sent = 0;
        self.service_recvs(st);
        self.lower.close();
    }

    fn cancel_user(&self, is_send: bool, aio: &Arc<Aio>, rv: SpError) {
        let mut st = self.state.lock().unwrap();
        if is_send {
            if let Some(pos) = st.send_queue.iter().position(|a| Arc::ptr_eq(a, aio)) {
                if pos == 0 && st.lower_sending {
                    // frame in flight; the write callback finishes it
                    st.head_abort = Some(rv);
                    return;
                }
                st.send_queue.remove(pos);
                drop(st);
                aio.finish_error(rv);
            }
        } else if let Some(pos) = st.recv_queue.iter().position(|a| Arc::ptr_eq(a, aio)) {
            st.recv_queue.remove(pos);
            drop(st);
            aio.finish_error(rv);
        }
    }

    fn close_impl(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        if st.closing || st.close_sent || st.closed {
            return;
        }
        st.closing = true;
        let mut body = BytesMut::with_capacity(2);
        body.put_u16(close_code::NORMAL);
        st.ctl_queue.push_back((Opcode::Close, body.freeze()));
        for user in st.send_queue.drain(..) {
            user.finish_error(SpError::Closed);
        }
        st.tx_sent = 0;
        for user in st.recv_queue.drain(..) {
            user.finish_error(SpError::Closed);
        }
        self.start_tx(&mut st);
    }
}

impl Stream for WsStream {
    fn send(&self, aio: &Arc<Aio>) {
        aio.reset();
        let ws = self.ws.clone();
        if !aio.start(Some(Box::new(move |aio, rv| ws.cancel_user(true, aio, rv)))) {
            return;
        }
        {
            let mut st = self.ws.state.lock().unwrap();
            if st.closing || st.close_sent || st.closed {
                drop(st);
                aio.finish_error(SpError::Closed);
                return;
            }
            if let Some(rv) = st.failed {
                drop(st);
                aio.finish_error(rv);
                return;
            }
            st.send_queue.push_back(aio.clone());
        }
        self.ws.run();
    }

    fn recv(&self, aio: &Arc<Aio>) {
        aio.reset();
        let ws = self.ws.clone();
        if !aio.start(Some(Box::new(move |aio, rv| ws.cancel_user(false, aio, rv)))) {
            return;
        }
        {
            let mut st = self.ws.state.lock().unwrap();
            if (st.closing || st.close_sent) && st.rx_pend.is_empty() {
                // undelivered payload stays readable, but nothing new comes
                let rv = st.failed.unwrap_or(SpError::Closed);
                drop(st);
                aio.finish_error(rv);
                return;
            }
            st.recv_queue.push_back(aio.clone());
        }
        self.ws.run();
    }

    fn close(&self) {
        self.ws.close_impl();
    }

    fn stop(&self) {
        self.ws.close_impl();
        self.ws.lower.stop();
        self.ws.tx_aio().stop();
        self.ws.rx_aio().stop();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        match name {
            prop::WS_PROTOCOL => self
                .ws
                .proto
                .clone()
                .map(PropertyValue::Str)
                .ok_or(SpError::NotSupported),
            prop::WS_FRAGSIZE => Ok(PropertyValue::Size(self.ws.cfg.fragsize)),
            prop::WS_MAXFRAME => Ok(PropertyValue::Size(self.ws.cfg.maxframe)),
            prop::RECV_MAX => Ok(PropertyValue::Size(self.ws.cfg.recvmax)),
            _ => self.ws.lower.get(name),
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        self.ws.lower.set(name, value)
    }
}
