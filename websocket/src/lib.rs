//! WebSocket (RFC 6455) as a byte-stream transport.
//!
//! Three layers:
//! * [`frame`] - the frame codec: header layout, opcodes, masking;
//! * [`handshake`] - the HTTP/1.1 upgrade bootstrap, hand-rolled request and
//!   response heads plus the `Sec-WebSocket-Accept` computation;
//! * [`stream`] - the connection state machine: fragmentation, control-frame
//!   preemption, limits, and the close handshake.
//!
//! [`WsDialer`] and [`WsListener`] implement the generic stream dialer/listener
//!  contract over any lower transport (plain TCP for `ws://`, a TLS-wrapped one
//!  for `wss://`).

pub mod frame;
pub mod handshake;
pub mod stream;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use spcore::aio::RecvBuf;
use spcore::stream::{prop, take_stream_output, PropertyValue};
use spcore::tcp::{TcpDialer, TcpListener};
use spcore::url::Scheme;
use spcore::{Aio, SpError, SpResult, SpUrl, Stream, StreamDialer, StreamListener};
use tracing::debug;

use handshake::{
    check_client_request, check_server_response, client_request, head_end, make_key, RequestHead,
    ResponseHead, MAX_HEAD,
};
pub use stream::{WsConfig, WsStream};

/// Server-side hook run after a structurally valid upgrade request. It may edit
///  the prepared 101 response (headers, cookies) or reject with an HTTP status.
pub type AcceptHook = Arc<dyn Fn(&RequestHead, &mut ResponseHead) -> Result<(), u16> + Send + Sync>;

enum UpPhase {
    Send,
    Recv,
    Done,
}

struct UpState {
    phase: UpPhase,
    inbuf: BytesMut,
    key: String,
    // server decision carried across the response write
    outcome: Option<SpResult<Option<String>>>,
}

/// One in-flight HTTP upgrade, client or server side, driven by a single
///  internal aio chained over the lower stream.
struct Upgrade {
    server: bool,
    cfg: WsConfig,
    hook: Option<AcceptHook>,
    lower: Mutex<Option<Box<dyn Stream>>>,
    user: Arc<Aio>,
    io_aio: Mutex<Option<Arc<Aio>>>,
    state: Mutex<UpState>,
    unregister: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Upgrade {
    fn start_client(
        lower: Box<dyn Stream>,
        user: Arc<Aio>,
        cfg: WsConfig,
        host: &str,
        path: &str,
    ) -> Arc<Upgrade> {
        let key = make_key();
        let req = client_request(host, path, &key, &cfg.protocols);
        let mut out = BytesMut::new();
        req.ser(&mut out);

        let up = Arc::new(Upgrade {
            server: false,
            cfg,
            hook: None,
            lower: Mutex::new(Some(lower)),
            user,
            io_aio: Mutex::new(None),
            state: Mutex::new(UpState {
                phase: UpPhase::Send,
                inbuf: BytesMut::new(),
                key,
                outcome: None,
            }),
            unregister: Mutex::new(None),
        });
        up.install_aio();
        up.submit_send(out.freeze());
        up
    }

    fn start_server(
        lower: Box<dyn Stream>,
        user: Arc<Aio>,
        cfg: WsConfig,
        hook: Option<AcceptHook>,
    ) -> Arc<Upgrade> {
        let up = Arc::new(Upgrade {
            server: true,
            cfg,
            hook,
            lower: Mutex::new(Some(lower)),
            user,
            io_aio: Mutex::new(None),
            state: Mutex::new(UpState {
                phase: UpPhase::Recv,
                inbuf: BytesMut::new(),
                key: String::new(),
                outcome: None,
            }),
            unregister: Mutex::new(None),
        });
        up.install_aio();
        up.submit_recv();
        up
    }

    fn install_aio(self: &Arc<Self>) {
        let up = self.clone();
        let aio = Aio::new(move || up.io_cb());
        *self.io_aio.lock().unwrap() = Some(aio);
    }

    fn set_unregister(&self, f: impl FnOnce() + Send + 'static) {
        *self.unregister.lock().unwrap() = Some(Box::new(f));
    }

    fn abort(&self, rv: SpError) {
        let aio = self.io_aio.lock().unwrap().clone();
        if let Some(aio) = aio {
            aio.abort(rv);
        }
    }

    fn submit_send(&self, out: Bytes) {
        let aio = self.io_aio.lock().unwrap().clone().expect("aio installed");
        aio.set_iov(vec![out]).expect("one chunk always fits");
        let lower = self.lower.lock().unwrap();
        if let Some(lower) = lower.as_ref() {
            lower.send(&aio);
        }
    }

    fn submit_recv(&self) {
        let aio = self.io_aio.lock().unwrap().clone().expect("aio installed");
        aio.set_recv(RecvBuf::with_want(2048));
        let lower = self.lower.lock().unwrap();
        if let Some(lower) = lower.as_ref() {
            lower.recv(&aio);
        }
    }

    fn io_cb(self: &Arc<Self>) {
        let Some(aio) = self.io_aio.lock().unwrap().clone() else {
            return;
        };
        if let Err(rv) = aio.result() {
            self.fail(rv);
            return;
        }

        let phase_now = {
            let st = self.state.lock().unwrap();
            match st.phase {
                UpPhase::Send => 0,
                UpPhase::Recv => 1,
                UpPhase::Done => return,
            }
        };

        if phase_now == 0 {
            aio.iov_advance(aio.count());
            if aio.iov_count() > 0 {
                let lower = self.lower.lock().unwrap();
                if let Some(lower) = lower.as_ref() {
                    lower.send(&aio);
                }
                return;
            }
            self.sent_head();
        } else {
            if let Some(rb) = aio.take_recv() {
                let mut st = self.state.lock().unwrap();
                st.inbuf.extend_from_slice(&rb.buf);
            }
            self.got_bytes();
        }
    }

    /// A head was fully written: clients move on to reading the response,
    ///  servers act on the decision they made before writing theirs.
    fn sent_head(self: &Arc<Self>) {
        if !self.server {
            self.state.lock().unwrap().phase = UpPhase::Recv;
            self.submit_recv();
            return;
        }
        let outcome = self.state.lock().unwrap().outcome.take();
        match outcome {
            Some(Ok(proto)) => self.finish_stream(proto),
            Some(Err(rv)) => self.fail(rv),
            None => self.fail(SpError::ProtocolError),
        }
    }

    fn got_bytes(self: &Arc<Self>) {
        let head = {
            let mut st = self.state.lock().unwrap();
            match head_end(&st.inbuf) {
                Some(end) => {
                    let mut head = st.inbuf.split_to(end);
                    head.truncate(end - 4);
                    head
                }
                None => {
                    if st.inbuf.len() > MAX_HEAD {
                        drop(st);
                        self.fail(SpError::ProtocolError);
                        return;
                    }
                    drop(st);
                    self.submit_recv();
                    return;
                }
            }
        };

        if self.server {
            self.server_request(&head);
        } else {
            self.client_response(&head);
        }
    }

    fn client_response(self: &Arc<Self>, head: &[u8]) {
        let key = self.state.lock().unwrap().key.clone();
        let res = match ResponseHead::deser(head) {
            Ok(res) => res,
            Err(rv) => {
                self.fail(rv);
                return;
            }
        };
        match check_server_response(&res, &key) {
            Ok(proto) => self.finish_stream(proto),
            Err(rv) => {
                debug!("upgrade refused by server: {} {}", res.status, res.reason);
                self.fail(rv);
            }
        }
    }

    fn server_request(self: &Arc<Self>, head: &[u8]) {
        let req = match RequestHead::deser(head) {
            Ok(req) => req,
            Err(rv) => {
                self.fail(rv);
                return;
            }
        };

        let decision = match check_client_request(&req, &self.cfg.protocols) {
            Ok(mut res) => {
                let hooked = match &self.hook {
                    Some(hook) => hook(&req, &mut res),
                    None => Ok(()),
                };
                match hooked {
                    Ok(()) => {
                        let proto = res.header("Sec-WebSocket-Protocol").map(str::to_string);
                        (res, Ok(proto))
                    }
                    Err(status) => {
                        debug!("upgrade denied by hook with status {}", status);
                        let (rv, reason) = if status == 403 {
                            (SpError::PermissionDenied, "Forbidden")
                        } else {
                            (SpError::ProtocolError, "Bad Request")
                        };
                        (ResponseHead::new(status, reason), Err(rv))
                    }
                }
            }
            Err(res) => {
                debug!("malformed upgrade request, answering {}", res.status);
                (res, Err(SpError::ProtocolError))
            }
        };

        let (res, outcome) = decision;
        let mut out = BytesMut::new();
        res.ser(&mut out);
        {
            let mut st = self.state.lock().unwrap();
            st.outcome = Some(outcome);
            st.phase = UpPhase::Send;
        }
        self.submit_send(out.freeze());
    }

    fn finish_stream(self: &Arc<Self>, proto: Option<String>) {
        let lower = self.lower.lock().unwrap().take();
        let Some(lower) = lower else {
            self.fail(SpError::Closed);
            return;
        };
        let spill = {
            let mut st = self.state.lock().unwrap();
            st.phase = UpPhase::Done;
            std::mem::take(&mut st.inbuf)
        };
        let ws = WsStream::new(lower, self.server, self.cfg.clone(), proto, spill);
        let boxed: Box<dyn Stream> = Box::new(ws);
        self.user.set_output(0, Box::new(boxed));
        self.user.finish(Ok(()), 0);
        self.cleanup();
    }

    fn fail(self: &Arc<Self>, rv: SpError) {
        if let Some(lower) = self.lower.lock().unwrap().take() {
            lower.close();
        }
        self.state.lock().unwrap().phase = UpPhase::Done;
        self.user.finish_error(rv);
        self.cleanup();
    }

    fn cleanup(&self) {
        // Dropping the aio slot breaks the upgrade<->aio reference cycle.
        self.io_aio.lock().unwrap().take();
        if let Some(f) = self.unregister.lock().unwrap().take() {
            f();
        }
    }
}

struct UpgradeSet {
    pending: Mutex<VecDeque<Arc<Upgrade>>>,
}

impl UpgradeSet {
    fn new() -> Arc<UpgradeSet> {
        Arc::new(UpgradeSet {
            pending: Mutex::new(VecDeque::new()),
        })
    }

    fn add(self: &Arc<Self>, up: &Arc<Upgrade>) {
        self.pending.lock().unwrap().push_back(up.clone());
        let set = self.clone();
        let weak = Arc::downgrade(up);
        up.set_unregister(move || {
            let mut pending = set.pending.lock().unwrap();
            pending.retain(|u| weak.upgrade().map(|up| !Arc::ptr_eq(u, &up)).unwrap_or(true));
        });
    }

    fn close_all(&self) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for up in pending {
            up.abort(SpError::Closed);
        }
    }
}

/// The lower dial/accept stage of one ws dial/accept, with the upgrade chained
///  behind it. The user's cancel aborts whichever stage is active.
struct WsOp {
    user: Arc<Aio>,
    conn_aio: Mutex<Option<Arc<Aio>>>,
    upgrade: Mutex<Option<Arc<Upgrade>>>,
}

impl WsOp {
    fn launch(
        user: &Arc<Aio>,
        start: impl FnOnce(&Arc<Aio>),
        on_stream: impl FnOnce(Box<dyn Stream>, Arc<Aio>) -> Arc<Upgrade> + Send + 'static,
    ) -> bool {
        let op = Arc::new(WsOp {
            user: user.clone(),
            conn_aio: Mutex::new(None),
            upgrade: Mutex::new(None),
        });

        user.reset();
        let cancel_op = op.clone();
        let cancel = move |_aio: &Arc<Aio>, rv: SpError| {
            if let Some(up) = cancel_op.upgrade.lock().unwrap().clone() {
                up.abort(rv);
                return;
            }
            if let Some(conn_aio) = cancel_op.conn_aio.lock().unwrap().clone() {
                conn_aio.abort(rv);
            }
        };
        if !user.start(Some(Box::new(cancel))) {
            return false;
        }

        let cb_op = op.clone();
        let on_stream = Mutex::new(Some(on_stream));
        let conn_aio = Aio::new(move || {
            let Some(conn_aio) = cb_op.conn_aio.lock().unwrap().take() else {
                return;
            };
            if let Err(rv) = conn_aio.result() {
                cb_op.user.finish_error(rv);
                return;
            }
            let Some(lower) = take_stream_output(&conn_aio) else {
                cb_op.user.finish_error(SpError::ConnShutdown);
                return;
            };
            let Some(f) = on_stream.lock().unwrap().take() else {
                return;
            };
            let up = f(lower, cb_op.user.clone());
            *cb_op.upgrade.lock().unwrap() = Some(up);
        });
        *op.conn_aio.lock().unwrap() = Some(conn_aio.clone());
        start(&conn_aio);
        true
    }
}

/// WebSocket stream dialer over a lower stream dialer.
pub struct WsDialer {
    host: String,
    path: String,
    lower: Box<dyn StreamDialer>,
    cfg: Mutex<WsConfig>,
    ups: Arc<UpgradeSet>,
}

impl WsDialer {
    pub fn new(
        lower: Box<dyn StreamDialer>,
        host: &str,
        path: &str,
        cfg: WsConfig,
    ) -> Arc<WsDialer> {
        Arc::new(WsDialer {
            host: host.to_string(),
            path: path.to_string(),
            lower,
            cfg: Mutex::new(cfg),
            ups: UpgradeSet::new(),
        })
    }

    /// Plain `ws[46]://` dialer over TCP. `wss` needs a TLS-wrapped lower
    ///  dialer; callers construct one and use [`WsDialer::new`].
    pub fn for_url(url: &SpUrl, cfg: WsConfig) -> SpResult<Arc<WsDialer>> {
        let tcp_url = ws_to_tcp(url)?;
        let lower = TcpDialer::new(tcp_url)?;
        Ok(WsDialer::new(
            Box::new(lower),
            &url.host_port(),
            &url.path,
            cfg,
        ))
    }

    pub fn set_config(&self, cfg: WsConfig) {
        *self.cfg.lock().unwrap() = cfg;
    }
}

impl StreamDialer for WsDialer {
    fn dial(&self, aio: &Arc<Aio>) {
        let cfg = self.cfg.lock().unwrap().clone();
        let host = self.host.clone();
        let path = self.path.clone();
        let ups = self.ups.clone();
        WsOp::launch(
            aio,
            |conn_aio| self.lower.dial(conn_aio),
            move |lower, user| {
                let up = Upgrade::start_client(lower, user, cfg, &host, &path);
                ups.add(&up);
                up
            },
        );
    }

    fn close(&self) {
        self.lower.close();
        self.ups.close_all();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        let cfg = self.cfg.lock().unwrap();
        match name {
            prop::WS_FRAGSIZE => Ok(PropertyValue::Size(cfg.fragsize)),
            prop::WS_MAXFRAME => Ok(PropertyValue::Size(cfg.maxframe)),
            prop::RECV_MAX => Ok(PropertyValue::Size(cfg.recvmax)),
            _ => {
                drop(cfg);
                self.lower.get(name)
            }
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        match name {
            prop::WS_FRAGSIZE => cfg.fragsize = value.as_size()?,
            prop::WS_MAXFRAME => cfg.maxframe = value.as_size()?,
            prop::RECV_MAX => cfg.recvmax = value.as_size()?,
            _ => {
                drop(cfg);
                return self.lower.set(name, value);
            }
        }
        Ok(())
    }
}

/// WebSocket stream listener over a lower stream listener.
pub struct WsListener {
    lower: Box<dyn StreamListener>,
    cfg: Mutex<WsConfig>,
    hook: Mutex<Option<AcceptHook>>,
    ups: Arc<UpgradeSet>,
}

impl WsListener {
    pub fn new(lower: Box<dyn StreamListener>, cfg: WsConfig) -> Arc<WsListener> {
        Arc::new(WsListener {
            lower,
            cfg: Mutex::new(cfg),
            hook: Mutex::new(None),
            ups: UpgradeSet::new(),
        })
    }

    /// Plain `ws[46]://` listener over TCP; see [`WsDialer::for_url`] about `wss`.
    pub fn for_url(url: &SpUrl, cfg: WsConfig) -> SpResult<Arc<WsListener>> {
        let tcp_url = ws_to_tcp(url)?;
        let lower = TcpListener::new(tcp_url)?;
        Ok(WsListener::new(Box::new(lower), cfg))
    }

    pub fn set_config(&self, cfg: WsConfig) {
        *self.cfg.lock().unwrap() = cfg;
    }

    /// Install an accept hook (extra auth, response editing).
    pub fn set_hook(&self, hook: AcceptHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }
}

impl StreamListener for WsListener {
    fn listen(&self) -> SpResult<()> {
        self.lower.listen()
    }

    fn accept(&self, aio: &Arc<Aio>) {
        let cfg = self.cfg.lock().unwrap().clone();
        let hook = self.hook.lock().unwrap().clone();
        let ups = self.ups.clone();
        WsOp::launch(
            aio,
            |conn_aio| self.lower.accept(conn_aio),
            move |lower, user| {
                let up = Upgrade::start_server(lower, user, cfg, hook);
                ups.add(&up);
                up
            },
        );
    }

    fn close(&self) {
        self.lower.close();
        self.ups.close_all();
    }

    fn get(&self, name: &str) -> SpResult<PropertyValue> {
        let cfg = self.cfg.lock().unwrap();
        match name {
            prop::WS_FRAGSIZE => Ok(PropertyValue::Size(cfg.fragsize)),
            prop::WS_MAXFRAME => Ok(PropertyValue::Size(cfg.maxframe)),
            prop::RECV_MAX => Ok(PropertyValue::Size(cfg.recvmax)),
            _ => {
                drop(cfg);
                self.lower.get(name)
            }
        }
    }

    fn set(&self, name: &str, value: PropertyValue) -> SpResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        match name {
            prop::WS_FRAGSIZE => cfg.fragsize = value.as_size()?,
            prop::WS_MAXFRAME => cfg.maxframe = value.as_size()?,
            prop::RECV_MAX => cfg.recvmax = value.as_size()?,
            _ => {
                drop(cfg);
                return self.lower.set(name, value);
            }
        }
        Ok(())
    }
}

fn ws_to_tcp(url: &SpUrl) -> SpResult<SpUrl> {
    let scheme = match url.scheme {
        Scheme::Ws => Scheme::Tcp,
        Scheme::Ws4 => Scheme::Tcp4,
        Scheme::Ws6 => Scheme::Tcp6,
        _ => return Err(SpError::InvalidAddress),
    };
    Ok(SpUrl {
        scheme,
        host: url.host.clone(),
        port: url.port,
        path: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use spcore::PropertyValue;

    fn ws_pair(client_cfg: WsConfig, server_cfg: WsConfig) -> (Box<dyn Stream>, Box<dyn Stream>) {
        let listener =
            WsListener::for_url(&SpUrl::parse("ws://127.0.0.1:0/test").unwrap(), server_cfg)
                .unwrap();
        listener.listen().unwrap();
        let port = match listener.get(prop::LOCAL_ADDR).unwrap() {
            PropertyValue::Sockaddr(sa) => sa.port(),
            _ => panic!("listener must report a socket address"),
        };

        let acc = Aio::new_sync();
        listener.accept(&acc);

        let dialer = WsDialer::for_url(
            &SpUrl::parse(&format!("ws://127.0.0.1:{}/test", port)).unwrap(),
            client_cfg,
        )
        .unwrap();
        let dial = Aio::new_sync();
        dialer.dial(&dial);

        dial.wait();
        acc.wait();
        assert_eq!(dial.result(), Ok(()));
        assert_eq!(acc.result(), Ok(()));
        (
            take_stream_output(&dial).unwrap(),
            take_stream_output(&acc).unwrap(),
        )
    }

    fn send_all(stream: &dyn Stream, data: &[u8]) {
        let mut data = Bytes::copy_from_slice(data);
        while !data.is_empty() {
            let aio = Aio::new_sync();
            aio.set_iov(vec![data.clone()]).unwrap();
            stream.send(&aio);
            aio.wait();
            assert_eq!(aio.result(), Ok(()));
            let _ = data.split_to(aio.count());
        }
    }

    fn recv_exact(stream: &dyn Stream, want: usize) -> Vec<u8> {
        let aio = Aio::new_sync();
        aio.set_recv(RecvBuf::with_want(want));
        loop {
            stream.recv(&aio);
            aio.wait();
            assert_eq!(aio.result(), Ok(()));
            let rb = aio.take_recv().unwrap();
            if rb.is_full() {
                return rb.buf.to_vec();
            }
            aio.set_recv(rb);
        }
    }

    #[test]
    fn test_upgrade_and_echo() {
        let (client, server) = ws_pair(WsConfig::default(), WsConfig::default());

        send_all(client.as_ref(), b"over the websocket");
        assert_eq!(recv_exact(server.as_ref(), 18), b"over the websocket");

        send_all(server.as_ref(), b"reply");
        assert_eq!(recv_exact(client.as_ref(), 5), b"reply");

        client.stop();
        server.stop();
    }

    #[test]
    fn test_message_mode_fragments_large_sends() {
        let mut cfg = WsConfig::default();
        cfg.stream_mode = false;
        cfg.fragsize = 1024; // force fragmentation
        let (client, server) = ws_pair(cfg.clone(), cfg);

        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        let aio = Aio::new_sync();
        aio.set_iov(vec![Bytes::from(big.clone())]).unwrap();
        client.send(&aio);
        aio.wait();
        assert_eq!(aio.result(), Ok(()));
        assert_eq!(aio.count(), big.len()); // atomic in message mode

        assert_eq!(recv_exact(server.as_ref(), big.len()), big);
        client.stop();
        server.stop();
    }

    #[test]
    fn test_oversize_frame_closes_with_msg_too_big() {
        let mut server_cfg = WsConfig::default();
        server_cfg.maxframe = 512;
        let mut client_cfg = WsConfig::default();
        client_cfg.fragsize = 64 * 1024; // one big frame
        let (client, server) = ws_pair(client_cfg, server_cfg);

        // server posts a recv, then the oversize frame arrives
        let rx = Aio::new_sync();
        rx.set_recv(RecvBuf::with_want(4096));
        server.recv(&rx);

        send_all(client.as_ref(), &vec![7u8; 2048]);

        rx.wait();
        assert_eq!(rx.result(), Err(SpError::MsgTooBig));
        client.stop();
        server.stop();
    }

    #[test]
    fn test_graceful_close() {
        let (client, server) = ws_pair(WsConfig::default(), WsConfig::default());

        let rx = Aio::new_sync();
        rx.set_recv(RecvBuf::with_want(1));
        server.recv(&rx);

        client.close();

        // pending recv fails with closed once the close frame arrives
        rx.wait();
        assert_eq!(rx.result(), Err(SpError::Closed));

        // subsequent sends on the closing side fail immediately
        let tx = Aio::new_sync();
        tx.set_iov(vec![Bytes::from_static(b"x")]).unwrap();
        server.send(&tx);
        tx.wait();
        assert_eq!(tx.result(), Err(SpError::Closed));

        client.stop();
        server.stop();
    }

    #[test]
    fn test_accept_hook_can_deny() {
        let listener = WsListener::for_url(
            &SpUrl::parse("ws://127.0.0.1:0/auth").unwrap(),
            WsConfig::default(),
        )
        .unwrap();
        listener.set_hook(Arc::new(|req, _res| {
            if req.header("Authorization").is_none() {
                Err(403)
            } else {
                Ok(())
            }
        }));
        listener.listen().unwrap();
        let port = match listener.get(prop::LOCAL_ADDR).unwrap() {
            PropertyValue::Sockaddr(sa) => sa.port(),
            _ => unreachable!(),
        };

        let acc = Aio::new_sync();
        listener.accept(&acc);

        let dialer = WsDialer::for_url(
            &SpUrl::parse(&format!("ws://127.0.0.1:{}/auth", port)).unwrap(),
            WsConfig::default(),
        )
        .unwrap();
        let dial = Aio::new_sync();
        dialer.dial(&dial);

        dial.wait();
        acc.wait();
        assert_eq!(dial.result(), Err(SpError::PermissionDenied));
        assert_eq!(acc.result(), Err(SpError::PermissionDenied));
        listener.close();
    }

    /// Drive the server with raw bytes: the literal RFC upgrade exchange, then a
    ///  masked ping that must come back as an unmasked pong with the same payload.
    #[test]
    fn test_wire_level_upgrade_and_ping() {
        use spcore::tcp::TcpDialer;

        let listener = WsListener::for_url(
            &SpUrl::parse("ws://127.0.0.1:0/").unwrap(),
            WsConfig::default(),
        )
        .unwrap();
        listener.listen().unwrap();
        let port = match listener.get(prop::LOCAL_ADDR).unwrap() {
            PropertyValue::Sockaddr(sa) => sa.port(),
            _ => unreachable!(),
        };
        let acc = Aio::new_sync();
        listener.accept(&acc);

        let dialer =
            TcpDialer::new(SpUrl::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap()).unwrap();
        let dial = Aio::new_sync();
        dialer.dial(&dial);
        dial.wait();
        let raw = take_stream_output(&dial).unwrap();

        send_all(
            raw.as_ref(),
            b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );

        // read until the end of the response head
        let mut head = Vec::new();
        while head_end(&head).is_none() {
            let aio = Aio::new_sync();
            aio.set_recv(RecvBuf::with_want(1024));
            raw.recv(&aio);
            aio.wait();
            assert_eq!(aio.result(), Ok(()));
            head.extend_from_slice(&aio.take_recv().unwrap().buf);
        }
        let text = String::from_utf8(head.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        acc.wait();
        assert_eq!(acc.result(), Ok(()));
        let server = take_stream_output(&acc).unwrap();

        // masked ping, payload "hello"
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x89, 0x85];
        frame.extend_from_slice(&mask);
        let mut payload = *b"hello";
        frame::apply_mask(&mut payload, mask, 0);
        frame.extend_from_slice(&payload);
        send_all(raw.as_ref(), &frame);

        // the pong comes back unmasked with the identical payload
        let pong = recv_exact(raw.as_ref(), 7);
        assert_eq!(&pong[..2], &[0x8A, 0x05]);
        assert_eq!(&pong[2..], b"hello");

        raw.stop();
        server.stop();
        listener.close();
    }

    #[test]
    fn test_subprotocol_negotiation() {
        let mut server_cfg = WsConfig::default();
        server_cfg.protocols = vec!["pair.sp".to_string(), "chat".to_string()];
        let mut client_cfg = WsConfig::default();
        client_cfg.protocols = vec!["chat".to_string()];

        let (client, server) = ws_pair(client_cfg, server_cfg);
        assert_eq!(
            client.get(prop::WS_PROTOCOL).unwrap(),
            PropertyValue::Str("chat".to_string())
        );
        assert_eq!(
            server.get(prop::WS_PROTOCOL).unwrap(),
            PropertyValue::Str("chat".to_string())
        );
        client.stop();
        server.stop();
    }
}
