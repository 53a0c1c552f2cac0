use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rand::Rng;
use rustc_hash::FxHashMap;
use spcore::platform::platform;
use spcore::{Aio, SpResult, Stream};
use tracing::{debug, trace};

use crate::conn::SpConn;
use crate::dialer::Dialer;
use crate::listener::Listener;
use crate::socket::Socket;
use crate::stats::PipeStats;

/// Pipe lifecycle notifications delivered to the socket's registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// The pipe negotiated and is about to join the socket.
    AddPre,
    /// The pipe joined the socket's active set.
    AddPost,
    /// The pipe was torn down and left the socket.
    RemPost,
}

/// The process-wide pipe id map. Ids are random nonzero 31-bit values, unique
///  across all sockets for the lifetime of the process.
fn pipes() -> &'static Mutex<FxHashMap<u32, Arc<Pipe>>> {
    static PIPES: OnceLock<Mutex<FxHashMap<u32, Arc<Pipe>>>> = OnceLock::new();
    PIPES.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Which endpoint created a pipe - always exactly one of the two.
pub(crate) enum Creator {
    Dialer(Weak<Dialer>),
    Listener(Weak<Listener>),
}

/// One peer connection: the SP framing over one transport stream, attached to
///  a socket once negotiation and the protocol identity check passed.
///
/// Shared ownership (id map, socket, endpoint, in-flight callbacks) is carried
///  by the `Arc`; destruction happens on the reap thread after `close`.
pub struct Pipe {
    id: u32,
    sock: Weak<Socket>,
    creator: Creator,
    conn: Arc<SpConn>,
    closed: AtomicBool,
    peer: AtomicU16,
    stats: Arc<PipeStats>,
}

impl Pipe {
    pub(crate) fn create(
        sock: &Arc<Socket>,
        creator: Creator,
        stream: Box<dyn Stream>,
        recvmax: usize,
    ) -> SpResult<Arc<Pipe>> {
        let stats = Arc::new(PipeStats::default());
        let conn = SpConn::new(stream, sock.proto().self_id(), recvmax, stats.clone());

        let mut map = pipes().lock().unwrap();
        let id = loop {
            let candidate: u32 = rand::rng().random_range(1..=0x7fff_ffff);
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };
        let pipe = Arc::new(Pipe {
            id,
            sock: Arc::downgrade(sock),
            creator,
            conn,
            closed: AtomicBool::new(false),
            peer: AtomicU16::new(0),
            stats,
        });
        map.insert(id, pipe.clone());
        drop(map);

        trace!("created pipe<{}> on socket<{}>", id, sock.id());
        Ok(pipe)
    }

    /// Look a pipe up by id. Closed pipes remain findable until reaped, so a
    ///  callback may still read their properties.
    pub fn find(id: u32) -> Option<Arc<Pipe>> {
        pipes().lock().unwrap().get(&id).cloned()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The peer's negotiated protocol id (zero before negotiation).
    pub fn peer(&self) -> u16 {
        self.peer.load(Ordering::Acquire)
    }

    pub(crate) fn set_peer(&self, peer: u16) {
        self.peer.store(peer, Ordering::Release);
    }

    pub fn socket_id(&self) -> u32 {
        self.sock.upgrade().map(|s| s.id()).unwrap_or(0)
    }

    pub fn dialer(&self) -> Option<Arc<Dialer>> {
        match &self.creator {
            Creator::Dialer(d) => d.upgrade(),
            Creator::Listener(_) => None,
        }
    }

    pub fn listener(&self) -> Option<Arc<Listener>> {
        match &self.creator {
            Creator::Listener(l) => l.upgrade(),
            Creator::Dialer(_) => None,
        }
    }

    pub fn stats(&self) -> &PipeStats {
        &self.stats
    }

    pub(crate) fn conn(&self) -> &Arc<SpConn> {
        &self.conn
    }

    /// Send one message (attached to the aio) to the peer.
    pub fn send(&self, aio: &Arc<Aio>) {
        self.conn.send(aio);
    }

    /// Receive one message; it arrives attached to the aio.
    pub fn recv(&self, aio: &Arc<Aio>) {
        self.conn.recv(aio);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent close. The actual teardown runs on the reap thread: protocol
    ///  close hook, transport close, removal notification, id-map removal,
    ///  protocol stop hook, transport stop, socket and endpoint removal, and
    ///  finally the last reference drops.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing pipe<{}>", self.id);

        let pipe = self.clone();
        platform().reaper().reap(move || {
            let sock = pipe.sock.upgrade();

            if let Some(sock) = &sock {
                sock.proto().pipe_close(&pipe);
            }
            pipe.conn.close();
            if let Some(sock) = &sock {
                sock.run_pipe_cb(&pipe, PipeEvent::RemPost);
            }

            pipes().lock().unwrap().remove(&pipe.id);

            if let Some(sock) = &sock {
                sock.proto().pipe_stop(&pipe);
            }
            pipe.conn.stop();

            if let Some(sock) = &sock {
                sock.remove_pipe(pipe.id);
            }
            match &pipe.creator {
                Creator::Dialer(d) => {
                    if let Some(d) = d.upgrade() {
                        d.pipe_closed(&pipe);
                    }
                }
                Creator::Listener(l) => {
                    if let Some(l) = l.upgrade() {
                        l.pipe_closed(&pipe);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::RawProtocol;
    use rustc_hash::FxHashSet;
    use spcore::SpUrl;

    #[test]
    fn test_pipe_ids_are_unique_and_nonzero() {
        let sock = Socket::new(Box::new(RawProtocol::pair()));
        let listener = sock.listen("tcp://127.0.0.1:0").unwrap();
        let url = SpUrl {
            port: listener.bound_port().unwrap(),
            ..SpUrl::parse("tcp://127.0.0.1:0").unwrap()
        };

        let mut seen = FxHashSet::default();
        let mut dialers = Vec::new();
        for _ in 0..8 {
            let peer = Socket::new(Box::new(RawProtocol::pair()));
            let dialer = peer.dial(&url.to_string()).unwrap();
            dialer.wait_connected().unwrap();
            let pipes: Vec<_> = peer.pipes();
            assert_eq!(pipes.len(), 1);
            let id = pipes[0].id();
            assert!(id != 0 && id <= 0x7fff_ffff);
            assert!(seen.insert(id), "pipe id {} repeated", id);
            dialers.push(peer);
        }
        for peer in &dialers {
            peer.close();
        }
        sock.close();
    }
}
