use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use spcore::{SpError, SpResult};
use thiserror::Error;

use crate::config::{Mode, TlsConfig};

/// One TLS record of ciphertext buffering in each direction.
pub const RECORD_BUF: usize = 16 * 1024;

/// Result space for engine operations. `WouldBlock` signals back-pressure: the
///  engine should be called again once more ciphertext has moved.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine needs more ciphertext movement")]
    WouldBlock,
    #[error("engine failure: {0}")]
    Failed(SpError),
}

/// The pluggable cryptographic engine. Only this contract is in scope here; real
///  implementations live out of tree. The [`crate::null::NullEngine`] factory is
///  registered by default so the wrapper is exercisable end to end.
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn version(&self) -> &'static str;

    fn fips_mode(&self) -> bool;

    /// Open one connection-scoped engine. The engine moves ciphertext exclusively
    ///  through `io` and never touches the network itself.
    fn open(&self, cfg: &Arc<TlsConfig>, mode: Mode, io: Arc<BufIo>) -> SpResult<Box<dyn EngineConn>>;
}

/// Connection-scoped engine operations. Plaintext flows through `send`/`recv`;
///  ciphertext through the [`BufIo`] handed to the factory.
pub trait EngineConn: Send {
    /// Advance the handshake. `WouldBlock` until more ciphertext moves.
    fn handshake(&mut self) -> Result<(), EngineError>;

    /// Accept plaintext for transmission; returns bytes taken. `WouldBlock` when
    ///  the outbound ring has no room.
    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError>;

    /// Yield received plaintext; returns bytes produced, 0 on orderly TLS close.
    ///  `WouldBlock` when no complete record is available.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Begin an orderly shutdown (close notify goes into the outbound ring).
    fn close(&mut self);

    fn verified(&self) -> bool;

    fn peer_cn(&self) -> Option<String>;
}

struct BufIoState {
    // outbound ciphertext ring (engine -> network)
    tx: VecDeque<u8>,
    // inbound ciphertext slab (network -> engine)
    rx: VecDeque<u8>,
}

/// The ciphertext coupling between an engine and the stream wrapper. The engine
///  writes records out and reads records in; the wrapper drains the outbound side
///  to the lower stream and refills the inbound side from it. Fixed capacity in
///  both directions enforces back-pressure.
pub struct BufIo {
    state: Mutex<BufIoState>,
}

impl BufIo {
    pub fn new() -> Arc<BufIo> {
        Arc::new(BufIo {
            state: Mutex::new(BufIoState {
                tx: VecDeque::with_capacity(RECORD_BUF),
                rx: VecDeque::with_capacity(RECORD_BUF),
            }),
        })
    }

    /// Engine-side: emit ciphertext towards the network. Partial writes are
    ///  accepted; a full ring yields `WouldBlock`.
    pub fn write(&self, data: &[u8]) -> Result<usize, EngineError> {
        let mut st = self.state.lock().unwrap();
        let space = RECORD_BUF - st.tx.len();
        if space == 0 {
            return Err(EngineError::WouldBlock);
        }
        let n = space.min(data.len());
        st.tx.extend(&data[..n]);
        Ok(n)
    }

    /// Engine-side: consume ciphertext that arrived from the network.
    ///  `WouldBlock` when empty.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let mut st = self.state.lock().unwrap();
        if st.rx.is_empty() {
            return Err(EngineError::WouldBlock);
        }
        let n = st.rx.len().min(buf.len());
        for b in buf.iter_mut().take(n) {
            *b = st.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    /// Wrapper-side: take everything queued for the network.
    pub(crate) fn drain_tx(&self) -> Option<bytes::Bytes> {
        let mut st = self.state.lock().unwrap();
        if st.tx.is_empty() {
            return None;
        }
        let out: Vec<u8> = st.tx.drain(..).collect();
        Some(bytes::Bytes::from(out))
    }

    /// Wrapper-side: free room in the inbound slab.
    pub(crate) fn rx_space(&self) -> usize {
        RECORD_BUF - self.state.lock().unwrap().rx.len()
    }

    /// Wrapper-side: append ciphertext read off the lower stream.
    pub(crate) fn fill_rx(&self, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.rx.len() + data.len() <= RECORD_BUF);
        st.rx.extend(data);
    }
}

static ENGINE: OnceLock<Mutex<Arc<dyn EngineFactory>>> = OnceLock::new();

fn engine_slot() -> &'static Mutex<Arc<dyn EngineFactory>> {
    ENGINE.get_or_init(|| Mutex::new(Arc::new(crate::null::NullFactory)))
}

/// The process-wide engine factory; the null engine until one is registered.
pub fn engine() -> Arc<dyn EngineFactory> {
    engine_slot().lock().unwrap().clone()
}

/// Install a different engine factory for all subsequently opened connections.
pub fn register_engine(factory: Arc<dyn EngineFactory>) {
    *engine_slot().lock().unwrap() = factory;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bufio_roundtrip() {
        let io = BufIo::new();
        assert_eq!(io.write(b"abc").unwrap(), 3);
        let chunk = io.drain_tx().unwrap();
        assert_eq!(chunk.as_ref(), b"abc");
        assert!(io.drain_tx().is_none());

        io.fill_rx(b"xyz");
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(io.read(&mut buf), Err(EngineError::WouldBlock));
    }

    #[test]
    fn test_bufio_backpressure() {
        let io = BufIo::new();
        let big = vec![0u8; RECORD_BUF + 100];
        assert_eq!(io.write(&big).unwrap(), RECORD_BUF);
        assert_eq!(io.write(&big), Err(EngineError::WouldBlock));
        io.drain_tx().unwrap();
        assert_eq!(io.write(b"x").unwrap(), 1);
    }

    #[test]
    fn test_default_engine_is_null() {
        assert_eq!(engine().name(), "null");
    }
}
