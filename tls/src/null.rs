use std::sync::Arc;

use spcore::{SpError, SpResult};

use crate::config::{Mode, TlsConfig};
use crate::engine::{BufIo, EngineConn, EngineError, EngineFactory};

// Wire hello exchanged by the null handshake, one per side.
const HELLO: [u8; 4] = *b"STLS";

/// The engine registered by default: no cryptography, a 4-byte hello handshake,
///  and ciphertext == plaintext. It exists so the stream wrapper, its tests and
///  demos run end to end without an external TLS library; do not deploy it.
pub struct NullFactory;

impl EngineFactory for NullFactory {
    fn name(&self) -> &'static str {
        "null"
    }

    fn description(&self) -> &'static str {
        "pass-through engine without cryptography (testing only)"
    }

    fn version(&self) -> &'static str {
        "0"
    }

    fn fips_mode(&self) -> bool {
        false
    }

    fn open(
        &self,
        _cfg: &Arc<TlsConfig>,
        _mode: Mode,
        io: Arc<BufIo>,
    ) -> SpResult<Box<dyn EngineConn>> {
        Ok(Box::new(NullEngine {
            io,
            hello_tx: 0,
            hello_rx: 0,
            hello_buf: [0u8; 4],
        }))
    }
}

struct NullEngine {
    io: Arc<BufIo>,
    hello_tx: usize,
    hello_rx: usize,
    hello_buf: [u8; 4],
}

impl EngineConn for NullEngine {
    fn handshake(&mut self) -> Result<(), EngineError> {
        while self.hello_tx < HELLO.len() {
            match self.io.write(&HELLO[self.hello_tx..]) {
                Ok(n) => self.hello_tx += n,
                Err(EngineError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        while self.hello_rx < HELLO.len() {
            let mut buf = [0u8; 4];
            match self.io.read(&mut buf[..HELLO.len() - self.hello_rx]) {
                Ok(n) => {
                    self.hello_buf[self.hello_rx..self.hello_rx + n].copy_from_slice(&buf[..n]);
                    self.hello_rx += n;
                }
                Err(EngineError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        if self.hello_tx < HELLO.len() || self.hello_rx < HELLO.len() {
            return Err(EngineError::WouldBlock);
        }
        if self.hello_buf != HELLO {
            return Err(EngineError::Failed(SpError::ProtocolError));
        }
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError> {
        self.io.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.io.read(buf)
    }

    fn close(&mut self) {}

    fn verified(&self) -> bool {
        false
    }

    fn peer_cn(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Couple two engines back to back by moving ciphertext between their BufIo
    ///  pairs, like the stream wrapper does over a real transport.
    fn pump(a: &Arc<BufIo>, b: &Arc<BufIo>) {
        while let Some(chunk) = a.drain_tx() {
            b.fill_rx(&chunk);
        }
        while let Some(chunk) = b.drain_tx() {
            a.fill_rx(&chunk);
        }
    }

    #[test]
    fn test_handshake_completes_both_sides() {
        let cfg_c = TlsConfig::new(Mode::Client);
        let cfg_s = TlsConfig::new(Mode::Server);
        let io_c = BufIo::new();
        let io_s = BufIo::new();
        let mut client = NullFactory.open(&cfg_c, Mode::Client, io_c.clone()).unwrap();
        let mut server = NullFactory.open(&cfg_s, Mode::Server, io_s.clone()).unwrap();

        assert_eq!(client.handshake(), Err(EngineError::WouldBlock));
        assert_eq!(server.handshake(), Err(EngineError::WouldBlock));
        pump(&io_c, &io_s);
        assert_eq!(client.handshake(), Ok(()));
        assert_eq!(server.handshake(), Ok(()));
    }

    #[test]
    fn test_data_passthrough() {
        let cfg = TlsConfig::new(Mode::Client);
        let io_c = BufIo::new();
        let io_s = BufIo::new();
        let mut client = NullFactory.open(&cfg, Mode::Client, io_c.clone()).unwrap();
        let mut server = NullFactory.open(&cfg, Mode::Server, io_s.clone()).unwrap();
        let _ = client.handshake();
        let _ = server.handshake();
        pump(&io_c, &io_s);
        let _ = client.handshake();
        let _ = server.handshake();

        assert_eq!(client.send(b"hello").unwrap(), 5);
        pump(&io_c, &io_s);
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_bad_hello_is_protocol_error() {
        let cfg = TlsConfig::new(Mode::Client);
        let io = BufIo::new();
        let mut eng = NullFactory.open(&cfg, Mode::Client, io.clone()).unwrap();
        let _ = eng.handshake(); // sends our hello
        io.drain_tx();
        io.fill_rx(b"JUNK");
        assert_eq!(eng.handshake(), Err(EngineError::Failed(SpError::ProtocolError)));
    }
}
