//! TLS layered over any byte stream.
//!
//! The cryptography itself is pluggable: an [`engine::EngineFactory`] turns a
//!  [`config::TlsConfig`] into per-connection engines that exchange ciphertext
//!  exclusively through a fixed pair of record buffers ([`engine::BufIo`]). The
//!  [`stream::TlsStream`] wrapper owns those buffers, keeps the lower stream fed,
//!  and multiplexes the handshake with user traffic.
//!
//! Back-pressure is structural: the outbound ring holds one TLS record; when it
//!  is full the engine sees `WouldBlock` and user sends stay queued. The inbound
//!  slab is only refilled while somebody wants data.

pub mod config;
pub mod engine;
pub mod null;
pub mod stream;

pub use config::{AuthMode, CertKey, Mode, Psk, TlsConfig, TlsVersion};
pub use engine::{register_engine, BufIo, EngineConn, EngineError, EngineFactory};
pub use stream::{TlsDialer, TlsListener, TlsStream};

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use spcore::aio::RecvBuf;
    use spcore::stream::take_stream_output;
    use spcore::{Aio, SpError, SpUrl, Stream, StreamDialer, StreamListener};
    use std::sync::Arc;

    fn tls_pair() -> (Box<dyn Stream>, Box<dyn Stream>) {
        let server_cfg = TlsConfig::new(Mode::Server);
        let listener = TlsListener::for_url(
            &SpUrl::parse("tls+tcp://127.0.0.1:0").unwrap(),
            server_cfg,
        )
        .unwrap();
        listener.listen().unwrap();
        let port = match listener.get(spcore::stream::prop::LOCAL_ADDR).unwrap() {
            spcore::PropertyValue::Sockaddr(sa) => sa.port(),
            _ => panic!("listener must report a socket address"),
        };

        let acc = Aio::new_sync();
        listener.accept(&acc);

        let client_cfg = TlsConfig::new(Mode::Client);
        let dialer = TlsDialer::for_url(
            &SpUrl::parse(&format!("tls+tcp://127.0.0.1:{}", port)).unwrap(),
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

    fn send_all(stream: &dyn Stream, mut data: Bytes) {
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
    fn test_data_in_order_across_records() {
        let (client, server) = tls_pair();

        // several chunks, one larger than a record buffer
        let big: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        send_all(client.as_ref(), Bytes::from(big.clone()));
        let got = recv_exact(server.as_ref(), big.len());
        assert_eq!(got, big);

        // and back the other way
        send_all(server.as_ref(), Bytes::from_static(b"pong"));
        assert_eq!(recv_exact(client.as_ref(), 4), b"pong");

        client.stop();
        server.stop();
    }

    #[test]
    fn test_send_after_close_fails() {
        let (client, server) = tls_pair();
        client.close();
        let aio = Aio::new_sync();
        aio.set_iov(vec![Bytes::from_static(b"x")]).unwrap();
        client.send(&aio);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Closed));
        server.stop();
        client.stop();
    }

    #[test]
    fn test_recv_abort() {
        let (client, server) = tls_pair();
        let aio = Aio::new_sync();
        aio.set_recv(RecvBuf::with_want(8));
        server.recv(&aio);
        aio.abort(SpError::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Canceled));
        client.stop();
        server.stop();
    }

    #[test]
    fn test_config_busy_after_bind() {
        let cfg = TlsConfig::new(Mode::Server);
        let listener =
            TlsListener::for_url(&SpUrl::parse("tls+tcp://127.0.0.1:0").unwrap(), cfg.clone())
                .unwrap();
        listener.listen().unwrap();
        assert_eq!(cfg.set_server_name("late"), Err(SpError::Busy));
        listener.close();
    }

    #[test]
    fn test_engine_metadata() {
        let e = engine::engine();
        assert_eq!(e.name(), "null");
        assert!(!e.fips_mode());
        let _ = Arc::strong_count(&e);
    }
}
