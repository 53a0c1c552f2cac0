//! Scalability-protocols messaging: protocol-aware sockets over byte-stream
//! transports.
//!
//! An application opens a [`Socket`] for an SP protocol identity, attaches
//!  dialers (outgoing connectors) and listeners (acceptors), and exchanges
//!  framed [`Message`]s with remote peers through [`Pipe`]s - one pipe per peer
//!  connection. Everything asynchronous bottoms out on the one-shot [`Aio`]
//!  operation record.
//!
//! The workspace layering, bottom up:
//! * [`spcore`] - aio, expiration, completion workers, message buffer, byte
//!   stream traits, TCP and IPC providers, URLs;
//! * [`tls`] - the TLS stream wrapper and its pluggable engine contract;
//! * [`websocket`] - RFC 6455 framing and the HTTP upgrade as a transport;
//! * [`sp`] - pipes, endpoints, sockets and the SP wire framing.
//!
//! ```no_run
//! use sprocket::{Aio, Message, RawProtocol, Socket};
//!
//! let server = Socket::new(Box::new(RawProtocol::pair()));
//! server.listen("tcp://127.0.0.1:7780")?;
//!
//! let client = Socket::new(Box::new(RawProtocol::pair()));
//! let dialer = client.dial("tcp://127.0.0.1:7780")?;
//! dialer.wait_connected()?;
//!
//! let pipe = client.pipes().remove(0);
//! let aio = Aio::new_sync();
//! aio.set_msg(Message::from_body(b"hello"));
//! pipe.send(&aio);
//! aio.wait();
//! # Ok::<(), sprocket::SpError>(())
//! ```

pub use sp::{ids, Dialer, Listener, Pipe, PipeEvent, Protocol, RawProtocol, SpConn, Socket};
pub use spcore::{
    Aio, Message, PropertyValue, RecvBuf, Scheme, SpError, SpResult, SpUrl, Stream, StreamDialer,
    StreamListener,
};

pub use sp;
pub use spcore;
pub use tls;
pub use websocket;
