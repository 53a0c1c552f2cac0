//! The SP (scalability protocols) connection layer: pipes, endpoints, sockets
//! and the wire framing every stream transport shares.
//!
//! ## Shape
//!
//! * A [`socket::Socket`] owns a protocol identity ([`proto::Protocol`]) plus
//!   dialers and listeners.
//! * Endpoints ([`dialer::Dialer`], [`listener::Listener`]) produce transport
//!   byte streams via the scheme registry ([`transport`]), then drive the SP
//!   negotiation before a pipe is considered ready.
//! * A [`pipe::Pipe`] is one negotiated peer connection: the [`conn::SpConn`]
//!   framing over one stream, identity-checked and attached to the socket.
//!   Its teardown runs on the reap thread in a fixed order, so callbacks can
//!   always hold a transient reference safely.
//!
//! ## Wire behavior
//!
//! Every transport (tcp, ipc, tls+tcp, ws/wss) carries the same two phases:
//!  the 8-byte `00 53 50 00 PH PL 00 00` negotiation under a 10 second
//!  deadline, then 8-byte big-endian length-prefixed messages. A peer whose
//!  announced protocol does not match the socket's expectation survives the
//!  framing layer but is rejected at attach time, bumping the socket's reject
//!  counter.

pub mod conn;
pub mod dialer;
pub mod listener;
pub mod pipe;
pub mod proto;
pub mod socket;
pub mod stats;
pub mod transport;

pub use conn::SpConn;
pub use dialer::Dialer;
pub use listener::Listener;
pub use pipe::{Pipe, PipeEvent};
pub use proto::{ids, Protocol, RawProtocol};
pub use socket::Socket;
