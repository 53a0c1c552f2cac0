//! The asynchronous I/O core that everything else in the workspace bottoms out on.
//!
//! ## Design goals
//!
//! * One object - the [`aio::Aio`] - represents one outstanding operation, with
//!   timeout, cancellation, a completion callback and a scheduling-safe lifecycle.
//!   Every higher-level operation (pipe send, TLS handshake, WebSocket upgrade)
//!   is ultimately a chain of these.
//! * The calling thread never blocks on I/O inside the library. Operations either
//!   run fully asynchronously against a caller-provided aio, or the caller uses a
//!   synchronous wrapper that internally issues an aio and waits on it.
//! * Completion callbacks are dispatched on a small worker pool, expirations are
//!   scanned by sharded timer threads, and deferred destruction runs on a reap
//!   thread - three separate pools so none of them can starve another.
//! * Byte-stream transports are polymorphic behind [`stream::Stream`]; TCP and
//!   IPC providers live here, TLS and WebSocket wrap any lower stream in their
//!   own crates.
//!
//! ## Cancellation discipline
//!
//! A provider installs a cancel function when it takes ownership of an aio. That
//!  function is read-and-cleared under the aio's lock and invoked outside it -
//!  exactly once, whether fired by abort, close, stop or the expiration scan.
//!  The cancel function removes the aio from whatever queue it sits in and
//!  finishes it. This is the invariant that keeps completion single-shot; every
//!  provider in the workspace preserves it.

pub mod aio;
pub mod error;
pub mod ipc;
pub mod message;
pub mod platform;
pub mod reap;
pub mod stream;
pub mod tcp;
pub mod url;

mod conn_io;
mod taskq;

pub use aio::{Aio, CancelFn, Completions, RecvBuf};
pub use error::{SpError, SpResult};
pub use message::Message;
pub use stream::{PropertyValue, Stream, StreamDialer, StreamListener};
pub use url::{Scheme, SpUrl};
