use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use crate::aio::Aio;
use crate::error::SpError;
use crate::platform::platform;

// The queue discipline shared by every socket-backed stream provider:
//
// * aios append to a FIFO under the direction's lock; the head stays on the queue
//   while the pump task services it, and is popped only at completion;
// * cancelling a queued aio removes it and finishes it directly; cancelling the
//   head stores the error and pokes the pump, which finishes it;
// * close drains both queues with Closed under their locks, so no submission can
//   slip between the flag and the drain.
//
// Cancellation therefore always walks the queue the aio actually sits in.

struct DirState {
    queue: Mutex<VecDeque<Arc<Aio>>>,
    wake: Notify,
    abort: Notify,
    // error installed for the queue head by its cancel function
    head_abort: Mutex<Option<SpError>>,
}

impl DirState {
    fn new() -> DirState {
        DirState {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            abort: Notify::new(),
            head_abort: Mutex::new(None),
        }
    }
}

/// Byte pump over any split duplex socket. Owns the two I/O tasks and the pending
///  operation queues; concrete providers (TCP, IPC) wrap this and add their own
///  properties.
pub(crate) struct ConnIo {
    closed: AtomicBool,
    send: DirState,
    recv: DirState,
    live: Mutex<u32>,
    live_cv: Condvar,
}

impl ConnIo {
    pub(crate) fn spawn<R, W>(rd: R, wr: W) -> Arc<ConnIo>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let io = Arc::new(ConnIo {
            closed: AtomicBool::new(false),
            send: DirState::new(),
            recv: DirState::new(),
            live: Mutex::new(2),
            live_cv: Condvar::new(),
        });

        let handle = platform().handle();
        let s = io.clone();
        handle.spawn(async move {
            s.send_pump(wr).await;
            s.pump_done();
        });
        let r = io.clone();
        handle.spawn(async move {
            r.recv_pump(rd).await;
            r.pump_done();
        });
        io
    }

    pub(crate) fn send(self: &Arc<Self>, aio: &Arc<Aio>) {
        aio.reset();
        let io = self.clone();
        if !aio.start(Some(Box::new(move |aio, rv| io.cancel(true, aio, rv)))) {
            return;
        }
        self.submit(&self.send, aio);
    }

    pub(crate) fn recv(self: &Arc<Self>, aio: &Arc<Aio>) {
        aio.reset();
        let io = self.clone();
        if !aio.start(Some(Box::new(move |aio, rv| io.cancel(false, aio, rv)))) {
            return;
        }
        self.submit(&self.recv, aio);
    }

    fn submit(&self, dir: &DirState, aio: &Arc<Aio>) {
        let mut q = dir.queue.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            drop(q);
            aio.finish_error(SpError::Closed);
            return;
        }
        q.push_back(aio.clone());
        drop(q);
        dir.wake.notify_one();
    }

    fn cancel(&self, is_send: bool, aio: &Arc<Aio>, rv: SpError) {
        let dir = if is_send { &self.send } else { &self.recv };
        let mut q = dir.queue.lock().unwrap();
        let Some(pos) = q.iter().position(|a| Arc::ptr_eq(a, aio)) else {
            return; // already completed
        };
        if pos == 0 {
            // in flight: the pump finishes it
            *dir.head_abort.lock().unwrap() = Some(rv);
            drop(q);
            dir.abort.notify_one();
            return;
        }
        q.remove(pos);
        drop(q);
        aio.finish_error(rv);
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The pumps observe the flag, fail their in-flight head and drain the
        // rest of their queues; anything submitted after the flag is refused in
        // submit. Draining here would race the in-flight head.
        self.send.abort.notify_one();
        self.recv.abort.notify_one();
        self.send.wake.notify_one();
        self.recv.wake.notify_one();
    }

    /// Close and block until both pump tasks have exited. Teardown path only.
    pub(crate) fn stop(&self) {
        self.close();
        let mut live = self.live.lock().unwrap();
        while *live > 0 {
            live = self.live_cv.wait(live).unwrap();
        }
    }

    fn drain(&self, dir: &DirState) {
        loop {
            let aio = dir.queue.lock().unwrap().pop_front();
            match aio {
                Some(aio) => aio.finish_error(SpError::Closed),
                None => return,
            }
        }
    }

    fn pump_done(&self) {
        let mut live = self.live.lock().unwrap();
        *live -= 1;
        self.live_cv.notify_all();
    }

    /// Next head for a pump, or None when the connection closed.
    async fn next_head(&self, dir: &DirState) -> Option<Arc<Aio>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                self.drain(dir);
                return None;
            }
            if let Some(aio) = dir.queue.lock().unwrap().front().cloned() {
                return Some(aio);
            }
            dir.wake.notified().await;
        }
    }

    /// Pop the head and clear its abort slot; returns the abort error, if any.
    fn pop_head(&self, dir: &DirState) -> Option<SpError> {
        let mut q = dir.queue.lock().unwrap();
        q.pop_front();
        dir.head_abort.lock().unwrap().take()
    }

    async fn send_pump<W>(&self, mut wr: W)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(aio) = self.next_head(&self.send).await {
            let result = loop {
                if self.closed.load(Ordering::Acquire) {
                    break Err(SpError::Closed);
                }
                if let Some(rv) = *self.send.head_abort.lock().unwrap() {
                    break Err(rv);
                }
                let bufs = aio.iov();
                if bufs.is_empty() {
                    break Ok(0);
                }
                let slices: Vec<IoSlice> = bufs.iter().map(|b| IoSlice::new(b)).collect();
                tokio::select! {
                    biased;
                    _ = self.send.abort.notified() => continue,
                    r = wr.write_vectored(&slices) => {
                        break match r {
                            Ok(n) => Ok(n),
                            Err(e) => Err(SpError::from_io(&e)),
                        };
                    }
                }
            };

            let aborted = self.pop_head(&self.send);
            match result {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    aio.finish(Ok(()), n);
                }
                Err(rv) => aio.finish_error(aborted.unwrap_or(rv)),
            }
        }
        let _ = wr.shutdown().await;
    }

    async fn recv_pump<R>(&self, mut rd: R)
    where
        R: AsyncRead + Unpin,
    {
        while let Some(aio) = self.next_head(&self.recv).await {
            let Some(mut recv) = aio.take_recv() else {
                self.pop_head(&self.recv);
                aio.finish_error(SpError::InvalidArgument);
                continue;
            };

            let result = loop {
                if self.closed.load(Ordering::Acquire) {
                    break Err(SpError::Closed);
                }
                if let Some(rv) = *self.recv.head_abort.lock().unwrap() {
                    break Err(rv);
                }
                let remaining = recv.remaining();
                if remaining == 0 {
                    break Ok(0);
                }
                let mut limited = (&mut recv.buf).limit(remaining);
                tokio::select! {
                    biased;
                    _ = self.recv.abort.notified() => continue,
                    r = rd.read_buf(&mut limited) => {
                        break match r {
                            Ok(0) => Err(SpError::ConnShutdown),
                            Ok(n) => Ok(n),
                            Err(e) => Err(SpError::from_io(&e)),
                        };
                    }
                }
            };

            let aborted = self.pop_head(&self.recv);
            aio.set_recv(recv);
            match result {
                Ok(n) => {
                    trace!("read {} bytes", n);
                    aio.finish(Ok(()), n);
                }
                Err(rv) => aio.finish_error(aborted.unwrap_or(rv)),
            }
        }
    }
}

/// Per-operation abort signal for one-shot asynchronous jobs (dial, accept).
pub(crate) struct AbortSig {
    err: Mutex<Option<SpError>>,
    note: Notify,
}

impl AbortSig {
    pub(crate) fn new() -> Arc<AbortSig> {
        Arc::new(AbortSig {
            err: Mutex::new(None),
            note: Notify::new(),
        })
    }

    pub(crate) fn fire(&self, rv: SpError) {
        *self.err.lock().unwrap() = Some(rv);
        self.note.notify_one();
    }

    pub(crate) fn error(&self) -> SpError {
        self.err.lock().unwrap().unwrap_or(SpError::Canceled)
    }

    pub(crate) async fn wait(&self) {
        loop {
            if self.err.lock().unwrap().is_some() {
                return;
            }
            self.note.notified().await;
        }
    }
}
