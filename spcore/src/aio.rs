use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;

use crate::error::{SpError, SpResult};
use crate::message::Message;
use crate::platform::platform;
use crate::taskq::Task;

// Design notes.
//
// An Aio is only ever completed by the provider, which must call one of the finish
// variants exactly once per successful start. Until that happens the provider
// guarantees the operation is live. The cancel function installed by start is
// read-and-cleared under the state lock and invoked outside it; whoever takes it
// first (abort, close, stop, or the expiration thread) wins, and the loser finds
// nothing left to do. This is the only thing that keeps cancellation single-shot,
// so every path below preserves it.
//
// Expiration uses an array of sharded queues, each with its own lock, condition
// variable and scan thread. An aio is bound to one shard for its whole life, chosen
// pseudo-randomly at creation to spread lock pressure.
//
// To tear an aio down, call stop: it prevents further starts (they fail with
// Stopped), waits out a concurrent expiration scan, and then drains the callback
// task.

/// Batch of expired operations removed from a queue per scan pass.
const EXPIRE_BATCH: usize = 8;

/// Provider-installed cancellation. Invoked at most once, outside the state lock,
///  with the error the operation should finish with. The function must remove the
///  aio from any provider queue and arrange for it to finish with that error.
pub type CancelFn = Box<dyn FnOnce(&Arc<Aio>, SpError) + Send>;

/// Receive destination: an owned buffer being filled towards `want` total bytes.
/// Providers read at most `want - buf.len()` bytes per operation.
pub struct RecvBuf {
    pub buf: BytesMut,
    pub want: usize,
}

impl RecvBuf {
    pub fn with_want(want: usize) -> RecvBuf {
        RecvBuf {
            buf: BytesMut::with_capacity(want),
            want,
        }
    }

    pub fn remaining(&self) -> usize {
        self.want.saturating_sub(self.buf.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }
}

struct AioState {
    result: SpResult<()>,
    count: usize,

    timeout: Option<Duration>,
    expire: Option<Instant>,
    use_expire: bool,
    expire_ok: bool,
    sleep: bool,

    stop: bool,
    abort: Option<SpError>,
    expiring: bool,
    in_expire_q: bool,

    cancel: Option<CancelFn>,

    msg: Option<Message>,
    iov: Vec<Bytes>,
    recv: Option<RecvBuf>,
    inputs: [Option<Box<dyn Any + Send>>; 4],
    outputs: [Option<Box<dyn Any + Send>>; 4],
}

impl AioState {
    fn new() -> AioState {
        AioState {
            result: Ok(()),
            count: 0,
            timeout: None,
            expire: None,
            use_expire: false,
            expire_ok: false,
            sleep: false,
            stop: false,
            abort: None,
            expiring: false,
            in_expire_q: false,
            cancel: None,
            msg: None,
            iov: Vec::new(),
            recv: None,
            inputs: [None, None, None, None],
            outputs: [None, None, None, None],
        }
    }
}

/// One-shot asynchronous operation record: result, transferred count, deadline,
///  buffers, opaque input/output slots, an installed cancel function and a
///  completion callback dispatched on the worker pool.
pub struct Aio {
    task: Arc<Task>,
    eq: Arc<ExpireQ>,
    state: Mutex<AioState>,
    cv: Condvar,
}

impl Aio {
    /// Create an aio whose completion callback is `cb`. The callback typically
    ///  captures a weak reference to its owner and reads the aio's result there.
    pub fn new(cb: impl Fn() + Send + Sync + 'static) -> Arc<Aio> {
        let p = platform();
        let shard = rand::rng().random_range(0..p.expire_qs.len());
        Arc::new(Aio {
            task: Task::new(p.taskq.clone(), Box::new(cb)),
            eq: p.expire_qs[shard].clone(),
            state: Mutex::new(AioState::new()),
            cv: Condvar::new(),
        })
    }

    /// An aio with no callback, for synchronous-style use with [`Aio::wait`].
    pub fn new_sync() -> Arc<Aio> {
        Aio::new(|| {})
    }

    /// Clear result, count and outputs before a new use.
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.result = Ok(());
        st.count = 0;
        st.abort = None;
        st.expire_ok = false;
        st.sleep = false;
        for slot in st.outputs.iter_mut() {
            *slot = None;
        }
    }

    /// Engage a provider. Installs `cancel` and, when a finite deadline applies,
    ///  schedules expiration. Returns false - with the callback already dispatched
    ///  carrying the stopped / aborted / timed-out result - when the operation must
    ///  not proceed; the provider then simply discards the request.
    ///
    /// With no cancel function the operation cannot be aborted or expired; it runs
    ///  to its natural conclusion (used for operations that complete immediately).
    #[must_use]
    pub fn start(self: &Arc<Self>, cancel: Option<CancelFn>) -> bool {
        let mut timed_out = false;

        self.task.prep();

        let mut st = self.state.lock().unwrap();
        if !st.sleep && !st.use_expire {
            st.expire = match st.timeout {
                None => None,
                Some(d) if d.is_zero() => {
                    timed_out = true;
                    None
                }
                Some(d) => Some(Instant::now() + d),
            };
        } else if st.use_expire && st.expire.map(|e| e <= Instant::now()).unwrap_or(false) {
            timed_out = true;
        }
        if !st.sleep {
            st.expire_ok = false;
        }
        st.result = Ok(());

        if st.stop || self.eq.is_stopping() {
            st.stop = true;
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            st.result = Err(SpError::Stopped);
            drop(st);
            self.task.dispatch();
            return false;
        }
        if let Some(rv) = st.abort.take() {
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            st.result = Err(rv);
            drop(st);
            self.task.dispatch();
            return false;
        }
        if timed_out {
            st.result = if st.expire_ok { Ok(()) } else { Err(SpError::TimedOut) };
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            drop(st);
            self.task.dispatch();
            return false;
        }

        debug_assert!(st.cancel.is_none(), "aio started while already engaged");
        // Expiration is only scheduled when there is a way to actively cancel.
        let cancelable = cancel.is_some();
        st.cancel = cancel;
        if let (Some(deadline), true) = (st.expire, cancelable) {
            st.in_expire_q = true;
            self.eq.add(self.clone(), deadline);
        }
        true
    }

    /// Consumer-side cancellation: the pending operation finishes with `rv`.
    /// If no provider is engaged yet, the next start fails with `rv` instead.
    pub fn abort(self: &Arc<Self>, rv: SpError) {
        let cancel;
        {
            let mut st = self.state.lock().unwrap();
            self.expire_rm(&mut st);
            cancel = st.cancel.take();
            if cancel.is_none() {
                st.abort = Some(rv);
                st.result = Err(rv);
            }
        }
        if let Some(f) = cancel {
            f(self, rv);
        }
    }

    /// Like abort with Stopped, without waiting for the callback to drain.
    pub fn close(self: &Arc<Self>) {
        let cancel;
        {
            let mut st = self.state.lock().unwrap();
            self.expire_rm(&mut st);
            cancel = st.cancel.take();
            st.stop = true;
        }
        if let Some(f) = cancel {
            f(self, SpError::Stopped);
        }
    }

    /// Close, then wait for any outstanding callback to return. After this,
    ///  further starts fail with Stopped.
    pub fn stop(self: &Arc<Self>) {
        let cancel;
        {
            let mut st = self.state.lock().unwrap();
            st.stop = true;
            while st.expiring {
                st = self.cv.wait(st).unwrap();
            }
            self.expire_rm(&mut st);
            cancel = st.cancel.take();
        }
        if let Some(f) = cancel {
            f(self, SpError::Stopped);
        }
        self.wait();
    }

    /// Block until the outstanding callback (if any) has completed.
    pub fn wait(&self) {
        self.task.wait();
    }

    pub fn busy(&self) -> bool {
        self.task.busy()
    }

    // Provider-side completion.

    fn finish_impl(&self, result: SpResult<()>, count: usize, msg: Option<Message>, sync: bool) {
        {
            let mut st = self.state.lock().unwrap();
            self.expire_rm(&mut st);
            st.result = result;
            st.count = count;
            st.cancel = None;
            if msg.is_some() {
                st.msg = msg;
            }
            st.expire = None;
            st.sleep = false;
            st.use_expire = false;
        }
        if sync {
            self.task.exec();
        } else {
            self.task.dispatch();
        }
    }

    pub fn finish(&self, result: SpResult<()>, count: usize) {
        self.finish_impl(result, count, None, false);
    }

    /// Completion with the callback run inline on the calling thread.
    pub fn finish_sync(&self, result: SpResult<()>, count: usize) {
        self.finish_impl(result, count, None, true);
    }

    pub fn finish_error(&self, rv: SpError) {
        self.finish_impl(Err(rv), 0, None, false);
    }

    pub fn finish_msg(&self, msg: Message) {
        let n = msg.len();
        self.finish_impl(Ok(()), n, Some(msg), false);
    }

    /// Like [`Aio::finish_msg`] with the callback run inline.
    pub fn finish_msg_sync(&self, msg: Message) {
        let n = msg.len();
        self.finish_impl(Ok(()), n, Some(msg), true);
    }

    /// Sleep: complete with success after `dur`, or earlier with TimedOut if the
    ///  aio's own timeout is shorter. `None` sleeps until aborted.
    pub fn sleep(self: &Arc<Self>, dur: Option<Duration>) {
        self.reset();
        {
            let mut st = self.state.lock().unwrap();
            st.expire_ok = true;
            st.sleep = true;
            let mut effective = dur;
            if let Some(t) = st.timeout {
                if dur.map(|d| d > t).unwrap_or(true) {
                    st.expire_ok = false;
                    effective = Some(t);
                }
            }
            st.expire = effective.map(|d| Instant::now() + d);
        }
        let _ = self.start(Some(Box::new(|aio: &Arc<Aio>, rv| {
            {
                let mut st = aio.state.lock().unwrap();
                if !st.sleep {
                    return;
                }
                st.sleep = false;
                aio.expire_rm(&mut st);
            }
            aio.finish_error(rv);
        })));
    }

    // Attribute accessors.

    pub fn result(&self) -> SpResult<()> {
        self.state.lock().unwrap().result
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let mut st = self.state.lock().unwrap();
        st.timeout = timeout;
        st.use_expire = false;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().timeout
    }

    /// Absolute deadline, overriding the relative timeout for the next start.
    pub fn set_expire(&self, deadline: Instant) {
        let mut st = self.state.lock().unwrap();
        st.expire = Some(deadline);
        st.use_expire = true;
    }

    pub fn set_msg(&self, msg: Message) {
        self.state.lock().unwrap().msg = Some(msg);
    }

    pub fn take_msg(&self) -> Option<Message> {
        self.state.lock().unwrap().msg.take()
    }

    /// Install the gather list for a send. At most 8 chunks.
    pub fn set_iov(&self, iov: Vec<Bytes>) -> SpResult<()> {
        if iov.len() > 8 {
            return Err(SpError::InvalidArgument);
        }
        self.state.lock().unwrap().iov = iov;
        Ok(())
    }

    /// Snapshot of the unconsumed gather list (cheap: Bytes clones).
    pub fn iov(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().iov.clone()
    }

    /// Total bytes remaining in the gather list.
    pub fn iov_count(&self) -> usize {
        self.state.lock().unwrap().iov.iter().map(Bytes::len).sum()
    }

    /// Drop `n` transferred bytes from the front of the gather list.
    pub fn iov_advance(&self, mut n: usize) {
        let mut st = self.state.lock().unwrap();
        while n > 0 {
            let Some(first) = st.iov.first_mut() else {
                return;
            };
            if first.len() > n {
                first.advance(n);
                return;
            }
            n -= first.len();
            st.iov.remove(0);
        }
    }

    pub fn set_recv(&self, recv: RecvBuf) {
        self.state.lock().unwrap().recv = Some(recv);
    }

    pub fn take_recv(&self) -> Option<RecvBuf> {
        self.state.lock().unwrap().recv.take()
    }

    pub fn set_input(&self, index: usize, value: Box<dyn Any + Send>) {
        let mut st = self.state.lock().unwrap();
        if index < st.inputs.len() {
            st.inputs[index] = Some(value);
        }
    }

    pub fn take_input(&self, index: usize) -> Option<Box<dyn Any + Send>> {
        let mut st = self.state.lock().unwrap();
        st.inputs.get_mut(index).and_then(Option::take)
    }

    pub fn set_output(&self, index: usize, value: Box<dyn Any + Send>) {
        let mut st = self.state.lock().unwrap();
        if index < st.outputs.len() {
            st.outputs[index] = Some(value);
        }
    }

    pub fn take_output(&self, index: usize) -> Option<Box<dyn Any + Send>> {
        let mut st = self.state.lock().unwrap();
        st.outputs.get_mut(index).and_then(Option::take)
    }

    fn expire_rm(&self, st: &mut MutexGuard<'_, AioState>) {
        if st.in_expire_q {
            st.in_expire_q = false;
            self.eq.remove(self as *const Aio);
        }
    }
}

/// A batch of completions gathered under a provider lock and fired after it is
///  released, preserving the callbacks-outside-locks rule when several aios
///  finish from one event.
#[derive(Default)]
pub struct Completions {
    batch: Vec<(Arc<Aio>, SpResult<()>, usize)>,
}

impl Completions {
    pub fn new() -> Completions {
        Completions::default()
    }

    pub fn add(&mut self, aio: Arc<Aio>, result: SpResult<()>, count: usize) {
        self.batch.push((aio, result, count));
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Finish everything collected, callbacks inline, in insertion order.
    pub fn run(self) {
        for (aio, result, count) in self.batch {
            aio.finish_sync(result, count);
        }
    }
}

struct Entry {
    aio: Arc<Aio>,
    deadline: Instant,
}

struct EqState {
    entries: Vec<Entry>,
    stopping: bool,
}

/// One expiration shard: a list of scheduled aios scanned by a dedicated thread
///  that sleeps until the earliest deadline or until signalled.
pub(crate) struct ExpireQ {
    state: Mutex<EqState>,
    cv: Condvar,
}

impl ExpireQ {
    pub(crate) fn new(index: usize) -> Arc<ExpireQ> {
        let eq = Arc::new(ExpireQ {
            state: Mutex::new(EqState {
                entries: Vec::new(),
                stopping: false,
            }),
            cv: Condvar::new(),
        });
        let q = eq.clone();
        thread::Builder::new()
            .name(format!("sp:expire:{}", index))
            .spawn(move || q.worker())
            .expect("spawning an expire thread cannot fail at startup");
        eq
    }

    fn is_stopping(&self) -> bool {
        self.state.lock().unwrap().stopping
    }

    fn add(&self, aio: Arc<Aio>, deadline: Instant) {
        let mut st = self.state.lock().unwrap();
        let wake = st
            .entries
            .iter()
            .map(|e| e.deadline)
            .min()
            .map(|m| deadline < m)
            .unwrap_or(true);
        st.entries.push(Entry { aio, deadline });
        if wake {
            self.cv.notify_all();
        }
    }

    fn remove(&self, aio: *const Aio) {
        let mut st = self.state.lock().unwrap();
        st.entries.retain(|e| Arc::as_ptr(&e.aio) != aio);
    }

    /// Cancel everything scheduled here with Stopped; further starts on aios bound
    ///  to this shard fail with Stopped.
    #[cfg(test)]
    pub(crate) fn drain_stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stopping = true;
        self.cv.notify_all();
        while !st.entries.is_empty() {
            st = self.cv.wait(st).unwrap();
        }
    }

    fn worker(self: Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        loop {
            let now = Instant::now();
            let stopping = st.stopping;

            let mut due = Vec::new();
            let mut i = 0;
            while i < st.entries.len() && due.len() < EXPIRE_BATCH {
                if stopping || st.entries[i].deadline <= now {
                    due.push(st.entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            if due.is_empty() {
                let next = st.entries.iter().map(|e| e.deadline).min();
                st = match next {
                    Some(deadline) => {
                        let dur = deadline.saturating_duration_since(now);
                        self.cv.wait_timeout(st, dur).unwrap().0
                    }
                    None => self.cv.wait(st).unwrap(),
                };
                continue;
            }

            drop(st);
            for entry in due {
                Self::fire(entry.aio, stopping);
            }
            st = self.state.lock().unwrap();
            if st.stopping {
                self.cv.notify_all();
            }
        }
    }

    fn fire(aio: Arc<Aio>, stopping: bool) {
        let cancel;
        let rv;
        {
            let mut st = aio.state.lock().unwrap();
            st.in_expire_q = false;
            cancel = st.cancel.take();
            if stopping {
                st.stop = true;
                rv = SpError::Stopped;
            } else {
                rv = SpError::TimedOut;
            }

            // A sleep completes right here; there is no provider to cancel.
            if st.sleep {
                st.sleep = false;
                st.result = if st.expire_ok && !stopping {
                    st.expire_ok = false;
                    Ok(())
                } else {
                    Err(rv)
                };
                drop(st);
                aio.task.dispatch();
                return;
            }

            // Without a cancel function the operation cannot be terminated; it has
            // to run to its natural conclusion.
            if cancel.is_none() {
                return;
            }
            st.expiring = true;
        }

        (cancel.unwrap())(&aio, rv);

        aio.state.lock().unwrap().expiring = false;
        aio.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_aio() -> (Arc<Aio>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (aio, hits)
    }

    fn finishing_cancel() -> Option<CancelFn> {
        Some(Box::new(|aio, rv| aio.finish_error(rv)))
    }

    #[test]
    fn test_finish_invokes_callback_once() {
        let (aio, hits) = counting_aio();
        assert!(aio.start(finishing_cancel()));
        aio.finish(Ok(()), 42);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Ok(()));
        assert_eq!(aio.count(), 42);
    }

    #[test]
    fn test_timeout_fires_within_bounds() {
        let (aio, hits) = counting_aio();
        aio.set_timeout(Some(Duration::from_millis(100)));
        let begin = Instant::now();
        assert!(aio.start(finishing_cancel()));
        aio.wait();
        let elapsed = begin.elapsed();
        assert_eq!(aio.result(), Err(SpError::TimedOut));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
    }

    #[test]
    fn test_zero_timeout_fails_immediately() {
        let (aio, hits) = counting_aio();
        aio.set_timeout(Some(Duration::ZERO));
        assert!(!aio.start(finishing_cancel()));
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::TimedOut));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_invokes_cancel() {
        let (aio, hits) = counting_aio();
        assert!(aio.start(finishing_cancel()));
        aio.abort(SpError::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Canceled));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_before_start_poisons_next_start() {
        let (aio, hits) = counting_aio();
        aio.abort(SpError::Canceled);
        assert!(!aio.start(finishing_cancel()));
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Canceled));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_after_stop_fails_stopped() {
        let (aio, hits) = counting_aio();
        assert!(aio.start(finishing_cancel()));
        aio.finish(Ok(()), 0);
        aio.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(!aio.start(finishing_cancel()));
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Stopped));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_waits_for_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move || {
            thread::sleep(Duration::from_millis(20));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(aio.start(finishing_cancel()));
        aio.finish(Ok(()), 0);
        aio.stop();
        // stop must not return before the callback completed
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_completes_with_success() {
        let (aio, _) = counting_aio();
        let begin = Instant::now();
        aio.sleep(Some(Duration::from_millis(50)));
        aio.wait();
        assert_eq!(aio.result(), Ok(()));
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sleep_bounded_by_aio_timeout() {
        let (aio, _) = counting_aio();
        aio.set_timeout(Some(Duration::from_millis(30)));
        aio.sleep(Some(Duration::from_millis(10_000)));
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::TimedOut));
    }

    #[test]
    fn test_sleep_abort() {
        let (aio, _) = counting_aio();
        aio.sleep(Some(Duration::from_secs(60)));
        aio.abort(SpError::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Canceled));
    }

    #[test]
    fn test_iov_advance() {
        let aio = Aio::new_sync();
        aio.set_iov(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")])
            .unwrap();
        assert_eq!(aio.iov_count(), 7);
        aio.iov_advance(4);
        assert_eq!(aio.iov_count(), 3);
        assert_eq!(aio.iov()[0].as_ref(), b"efg");
        aio.iov_advance(3);
        assert_eq!(aio.iov_count(), 0);
    }

    #[test]
    fn test_iov_limit() {
        let aio = Aio::new_sync();
        let too_many = vec![Bytes::from_static(b"x"); 9];
        assert_eq!(aio.set_iov(too_many), Err(SpError::InvalidArgument));
    }

    #[test]
    fn test_reset_clears_outputs() {
        let aio = Aio::new_sync();
        aio.set_output(0, Box::new(7u32));
        aio.reset();
        assert!(aio.take_output(0).is_none());
    }

    #[test]
    fn test_outputs_roundtrip() {
        let aio = Aio::new_sync();
        aio.set_output(1, Box::new(String::from("hello")));
        let out = aio.take_output(1).unwrap();
        assert_eq!(*out.downcast::<String>().unwrap(), "hello");
        assert!(aio.take_output(1).is_none());
    }

    #[test]
    fn test_completions_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut completions = Completions::new();
        for i in 0..4usize {
            let o = order.clone();
            let aio = Aio::new(move || o.lock().unwrap().push(i));
            assert!(aio.start(finishing_cancel()));
            completions.add(aio, Ok(()), i);
        }
        completions.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_queue_stop_cancels_scheduled() {
        let eq = ExpireQ::new(999);
        let (aio, _) = counting_aio();
        // Rebind the aio onto a private queue so the drain does not disturb others.
        let aio = Arc::new(Aio {
            task: aio.task.clone(),
            eq: eq.clone(),
            state: Mutex::new(AioState::new()),
            cv: Condvar::new(),
        });
        aio.set_timeout(Some(Duration::from_secs(3600)));
        assert!(aio.start(finishing_cancel()));
        eq.drain_stop();
        aio.wait();
        assert_eq!(aio.result(), Err(SpError::Stopped));
    }
}
