use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Deferred destruction. Objects that may outlive their nominal owner (pipes, TLS
///  configurations) are torn down here, on a dedicated thread, outside all locks,
///  so completion callbacks can hold a transient reference safely and release it
///  after returning.
pub struct Reaper {
    state: Mutex<ReapState>,
    cv: Condvar,
}

struct ReapState {
    queue: VecDeque<Box<dyn FnOnce() + Send>>,
    running: bool,
}

impl Reaper {
    pub(crate) fn new() -> Arc<Reaper> {
        let reaper = Arc::new(Reaper {
            state: Mutex::new(ReapState {
                queue: VecDeque::new(),
                running: false,
            }),
            cv: Condvar::new(),
        });
        let r = reaper.clone();
        thread::Builder::new()
            .name("sp:reap".into())
            .spawn(move || r.worker())
            .expect("spawning the reap thread cannot fail at startup");
        reaper
    }

    /// Submit a teardown function. It will run on the reap thread, after any
    ///  previously submitted teardown has completed.
    pub fn reap(&self, f: impl FnOnce() + Send + 'static) {
        let mut st = self.state.lock().unwrap();
        st.queue.push_back(Box::new(f));
        self.cv.notify_all();
    }

    /// Block until everything submitted so far has been destroyed. Test support and
    ///  orderly shutdown only; never call from a completion callback.
    pub fn flush(&self) {
        let mut st = self.state.lock().unwrap();
        while st.running || !st.queue.is_empty() {
            st = self.cv.wait(st).unwrap();
        }
    }

    fn worker(&self) {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(f) = st.queue.pop_front() {
                st.running = true;
                drop(st);
                f();
                st = self.state.lock().unwrap();
                st.running = false;
                self.cv.notify_all();
                continue;
            }
            st = self.cv.wait(st).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reap_runs_in_order() {
        let reaper = Reaper::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let s = seen.clone();
            reaper.reap(move || s.lock().unwrap().push(i));
        }
        reaper.flush();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_flush_waits_for_running() {
        let reaper = Reaper::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reaper.reap(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            c.fetch_add(1, Ordering::SeqCst);
        });
        reaper.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
