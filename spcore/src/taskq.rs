use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A task is the unit of work dispatched to the completion worker pool. Each AIO owns
///  one task wrapping its completion callback.
///
/// The busy counter tracks outstanding executions; `wait` blocks until it drains to
///  zero. `prep` reserves a busy slot before the operation is even submitted, so that
///  a `wait` racing with a provider that has not yet dispatched still blocks.
pub(crate) struct Task {
    cb: Box<dyn Fn() + Send + Sync>,
    state: Mutex<TaskState>,
    cv: Condvar,
    tq: Arc<TaskQ>,
}

#[derive(Default)]
struct TaskState {
    busy: u32,
    prep: bool,
}

impl Task {
    pub(crate) fn new(tq: Arc<TaskQ>, cb: Box<dyn Fn() + Send + Sync>) -> Arc<Task> {
        Arc::new(Task {
            cb,
            state: Mutex::new(TaskState::default()),
            cv: Condvar::new(),
            tq,
        })
    }

    /// Reserve a busy slot ahead of dispatch.
    pub(crate) fn prep(&self) {
        let mut st = self.state.lock().unwrap();
        st.busy += 1;
        st.prep = true;
    }

    /// Queue the callback for execution on a worker thread.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            if st.prep {
                st.prep = false;
            } else {
                st.busy += 1;
            }
        }
        self.tq.submit(self.clone());
    }

    /// Run the callback inline on the calling thread.
    pub(crate) fn exec(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.prep {
                st.prep = false;
            } else {
                st.busy += 1;
            }
        }
        (self.cb)();
        self.done();
    }

    fn done(&self) {
        let mut st = self.state.lock().unwrap();
        st.busy -= 1;
        if st.busy == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until no execution of this task is outstanding.
    pub(crate) fn wait(&self) {
        let mut st = self.state.lock().unwrap();
        while st.busy > 0 {
            st = self.cv.wait(st).unwrap();
        }
    }

    pub(crate) fn busy(&self) -> bool {
        self.state.lock().unwrap().busy > 0
    }
}

/// Fixed pool of worker threads executing completion callbacks in submission order.
pub(crate) struct TaskQ {
    queue: Mutex<VecDeque<Arc<Task>>>,
    cv: Condvar,
}

impl TaskQ {
    pub(crate) fn new(nthreads: usize) -> Arc<TaskQ> {
        let tq = Arc::new(TaskQ {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        });
        for i in 0..nthreads.max(2) {
            let tq = tq.clone();
            thread::Builder::new()
                .name(format!("sp:task:{}", i))
                .spawn(move || tq.worker())
                .expect("spawning a task worker thread cannot fail at startup");
        }
        tq
    }

    fn submit(&self, task: Arc<Task>) {
        let mut q = self.queue.lock().unwrap();
        q.push_back(task);
        self.cv.notify_one();
    }

    fn worker(&self) {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(task) = q.pop_front() {
                drop(q);
                (task.cb)();
                task.done();
                q = self.queue.lock().unwrap();
                continue;
            }
            q = self.cv.wait(q).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_dispatch_runs_callback() {
        let tq = TaskQ::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let task = Task::new(tq, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        task.dispatch();
        task.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_blocks_until_prepped_dispatch() {
        let tq = TaskQ::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let task = Task::new(tq, Box::new(move || {
            thread::sleep(Duration::from_millis(10));
            h.fetch_add(1, Ordering::SeqCst);
        }));

        task.prep();
        assert!(task.busy());

        let t2 = task.clone();
        let waiter = thread::spawn(move || {
            t2.wait();
        });
        task.dispatch();
        waiter.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!task.busy());
    }

    #[test]
    fn test_exec_runs_inline() {
        let tq = TaskQ::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let task = Task::new(tq, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        task.exec();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
