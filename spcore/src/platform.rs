use std::sync::{Arc, OnceLock};
use std::thread;

use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::aio::ExpireQ;
use crate::reap::Reaper;
use crate::taskq::TaskQ;

/// Process-wide plumbing, bootstrapped lazily on first use:
///  * a multi-threaded tokio runtime carrying all socket I/O,
///  * the completion-callback worker pool,
///  * the sharded expiration queues,
///  * the reap thread for deferred destruction.
///
/// Callers never block inside the library on I/O; the runtime is an implementation
///  detail of the stream providers and is not exposed.
pub struct Platform {
    runtime: Runtime,
    pub(crate) taskq: Arc<TaskQ>,
    pub(crate) expire_qs: Vec<Arc<ExpireQ>>,
    reaper: Arc<Reaper>,
}

static PLATFORM: OnceLock<Platform> = OnceLock::new();

pub fn platform() -> &'static Platform {
    PLATFORM.get_or_init(|| {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let num_task = cores.max(2);
        let num_expire = cores.max(1);
        debug!(
            "initializing platform: {} task workers, {} expire shards",
            num_task, num_expire
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_io()
            .enable_time()
            .thread_name("sp:io")
            .build()
            .expect("building the I/O runtime cannot fail at startup");

        Platform {
            runtime,
            taskq: TaskQ::new(num_task),
            expire_qs: (0..num_expire).map(ExpireQ::new).collect(),
            reaper: Reaper::new(),
        }
    })
}

impl Platform {
    /// Handle onto the I/O runtime; stream providers spawn their pump tasks here.
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }
}
