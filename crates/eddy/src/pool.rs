use std::{
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use tracing::{debug, warn};

use crate::event_loop::EventLoop;

/// Scheduling applied to a worker thread before it enters its loop.
///
/// `Latency` asks for `SCHED_FIFO` at the given priority so a parked
/// loop preempts ordinary threads the moment one of its fds wakes.
/// Needs CAP_SYS_NICE; when the kernel refuses, the worker keeps
/// running under the OS default scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub enum LoopPriority {
    #[default]
    OsDefault,
    Latency(i32),
}

/// Pins the calling worker to `core` and applies `priority`, warning
/// and continuing when either is denied. Runs once per worker, before
/// its loop is created.
fn boot_worker(core: Option<usize>, priority: LoopPriority) {
    if let Some(core) = core
        && !core_affinity::set_for_current(core_affinity::CoreId { id: core })
    {
        warn!(core, "couldn't pin loop worker to core");
    }

    #[cfg(target_os = "linux")]
    {
        if let LoopPriority::Latency(prio) = priority {
            let param = libc::sched_param { sched_priority: prio };
            let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
            if code != 0 {
                warn!(code, prio, "couldn't switch loop worker to SCHED_FIFO");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if !matches!(priority, LoopPriority::OsDefault) {
            warn!(?priority, "loop priority is only supported on linux");
        }
    }
}

/// Owns the worker threads, each hosting one private [`EventLoop`], and
/// hands loops out round-robin. With zero workers every caller gets the
/// base loop.
pub struct LoopThreadPool {
    base: Arc<EventLoop>,
    workers: Vec<Arc<EventLoop>>,
    threads: Vec<thread::JoinHandle<()>>,
    next: AtomicUsize,
    thread_count: usize,
    cores: Option<Vec<usize>>,
    priority: LoopPriority,
}

impl LoopThreadPool {
    pub fn new(base: Arc<EventLoop>) -> Self {
        Self {
            base,
            workers: Vec::new(),
            threads: Vec::new(),
            next: AtomicUsize::new(0),
            thread_count: 0,
            cores: None,
            priority: LoopPriority::OsDefault,
        }
    }

    /// Number of worker threads to spawn. Must be set before `start`.
    pub fn set_thread_count(&mut self, thread_count: usize) {
        self.thread_count = thread_count;
    }

    /// Pins worker `i` to `cores[i % cores.len()]` at boot.
    pub fn pin_cores(&mut self, cores: Vec<usize>) {
        self.cores = Some(cores);
    }

    pub fn set_priority(&mut self, priority: LoopPriority) {
        self.priority = priority;
    }

    /// Spawns the workers. Each thread boots its scheduling, creates
    /// its own loop, publishes it back, then parks in `start()`
    /// forever; the pool stores the loops in spawn order.
    pub fn start(&mut self) {
        let (tx, rx) = mpsc::channel();
        for i in 0..self.thread_count {
            let tx = tx.clone();
            let core = self.cores.as_ref().map(|cores| cores[i % cores.len()]);
            let priority = self.priority;
            let handle: thread::JoinHandle<()> = thread::Builder::new()
                .name(format!("loop-worker-{i}"))
                .spawn(move || {
                    boot_worker(core, priority);
                    let lp = EventLoop::new();
                    tx.send(lp.clone()).expect("pool is waiting for the worker loop");
                    lp.start()
                })
                .expect("couldn't spawn loop worker thread");
            self.threads.push(handle);

            let lp = rx.recv().expect("worker died before publishing its loop");
            self.workers.push(lp);
        }
        debug!(workers = self.threads.len(), "loop thread pool started");
    }

    /// Round-robin pick; the base loop when the pool has no workers.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        if self.workers.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].clone()
    }

    pub fn base_loop(&self) -> &Arc<EventLoop> {
        &self.base
    }
}
