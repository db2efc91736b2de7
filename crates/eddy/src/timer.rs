use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use eddy_utils::safe_panic;
use tracing::debug;

use crate::{channel::Channel, event_loop::EventLoop, socket::is_transient};

const WHEEL_CAPACITY: usize = 60;

type TaskFn = Box<dyn FnOnce() + Send>;

/// A scheduled task, shared between wheel buckets.
///
/// The task body runs when the last shared reference drops, unless the
/// task was canceled first. Re-inserting another reference into a later
/// bucket therefore defers expiry.
pub(crate) struct TimerTask {
    id: u64,
    delay_secs: u32,
    canceled: AtomicBool,
    task: Mutex<Option<TaskFn>>,
}

impl TimerTask {
    fn new(id: u64, delay_secs: u32, task: TaskFn) -> Self {
        Self { id, delay_secs, canceled: AtomicBool::new(false), task: Mutex::new(Some(task)) }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if self.canceled.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(slot) = self.task.get_mut()
            && let Some(task) = slot.take()
        {
            debug!(id = self.id, "timer task fired");
            task();
        }
    }
}

/// Hashed single-level wheel: one bucket per second of delay, cleared as
/// the hand passes over it.
///
/// Task bodies run while a bucket is being cleared; they must not
/// re-enter the wheel synchronously (loop work is deferred through
/// `queue_in_loop`).
pub(crate) struct Wheel {
    tick: usize,
    buckets: Vec<Vec<Arc<TimerTask>>>,
    index: HashMap<u64, Weak<TimerTask>>,
}

impl Default for Wheel {
    fn default() -> Self {
        Self::with_capacity(WHEEL_CAPACITY)
    }
}

impl Wheel {
    fn with_capacity(capacity: usize) -> Self {
        Self { tick: 0, buckets: vec![Vec::new(); capacity], index: HashMap::new() }
    }

    /// Schedules `task` to run once, `delay_secs` hand advances from now.
    pub(crate) fn add(&mut self, id: u64, delay_secs: u32, task: TaskFn) {
        let task = Arc::new(TimerTask::new(id, delay_secs, task));
        let pos = (self.tick + delay_secs as usize) % self.buckets.len();
        self.index.insert(id, Arc::downgrade(&task));
        self.buckets[pos].push(task);
    }

    /// Defers expiry of `id` by its original delay from now, by parking
    /// one more shared reference in a later bucket. No-op for unknown or
    /// already-expired ids.
    pub(crate) fn refresh(&mut self, id: u64) {
        let Some(task) = self.index.get(&id).and_then(Weak::upgrade) else {
            return;
        };
        let pos = (self.tick + task.delay_secs as usize) % self.buckets.len();
        self.buckets[pos].push(task);
    }

    /// Marks `id` canceled: its bucket slots stay but the task body will
    /// not run when they clear.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(task) = self.index.get(&id).and_then(Weak::upgrade) {
            task.cancel();
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Moves the hand one bucket forward and clears it, dropping the
    /// shared references parked there. Index entries whose task fully
    /// expired are swept afterwards.
    pub(crate) fn advance(&mut self) {
        self.tick = (self.tick + 1) % self.buckets.len();
        self.buckets[self.tick].clear();
        self.index.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// A `timerfd` armed to expire once per second.
struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    fn new_1s() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one_sec = libc::timespec { tv_sec: 1, tv_nsec: 0 };
        let spec = libc::itimerspec { it_interval: one_sec, it_value: one_sec };
        let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    /// Number of expirations since the last read; 0 when nothing is
    /// pending.
    fn read_expirations(&self) -> u64 {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(self.fd, std::ptr::from_mut(&mut count).cast::<libc::c_void>(), 8)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if !is_transient(&err) {
                safe_panic!("timerfd read failed: {err}");
            }
            return 0;
        }
        count
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The wheel wired into its owning loop: the timerfd's channel reads the
/// elapsed tick count and advances the hand that many times, so a busy
/// loop catches up on missed seconds.
pub(crate) struct TimerWheel {
    wheel: Wheel,
    timerfd: TimerFd,
    channel: Arc<Channel>,
}

impl TimerWheel {
    pub(crate) fn new(lp: Weak<EventLoop>) -> Self {
        let timerfd = TimerFd::new_1s().expect("couldn't create the timer wheel's timerfd");
        debug!(fd = timerfd.fd, "timer wheel timerfd ready");
        let channel = Channel::new(lp, timerfd.fd);
        Self { wheel: Wheel::default(), timerfd, channel }
    }

    /// Starts ticking. Called once the owning loop is fully constructed.
    pub(crate) fn arm(&self, lp: &Arc<EventLoop>) {
        let weak = Arc::downgrade(lp);
        self.channel.set_read_callback(move || {
            if let Some(lp) = weak.upgrade() {
                lp.on_timer_tick();
            }
        });
        self.channel.enable_read();
    }

    pub(crate) fn on_tick(&mut self) {
        let elapsed = self.timerfd.read_expirations();
        for _ in 0..elapsed {
            self.wheel.advance();
        }
    }

    pub(crate) fn add(&mut self, id: u64, delay_secs: u32, task: TaskFn) {
        self.wheel.add(id, delay_secs, task);
    }

    pub(crate) fn refresh(&mut self, id: u64) {
        self.wheel.refresh(id);
    }

    pub(crate) fn cancel(&mut self, id: u64) {
        self.wheel.cancel(id);
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.wheel.contains(id)
    }
}
