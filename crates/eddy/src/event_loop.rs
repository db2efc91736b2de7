use std::{
    io,
    os::fd::RawFd,
    sync::{Arc, Mutex, Weak},
    thread::{self, ThreadId},
};

use eddy_utils::safe_panic;
use tracing::debug;

use crate::{channel::Channel, poller::Poller, socket::is_transient, timer::TimerWheel};

type Task = Box<dyn FnOnce() + Send>;

/// Event-counter fd used to break a blocked `poll` when work is queued
/// from another thread.
struct EventFd {
    fd: RawFd,
}

impl EventFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(Self { fd }) }
    }

    fn signal(&self) {
        let val: u64 = 1;
        let n =
            unsafe { libc::write(self.fd, std::ptr::from_ref(&val).cast::<libc::c_void>(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if !is_transient(&err) {
                safe_panic!("eventfd write failed: {err}");
            }
        }
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(self.fd, std::ptr::from_mut(&mut val).cast::<libc::c_void>(), 8)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if !is_transient(&err) {
                safe_panic!("eventfd read failed: {err}");
            }
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// One reactor, pinned to the thread that created it.
///
/// `start` alternates readiness polling, channel dispatch and draining
/// the pending-task queue. The task queue plus the eventfd wakeup are
/// the only cross-thread surface; the poller, the timer wheel and every
/// channel hanging off this loop are touched only from the loop thread.
pub struct EventLoop {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    wakeup: EventFd,
    wakeup_channel: Arc<Channel>,
    wheel: Mutex<TimerWheel>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    ///
    /// # Panics
    /// Panics when the poller, eventfd or timerfd cannot be created;
    /// these are environment failures with no recovery.
    pub fn new() -> Arc<Self> {
        let poller = Poller::new().expect("couldn't create the loop's poller");
        let wakeup = EventFd::new().expect("couldn't create the loop's wakeup eventfd");
        let wakeup_fd = wakeup.fd;

        let lp = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            wakeup_channel: Channel::new(weak.clone(), wakeup_fd),
            wakeup,
            wheel: Mutex::new(TimerWheel::new(weak.clone())),
        });

        let weak = Arc::downgrade(&lp);
        lp.wakeup_channel.set_read_callback(move || {
            if let Some(lp) = weak.upgrade() {
                lp.wakeup.drain();
            }
        });
        lp.wakeup_channel.enable_read();
        lp.wheel.lock().unwrap().arm(&lp);

        debug!(thread = ?lp.thread_id, "event loop ready");
        lp
    }

    #[inline]
    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop(&self) {
        assert!(self.is_in_loop(), "called off the owning loop thread");
    }

    /// Runs `f` inline when called from the loop thread, otherwise
    /// queues it for the loop to pick up.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` for the loop thread and wakes a blocked poll.
    /// Tasks from one producer run in FIFO order, after the current
    /// batch of I/O dispatch.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(f));
        self.wakeup.signal();
    }

    /// Blocks the calling thread forever: poll, dispatch, drain tasks.
    ///
    /// # Panics
    /// Panics when called from any thread but the one that created the
    /// loop.
    pub fn start(self: &Arc<Self>) -> ! {
        self.assert_in_loop();
        let mut active = Vec::new();
        loop {
            self.poller.lock().unwrap().poll(&mut active);
            for channel in active.drain(..) {
                channel.handle_event();
            }
            self.run_pending();
        }
    }

    fn run_pending(&self) {
        // Swap under the lock, run outside it: tasks are free to queue
        // more work.
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().unwrap().update(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().unwrap().remove(channel);
    }

    /// Schedules `task` on this loop's timer wheel, `delay_secs` ticks
    /// out. All wheel mutations hop through the loop so wheel state
    /// stays single-threaded.
    pub fn timer_add(self: &Arc<Self>, id: u64, delay_secs: u32, task: impl FnOnce() + Send + 'static) {
        let lp = self.clone();
        self.run_in_loop(move || lp.wheel.lock().unwrap().add(id, delay_secs, Box::new(task)));
    }

    pub fn timer_refresh(self: &Arc<Self>, id: u64) {
        let lp = self.clone();
        self.run_in_loop(move || lp.wheel.lock().unwrap().refresh(id));
    }

    pub fn timer_cancel(self: &Arc<Self>, id: u64) {
        let lp = self.clone();
        self.run_in_loop(move || lp.wheel.lock().unwrap().cancel(id));
    }

    pub fn has_timer(&self, id: u64) -> bool {
        self.wheel.lock().unwrap().contains(id)
    }

    pub(crate) fn on_timer_tick(&self) {
        self.wheel.lock().unwrap().on_tick();
    }
}
