use std::{
    any::Any,
    os::fd::RawFd,
    sync::{Arc, Mutex, Weak},
};

use crate::{event_loop::EventLoop, poller::Ready};

type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Handlers {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
    event: Option<EventCallback>,
}

struct ChannelState {
    interest: Ready,
    revents: Ready,
    registered: bool,
}

/// Per-fd event-interest record: which readiness bits the owning loop
/// watches for this descriptor, and what to call when they fire.
///
/// A channel never owns its fd, and its loop reference is non-owning.
pub struct Channel {
    fd: RawFd,
    lp: Weak<EventLoop>,
    state: Mutex<ChannelState>,
    handlers: Mutex<Handlers>,
    /// Upgraded for the duration of one dispatch so a callback that
    /// releases the tied object cannot free it mid-dispatch. Events for
    /// a dead tie are dropped.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub(crate) fn new(lp: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            lp,
            state: Mutex::new(ChannelState {
                interest: Ready::empty(),
                revents: Ready::empty(),
                registered: false,
            }),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Ready {
        self.state.lock().unwrap().interest
    }

    pub(crate) fn registered(&self) -> bool {
        self.state.lock().unwrap().registered
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.state.lock().unwrap().registered = registered;
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.state.lock().unwrap().revents = revents;
    }

    pub fn set_read_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().read = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().write = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().error = Some(Arc::new(cb));
    }

    pub fn set_event_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().event = Some(Arc::new(cb));
    }

    /// Ties the channel to the object its callbacks act on.
    pub(crate) fn tie<T: Any + Send + Sync>(&self, target: &Arc<T>) {
        let erased: Arc<dyn Any + Send + Sync> = target.clone();
        *self.tie.lock().unwrap() = Some(Arc::downgrade(&erased));
    }

    pub fn reading(&self) -> bool {
        self.interest().contains(Ready::READABLE)
    }

    pub fn writing(&self) -> bool {
        self.interest().contains(Ready::WRITABLE)
    }

    pub fn enable_read(self: &Arc<Self>) {
        self.state.lock().unwrap().interest |= Ready::READABLE;
        self.update();
    }

    pub fn enable_write(self: &Arc<Self>) {
        self.state.lock().unwrap().interest |= Ready::WRITABLE;
        self.update();
    }

    pub fn disable_read(self: &Arc<Self>) {
        self.state.lock().unwrap().interest &= !Ready::READABLE;
        self.update();
    }

    pub fn disable_write(self: &Arc<Self>) {
        self.state.lock().unwrap().interest &= !Ready::WRITABLE;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.lock().unwrap().interest = Ready::empty();
        self.update();
    }

    /// Detaches the channel from the owning loop's poller entirely.
    pub fn remove(self: &Arc<Self>) {
        if let Some(lp) = self.lp.upgrade() {
            lp.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(lp) = self.lp.upgrade() {
            lp.update_channel(self);
        }
    }

    /// Dispatches the last readiness batch to the callback slots.
    ///
    /// Order: read-class bits first, then at most one of write/error/
    /// close (any of which may release the tied object), then the
    /// any-event callback.
    pub(crate) fn handle_event(self: &Arc<Self>) {
        let tied = self.tie.lock().unwrap().clone();
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match tied {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => return,
            },
            None => None,
        };

        let revents = self.state.lock().unwrap().revents;
        let handlers = self.handlers.lock().unwrap().clone();

        if revents.is_read_class()
            && let Some(cb) = &handlers.read
        {
            cb();
        }

        if revents.contains(Ready::WRITABLE) {
            if let Some(cb) = &handlers.write {
                cb();
            }
        } else if revents.contains(Ready::ERROR) {
            if let Some(cb) = &handlers.error {
                cb();
            }
        } else if revents.contains(Ready::HUP) {
            if let Some(cb) = &handlers.close {
                cb();
            }
        }

        if let Some(cb) = &handlers.event {
            cb();
        }
    }
}
