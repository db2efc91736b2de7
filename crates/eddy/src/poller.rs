use std::{collections::HashMap, io, os::fd::RawFd, sync::Arc};

use eddy_utils::safe_panic;
use mio::{Events, Interest, Poll, Token, event::Event, unix::SourceFd};
use tracing::warn;

use crate::channel::Channel;

const INITIAL_EVENTS: usize = 1024;

bitflags::bitflags! {
    /// Interest and readiness bits carried by a [`Channel`].
    ///
    /// Only `READABLE` and `WRITABLE` are valid as interest; the rest
    /// arrive from the kernel as readiness.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
        const HUP = 1 << 3;
        const PRIORITY = 1 << 4;
        const READ_CLOSED = 1 << 5;
    }
}

impl Ready {
    pub(crate) fn from_event(ev: &Event) -> Self {
        let mut r = Self::empty();
        if ev.is_readable() {
            r |= Self::READABLE;
        }
        if ev.is_writable() {
            r |= Self::WRITABLE;
        }
        if ev.is_error() {
            r |= Self::ERROR;
        }
        if ev.is_priority() {
            r |= Self::PRIORITY;
        }
        if ev.is_read_closed() {
            r |= Self::READ_CLOSED;
            if ev.is_write_closed() {
                r |= Self::HUP;
            }
        }
        r
    }

    /// Readable, priority, or peer-half-close: everything the read
    /// callback is responsible for.
    #[inline]
    pub fn is_read_class(self) -> bool {
        self.intersects(Self::READABLE | Self::PRIORITY | Self::READ_CLOSED)
    }

    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.contains(Self::READABLE), self.contains(Self::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Edge-triggered readiness multiplexing over raw descriptors.
///
/// Invariant: every fd present in the kernel interest set has an entry
/// in `channels` whose interest bits equal the kernel's.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    capacity: usize,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENTS),
            capacity: INITIAL_EVENTS,
            channels: HashMap::new(),
        })
    }

    /// Reconciles the kernel interest set with the channel's interest
    /// bits, registering, re-registering or detaching as needed.
    pub(crate) fn update(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        match (channel.interest().to_interest(), channel.registered()) {
            (Some(interest), false) => {
                self.channels.insert(fd, channel.clone());
                if let Err(err) =
                    self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)
                {
                    warn!(?err, fd, "epoll register failed");
                    return;
                }
                channel.set_registered(true);
            }
            (Some(interest), true) => {
                if let Err(err) = self
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                {
                    warn!(?err, fd, "epoll reregister failed");
                }
            }
            (None, true) => {
                if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    warn!(?err, fd, "epoll deregister failed");
                }
                channel.set_registered(false);
            }
            // Known but unarmed; keep the map entry so a later enable
            // finds it.
            (None, false) => {
                self.channels.entry(fd).or_insert_with(|| channel.clone());
            }
        }
    }

    /// Detaches the channel from the kernel and forgets it.
    pub(crate) fn remove(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if channel.registered() {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(?err, fd, "epoll deregister failed");
            }
            channel.set_registered(false);
        }
        self.channels.remove(&fd);
    }

    /// Blocks until at least one fd is ready or the wait is interrupted,
    /// then stamps each ready channel's revents and appends it to
    /// `active`.
    pub(crate) fn poll(&mut self, active: &mut Vec<Arc<Channel>>) {
        if let Err(err) = self.poll.poll(&mut self.events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            safe_panic!("epoll wait failed: {err}");
            return;
        }

        let mut filled = 0;
        for ev in self.events.iter() {
            filled += 1;
            let fd = ev.token().0 as RawFd;
            let Some(channel) = self.channels.get(&fd) else {
                safe_panic!("readiness event for unknown fd {fd}");
                continue;
            };
            channel.set_revents(Ready::from_event(ev));
            active.push(channel.clone());
        }

        // One full batch means the kernel may have had more to report.
        if filled == self.capacity {
            self.capacity *= 2;
            self.events = Events::with_capacity(self.capacity);
        }
    }
}
