use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

use tracing::warn;

use crate::{
    channel::Channel,
    event_loop::EventLoop,
    socket::{Socket, is_transient},
};

type AcceptCallback = Arc<dyn Fn(RawFd) + Send + Sync>;

/// Owns the listening socket and the channel watching it for
/// read-readiness on the base loop.
pub struct Acceptor {
    sock: Socket,
    channel: Arc<Channel>,
    accept_cb: Mutex<Option<AcceptCallback>>,
}

impl Acceptor {
    /// # Panics
    /// Panics when the listening socket cannot be set up; there is no
    /// recovery from a dead listener.
    pub fn new(lp: &Arc<EventLoop>, port: u16) -> Arc<Self> {
        let sock = Socket::listener(port)
            .unwrap_or_else(|err| panic!("couldn't set up the listening socket: {err}"));
        let channel = Channel::new(Arc::downgrade(lp), sock.fd());
        let acceptor =
            Arc::new(Self { sock, channel: channel.clone(), accept_cb: Mutex::new(None) });

        let weak = Arc::downgrade(&acceptor);
        channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_accept();
            }
        });
        acceptor
    }

    pub fn set_accept_callback(&self, cb: impl Fn(RawFd) + Send + Sync + 'static) {
        *self.accept_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Arms read interest. Install the accept callback first.
    pub fn listen(&self) {
        self.channel.enable_read();
    }

    /// Edge-triggered drain: accepts until the call would block. A bad
    /// accept ends this drain but never the server.
    fn handle_accept(&self) {
        let cb = self.accept_cb.lock().unwrap().clone();
        loop {
            match self.sock.accept() {
                Ok(fd) => match &cb {
                    Some(cb) => cb(fd),
                    // Nobody to hand the fd to; close it right away.
                    None => drop(Socket::from_fd(fd)),
                },
                Err(err) if is_transient(&err) => break,
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }
}
