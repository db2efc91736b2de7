use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex, MutexGuard},
};

use eddy_utils::safe_assert;
use tracing::debug;

use crate::{
    buffer::Buffer,
    channel::Channel,
    context::Context,
    event_loop::EventLoop,
    socket::{Socket, is_transient},
};

pub type ConnectedCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer) + Send + Sync>;
pub type ClosedCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type AnyEventCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Ceiling for one recv call; the read path keeps pulling chunks until
/// the socket would block.
const RECV_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

struct ConnInner {
    status: ConnStatus,
    in_buf: Buffer,
    out_buf: Buffer,
    connected_cb: Option<ConnectedCallback>,
    message_cb: Option<MessageCallback>,
    closed_cb: Option<ClosedCallback>,
    event_cb: Option<AnyEventCallback>,
    server_closed_cb: Option<ClosedCallback>,
    inactive_release: bool,
}

/// One accepted TCP connection: socket, channel, buffers, callbacks and
/// the {Connecting, Connected, Disconnecting, Disconnected} state
/// machine.
///
/// Shared between the server's registry and the owning loop's closures;
/// the last reference to drop destroys it. All state transitions and
/// callback invocations happen on the owning loop's thread; `send`,
/// `shutdown` and the inactive-release toggles may be called from any
/// thread and hop onto the loop.
pub struct Connection {
    id: u64,
    sock: Socket,
    lp: Arc<EventLoop>,
    channel: Arc<Channel>,
    inner: Mutex<ConnInner>,
    context: Mutex<Context>,
}

impl Connection {
    pub fn new(lp: Arc<EventLoop>, id: u64, fd: RawFd) -> Arc<Self> {
        let sock = Socket::from_fd(fd);
        // The fd may come from outside the acceptor; all connection I/O
        // assumes it never blocks.
        sock.set_nonblocking();
        let channel = Channel::new(Arc::downgrade(&lp), fd);
        let conn = Arc::new(Self {
            id,
            sock,
            lp,
            channel: channel.clone(),
            inner: Mutex::new(ConnInner {
                status: ConnStatus::Connecting,
                in_buf: Buffer::default(),
                out_buf: Buffer::default(),
                connected_cb: None,
                message_cb: None,
                closed_cb: None,
                event_cb: None,
                server_closed_cb: None,
                inactive_release: false,
            }),
            context: Mutex::new(Context::default()),
        });

        let weak = Arc::downgrade(&conn);
        channel.set_read_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }
        });
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        channel.set_error_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }
        });
        channel.set_event_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_any_event();
            }
        });
        channel.tie(&conn);
        conn
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().status == ConnStatus::Connected
    }

    pub fn status(&self) -> ConnStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_context(&self, context: Context) {
        *self.context.lock().unwrap() = context;
    }

    /// Mutable access to the opaque per-connection context. Drop the
    /// guard before calling [`upgrade`](Self::upgrade).
    pub fn context(&self) -> MutexGuard<'_, Context> {
        self.context.lock().unwrap()
    }

    pub fn set_connected_callback(&self, cb: impl Fn(&Arc<Self>) + Send + Sync + 'static) {
        self.inner.lock().unwrap().connected_cb = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&Arc<Self>, &mut Buffer) + Send + Sync + 'static) {
        self.inner.lock().unwrap().message_cb = Some(Arc::new(cb));
    }

    pub fn set_closed_callback(&self, cb: impl Fn(&Arc<Self>) + Send + Sync + 'static) {
        self.inner.lock().unwrap().closed_cb = Some(Arc::new(cb));
    }

    pub fn set_any_event_callback(&self, cb: impl Fn(&Arc<Self>) + Send + Sync + 'static) {
        self.inner.lock().unwrap().event_cb = Some(Arc::new(cb));
    }

    /// The server's own closed hook, fired after the user's.
    pub(crate) fn set_server_closed_callback(&self, cb: impl Fn(&Arc<Self>) + Send + Sync + 'static) {
        self.inner.lock().unwrap().server_closed_cb = Some(Arc::new(cb));
    }

    /// Promotes the freshly accepted connection on its owning loop:
    /// Connecting → Connected, read interest on, `connected` fired.
    pub fn established(self: &Arc<Self>) {
        let conn = self.clone();
        self.lp.run_in_loop(move || conn.established_in_loop());
    }

    /// Copies `data` and hands it to the owning loop for buffered
    /// sending. Callable from any thread; silently dropped once the
    /// connection is disconnected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        // The caller's slice may be gone by the time the loop runs the
        // task, so it is copied up front.
        let mut buf = Buffer::with_capacity(data.len());
        buf.write(data);
        let conn = self.clone();
        self.lp.run_in_loop(move || conn.send_in_loop(&buf));
    }

    /// Graceful close: flushes what is pending on both buffers first.
    /// Multiple calls collapse into one.
    pub fn shutdown(self: &Arc<Self>) {
        let conn = self.clone();
        self.lp.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Arms idle reaping: the connection is released after `secs`
    /// seconds without an observed I/O event.
    pub fn enable_inactive_release(self: &Arc<Self>, secs: u32) {
        let conn = self.clone();
        self.lp.run_in_loop(move || conn.enable_inactive_release_in_loop(secs));
    }

    pub fn cancel_inactive_release(self: &Arc<Self>) {
        let conn = self.clone();
        self.lp.run_in_loop(move || conn.cancel_inactive_release_in_loop());
    }

    /// Replaces the context and the four user callbacks atomically with
    /// respect to the owning loop, so in-flight events cannot straddle
    /// the old and new protocol.
    ///
    /// # Panics
    /// Panics when called from any thread but the owning loop's.
    pub fn upgrade(
        &self,
        context: Context,
        connected: impl Fn(&Arc<Self>) + Send + Sync + 'static,
        message: impl Fn(&Arc<Self>, &mut Buffer) + Send + Sync + 'static,
        closed: impl Fn(&Arc<Self>) + Send + Sync + 'static,
        event: impl Fn(&Arc<Self>) + Send + Sync + 'static,
    ) {
        self.lp.assert_in_loop();
        *self.context.lock().unwrap() = context;
        let mut inner = self.inner.lock().unwrap();
        inner.connected_cb = Some(Arc::new(connected));
        inner.message_cb = Some(Arc::new(message));
        inner.closed_cb = Some(Arc::new(closed));
        inner.event_cb = Some(Arc::new(event));
    }

    fn established_in_loop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            safe_assert!(inner.status == ConnStatus::Connecting);
            inner.status = ConnStatus::Connected;
        }
        self.channel.enable_read();
        let cb = self.inner.lock().unwrap().connected_cb.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Drains the socket into the input buffer, then delivers one
    /// `message` callback. A hard error turns into a graceful shutdown;
    /// a peer close still flushes buffered input before release.
    fn handle_read(self: &Arc<Self>) {
        if self.inner.lock().unwrap().status == ConnStatus::Disconnected {
            return;
        }
        let mut scratch = [0u8; RECV_CHUNK];
        let mut peer_closed = false;
        loop {
            match self.sock.recv(&mut scratch) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => self.inner.lock().unwrap().in_buf.write(&scratch[..n]),
                Err(err) if is_transient(&err) => break,
                Err(err) => {
                    debug!(?err, id = self.id, "recv failed");
                    return self.shutdown_in_loop();
                }
            }
        }
        self.deliver_message();
        if peer_closed {
            self.release();
        }
    }

    /// Drains the output buffer to the socket. When it empties, write
    /// interest is dropped, or the connection released if a shutdown
    /// was waiting on the flush.
    fn handle_write(self: &Arc<Self>) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == ConnStatus::Disconnected {
                return;
            }
            if inner.out_buf.is_empty() {
                let draining = inner.status == ConnStatus::Disconnecting;
                drop(inner);
                if draining {
                    self.release();
                } else {
                    self.channel.disable_write();
                }
                return;
            }
            let sent = self.sock.send(inner.out_buf.readable());
            match sent {
                Ok(n) => inner.out_buf.consume(n),
                Err(err) if is_transient(&err) => return,
                Err(err) => {
                    debug!(?err, id = self.id, "send failed");
                    drop(inner);
                    self.deliver_message();
                    self.release();
                    return;
                }
            }
        }
    }

    /// The peer is gone; whatever input is buffered still goes through
    /// `message` before the release.
    fn handle_close(self: &Arc<Self>) {
        if self.inner.lock().unwrap().status == ConnStatus::Disconnected {
            return;
        }
        self.deliver_message();
        self.release();
    }

    fn handle_error(self: &Arc<Self>) {
        self.handle_close();
    }

    /// Any observed event counts as activity for the idle reaper.
    fn handle_any_event(self: &Arc<Self>) {
        let (inactive, cb) = {
            let inner = self.inner.lock().unwrap();
            (inner.inactive_release, inner.event_cb.clone())
        };
        if inactive {
            self.lp.timer_refresh(self.id);
        }
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Runs the `message` callback over the input buffer.
    ///
    /// The buffer is moved out for the duration of the call and the
    /// leftover moved back, so the callback may re-enter `send`,
    /// `shutdown` or `upgrade` on this connection.
    fn deliver_message(self: &Arc<Self>) {
        let (cb, mut buf) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_buf.is_empty() {
                return;
            }
            let Some(cb) = inner.message_cb.clone() else {
                return;
            };
            (cb, std::mem::take(&mut inner.in_buf))
        };
        cb(self, &mut buf);
        let mut inner = self.inner.lock().unwrap();
        safe_assert!(inner.in_buf.is_empty(), "input buffer written during message callback");
        inner.in_buf = buf;
    }

    fn send_in_loop(self: &Arc<Self>, buf: &Buffer) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == ConnStatus::Disconnected {
                return;
            }
            inner.out_buf.write_buffer(buf);
        }
        if !self.channel.writing() {
            self.channel.enable_write();
        }
    }

    /// Not the actual close: flushes buffered input through `message`,
    /// then either parks in Disconnecting until the output buffer
    /// drains, or releases right away.
    fn shutdown_in_loop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == ConnStatus::Disconnected {
                return;
            }
            inner.status = ConnStatus::Disconnecting;
        }
        self.deliver_message();
        let out_empty = self.inner.lock().unwrap().out_buf.is_empty();
        if out_empty {
            self.release();
        } else if !self.channel.writing() {
            self.channel.enable_write();
        }
    }

    /// Always queued, never inline: the caller may be mid-dispatch on
    /// this very connection.
    fn release(self: &Arc<Self>) {
        let conn = self.clone();
        self.lp.queue_in_loop(move || conn.release_in_loop());
    }

    fn release_in_loop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == ConnStatus::Disconnected {
                return;
            }
            inner.status = ConnStatus::Disconnected;
        }
        self.channel.remove();
        self.sock.close();
        if self.lp.has_timer(self.id) {
            self.cancel_inactive_release_in_loop();
        }
        let (closed, server_closed) = {
            let inner = self.inner.lock().unwrap();
            (inner.closed_cb.clone(), inner.server_closed_cb.clone())
        };
        debug!(id = self.id, "connection released");
        if let Some(cb) = closed {
            cb(self);
        }
        if let Some(cb) = server_closed {
            cb(self);
        }
    }

    fn enable_inactive_release_in_loop(self: &Arc<Self>, secs: u32) {
        self.inner.lock().unwrap().inactive_release = true;
        if self.lp.has_timer(self.id) {
            return self.lp.timer_refresh(self.id);
        }
        let weak = Arc::downgrade(self);
        self.lp.timer_add(self.id, secs, move || {
            if let Some(conn) = weak.upgrade() {
                conn.release();
            }
        });
    }

    fn cancel_inactive_release_in_loop(self: &Arc<Self>) {
        self.inner.lock().unwrap().inactive_release = false;
        if self.lp.has_timer(self.id) {
            self.lp.timer_cancel(self.id);
        }
    }
}
