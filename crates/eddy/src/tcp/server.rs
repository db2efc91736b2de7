use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, info};

use crate::{
    buffer::Buffer,
    event_loop::EventLoop,
    pool::LoopThreadPool,
    tcp::{
        acceptor::Acceptor,
        connection::{
            AnyEventCallback, ClosedCallback, ConnectedCallback, Connection, MessageCallback,
        },
    },
};

/// Reactor TCP server: one base loop hosting the acceptor, N worker
/// loops hosting connections, round-robin placement.
///
/// Configure with the setters, then call [`start`](Self::start), which
/// never returns.
pub struct TcpServer {
    port: u16,
    thread_count: usize,
    inactive_secs: Option<u32>,
    connected_cb: Option<ConnectedCallback>,
    message_cb: Option<MessageCallback>,
    closed_cb: Option<ClosedCallback>,
    event_cb: Option<AnyEventCallback>,
}

impl TcpServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            thread_count: 0,
            inactive_secs: None,
            connected_cb: None,
            message_cb: None,
            closed_cb: None,
            event_cb: None,
        }
    }

    /// Worker loops to spawn; 0 (the default) runs everything on the
    /// base loop.
    pub fn set_thread_count(&mut self, thread_count: usize) {
        self.thread_count = thread_count;
    }

    /// Releases connections after `secs` seconds without I/O events.
    pub fn enable_inactive_release(&mut self, secs: u32) {
        self.inactive_secs = Some(secs);
    }

    pub fn set_connected_callback(&mut self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.connected_cb = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&Arc<Connection>, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.message_cb = Some(Arc::new(cb));
    }

    pub fn set_closed_callback(&mut self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.closed_cb = Some(Arc::new(cb));
    }

    pub fn set_any_event_callback(&mut self, cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.event_cb = Some(Arc::new(cb));
    }

    /// Builds the base loop, the worker pool and the acceptor, then
    /// runs the base loop on the calling thread forever.
    pub fn start(self) -> ! {
        let base = EventLoop::new();
        let mut pool = LoopThreadPool::new(base.clone());
        pool.set_thread_count(self.thread_count);
        pool.start();

        let core = Arc::new(ServerCore {
            base: base.clone(),
            pool,
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
            inactive_secs: self.inactive_secs,
            connected_cb: self.connected_cb,
            message_cb: self.message_cb,
            closed_cb: self.closed_cb,
            event_cb: self.event_cb,
        });

        let acceptor = Acceptor::new(&base, self.port);
        let on_accept = core.clone();
        acceptor.set_accept_callback(move |fd| on_accept.on_accept(fd));
        acceptor.listen();

        info!(port = self.port, workers = self.thread_count, "tcp server listening");
        base.start()
    }
}

struct ServerCore {
    base: Arc<EventLoop>,
    pool: LoopThreadPool,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<Connection>>>,
    inactive_secs: Option<u32>,
    connected_cb: Option<ConnectedCallback>,
    message_cb: Option<MessageCallback>,
    closed_cb: Option<ClosedCallback>,
    event_cb: Option<AnyEventCallback>,
}

impl ServerCore {
    /// Runs on the base loop for every accepted fd: pick the next
    /// worker loop, wire the connection up, hand it over.
    fn on_accept(self: &Arc<Self>, fd: RawFd) {
        let lp = self.pool.next_loop();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::new(lp, id, fd);
        debug!(id, fd, "connection accepted");

        if let Some(cb) = &self.connected_cb {
            let cb = cb.clone();
            conn.set_connected_callback(move |c| cb(c));
        }
        if let Some(cb) = &self.message_cb {
            let cb = cb.clone();
            conn.set_message_callback(move |c, buf| cb(c, buf));
        }
        if let Some(cb) = &self.closed_cb {
            let cb = cb.clone();
            conn.set_closed_callback(move |c| cb(c));
        }
        if let Some(cb) = &self.event_cb {
            let cb = cb.clone();
            conn.set_any_event_callback(move |c| cb(c));
        }

        let core = Arc::downgrade(self);
        conn.set_server_closed_callback(move |c| {
            if let Some(core) = core.upgrade() {
                core.remove_connection(c.id());
            }
        });

        if let Some(secs) = self.inactive_secs {
            conn.enable_inactive_release(secs);
        }
        conn.established();
        self.conns.lock().unwrap().insert(id, conn);
    }

    /// Registry mutation happens only on the base loop.
    fn remove_connection(self: &Arc<Self>, id: u64) {
        let core = self.clone();
        self.base.run_in_loop(move || {
            core.conns.lock().unwrap().remove(&id);
            debug!(id, "connection deregistered");
        });
    }
}
