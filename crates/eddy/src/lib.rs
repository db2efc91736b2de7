//! Reactor-style TCP networking runtime.
//!
//! One event loop per thread, edge-triggered readiness via epoll, a
//! hashed-wheel timer for idle-connection reaping, and a connection
//! state machine mediating buffered reads/writes, graceful shutdown and
//! user callbacks. [`TcpServer`] distributes accepted connections
//! round-robin over a pool of worker loops.

mod buffer;
mod channel;
mod context;
mod event_loop;
mod poller;
mod pool;
mod socket;
mod timer;

pub mod tcp;

pub use buffer::Buffer;
pub use channel::Channel;
pub use context::Context;
pub use event_loop::EventLoop;
pub use poller::Ready;
pub use pool::{LoopPriority, LoopThreadPool};
pub use socket::{SetupError, Socket};
pub use tcp::{ConnStatus, Connection, TcpServer};
