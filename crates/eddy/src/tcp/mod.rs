mod acceptor;
mod connection;
mod server;

pub use acceptor::Acceptor;
pub use connection::{
    AnyEventCallback, ClosedCallback, ConnStatus, ConnectedCallback, Connection, MessageCallback,
};
pub use server::TcpServer;
