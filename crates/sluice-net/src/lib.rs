pub mod frame;

mod conn;
mod listener;
mod notifier;
mod pool;
mod sendq;
mod server;
mod workers;

pub use listener::ListenSock;
pub use server::{Server, ServerConfig, ServerError};
pub use workers::{Handler, Reply, Request};
