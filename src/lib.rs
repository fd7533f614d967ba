//! # Millrace
//! A multi-threaded TCP server core built on a one-shot readiness reactor.
//!
//! One reactor thread waits on [`mio`] (epoll on Linux). Each ready connection is handed to a
//! worker pool, and its interest stays disarmed until the worker finishes, so a connection is
//! never processed by two workers at once. Handlers are plain state machines behind the
//! [`ConnectionHandler`] trait; the listening socket has its own handler that runs inline on
//! the reactor thread.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │   Server    │───▶│   Reactor    │───▶│ Multiplexer │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!                       │        │
//!          accept inline│        │readable: check out handler
//!                       ▼        ▼
//!              ┌──────────────┐ ┌──────────────┐    ┌─────────────┐
//!              │AcceptHandler │ │ ThreadPool   │───▶│   Workers   │
//!              └──────────────┘ └──────────────┘    └─────────────┘
//!                       │                                  │
//!                       ▼                                  ▼
//!              ┌─────────────────┐        process(), check in, re-arm
//!              │ HandlerRegistry │◀───────────────────────────┘
//!              └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use millrace::{handler, Flow, ConnectionHandler, Recv, Server, ServerConfig, Socket};
//!
//! struct Echo(Socket);
//!
//! impl ConnectionHandler for Echo {
//!     fn process(&mut self) -> Flow {
//!         let mut buf = [0u8; 1024];
//!         match self.0.recv(&mut buf) {
//!             Ok(Recv::Data(n)) => self.0.send_all(&buf[..n]).is_ok().into(),
//!             Ok(Recv::WouldBlock) => Flow::Continue,
//!             Ok(Recv::Closed) | Err(_) => Flow::Close,
//!         }
//!     }
//!
//!     fn socket(&self) -> &Socket {
//!         &self.0
//!     }
//! }
//!
//! fn main() -> Result<(), millrace::Error> {
//!     let server = Server::bind(ServerConfig::builder().port(8080).build())?;
//!     server.run(handler::factory(Echo))
//! }
//! ```
//!
//! - [`Server`]: binds the listener and runs the reactor
//! - [`ConnectionHandler`]: per-connection protocol logic
//! - [`framed`]: length-prefixed messages on top of a [`ring_buffer::RingBuffer`]
//! - [`protocols`]: echo, chat and framed echo handlers
//! - [`thread_pool`]: the worker pool
//! - [`poll`]: one-shot readiness multiplexer

pub mod config;
pub mod error;
pub mod event;
pub mod framed;
pub mod handler;
pub mod net;
pub mod poll;
pub mod protocols;
pub mod reactor;
pub mod registry;
pub mod ring_buffer;
pub mod server;
pub mod thread_pool;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use handler::{ConnectionHandler, Flow, HandlerFactory};
pub use net::{Recv, Socket};
pub use server::{Server, ServerHandle};

/// Re-exports of the types most handlers and servers need.
///
/// ```rust
/// use millrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::framed::{FramedHandler, MessageHandler, Outbox};
    pub use crate::handler::{self, ConnectionHandler, Flow, HandlerFactory};
    pub use crate::net::{PeerWriter, Recv, Socket};
    pub use crate::server::{Server, ServerHandle};
    pub use crate::thread_pool::{self, ThreadPool};
}
