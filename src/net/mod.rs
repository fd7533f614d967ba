//! Socket primitives and the listener-side handler.
//!
//! ```text
//!   Socket::nonblocking ─▶ set_reuse_addr ─▶ bind_any(port) ─▶ listen (backlog 128)
//!        │
//!        ▼
//!   AcceptHandler::process (reactor thread)
//!        ├─ accept() until "no pending connection"
//!        ├─ factory(socket) ─▶ Box<dyn ConnectionHandler>
//!        ├─ registry.insert ─▶ Token
//!        └─ controller.add(fd, READABLE | EDGE | ONESHOT, token)
//! ```

pub mod acceptor;
pub mod socket;

pub use acceptor::AcceptHandler;
pub use socket::{PeerWriter, Recv, SockFlags, Socket};
