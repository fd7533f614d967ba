use mio::{event::Event, Token};
use std::fmt;

/// One readiness notification produced by [`Multiplexer::wait`](crate::poll::Multiplexer::wait).
///
/// Flattens `mio::event::Event` into the four conditions the reactor dispatches on. The token
/// indexes the handler registry, so no second lookup by descriptor is needed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    hang_up: bool,
    error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("hang_up", &self.hang_up)
            .field("error", &self.error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Both directions are closed (`EPOLLHUP`).
    pub fn is_hang_up(&self) -> bool {
        self.hang_up
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            // mio reports EPOLLHUP as both halves closed; a half-close (EPOLLRDHUP) stays a
            // readable event so the handler can drain buffered bytes and see EOF itself.
            hang_up: event.is_read_closed() && event.is_write_closed(),
            error: event.is_error(),
        }
    }
}
