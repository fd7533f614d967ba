use std::sync::Arc;

use crate::net::socket::Socket;

/// What the reactor should do with a connection after one [`ConnectionHandler::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the descriptor registered and re-arm its one-shot interest.
    Continue,
    /// The connection is finished: deregister it and drop the handler.
    Close,
}

impl From<bool> for Flow {
    fn from(keep: bool) -> Self {
        if keep {
            Flow::Continue
        } else {
            Flow::Close
        }
    }
}

/// Per-connection protocol state machine.
///
/// The reactor calls [`process`](Self::process) on a worker thread once per readiness event.
/// One-shot delivery guarantees no two calls for the same connection overlap, and the handler
/// is moved out of the registry for the duration of the call, so `&mut self` is exclusive.
///
/// `process` must not block on I/O: the socket is non-blocking and a read that would block is
/// a successful, empty unit of work.
pub trait ConnectionHandler: Send + 'static {
    fn process(&mut self) -> Flow;

    fn socket(&self) -> &Socket;
}

/// Builds the handler for a freshly accepted connection.
pub type HandlerFactory = Arc<dyn Fn(Socket) -> Box<dyn ConnectionHandler> + Send + Sync>;

/// Wraps a closure returning a concrete handler into a [`HandlerFactory`].
pub fn factory<F, H>(make: F) -> HandlerFactory
where
    F: Fn(Socket) -> H + Send + Sync + 'static,
    H: ConnectionHandler,
{
    Arc::new(move |socket| Box::new(make(socket)) as Box<dyn ConnectionHandler>)
}
