use std::{io, sync::Arc};

use mio::Token;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    handler::{ConnectionHandler, Flow, HandlerFactory},
    net::socket::{SockFlags, Socket},
    poll::{Controller, Interest},
    registry::HandlerRegistry,
};

/// Handler bound to the listening socket.
///
/// Runs on the reactor thread. Each readiness event drains the whole accept backlog: under
/// edge-triggered delivery a connection left in the backlog would not be reported again.
pub struct AcceptHandler {
    listener: Socket,
    factory: HandlerFactory,
    registry: Arc<HandlerRegistry>,
    controller: Controller,
    max_connections: Option<usize>,
}

impl AcceptHandler {
    pub fn new(
        listener: Socket,
        factory: HandlerFactory,
        registry: Arc<HandlerRegistry>,
        controller: Controller,
    ) -> Self {
        Self {
            listener,
            factory,
            registry,
            controller,
            max_connections: None,
        }
    }

    /// Connections accepted beyond `max` are closed right away.
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    fn register(&self, socket: Socket) -> Result<Token> {
        let fd = socket.descriptor();
        let handler = (self.factory)(socket);
        let token = self.registry.insert(handler);
        if let Err(e) = self.controller.add(fd, Interest::CONNECTION, token) {
            // dropping the handler closes the connection
            self.registry.remove(token);
            return Err(e);
        }
        Ok(token)
    }

    fn at_capacity(&self) -> bool {
        self.max_connections
            .is_some_and(|max| self.registry.len() >= max)
    }
}

impl ConnectionHandler for AcceptHandler {
    fn process(&mut self) -> Flow {
        loop {
            match self
                .listener
                .accept(SockFlags::NONBLOCK | SockFlags::CLOEXEC)
            {
                Ok(Some(socket)) => {
                    let peer = socket.addr();
                    if self.at_capacity() {
                        warn!(?peer, "max connections reached, rejecting");
                        continue;
                    }
                    match self.register(socket) {
                        Ok(token) => info!(
                            "new connection from {}:{} ({token:?})",
                            peer.map(|p| p.ip().to_string()).unwrap_or_default(),
                            peer.map_or(0, |p| p.port())
                        ),
                        Err(e) => error!(?peer, "failed to register connection: {e}"),
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(Error::Accept(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                    ) =>
                {
                    debug!("transient accept failure: {e}");
                }
                Err(Error::Accept(e)) => {
                    error!("socket accept error: {e}");
                    return Flow::Close;
                }
                Err(e) => warn!("dropping accepted connection: {e}"),
            }
        }
    }

    fn socket(&self) -> &Socket {
        &self.listener
    }
}
