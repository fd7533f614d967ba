use std::{net::SocketAddr, sync::Arc};

use tracing::{error, info};

use crate::{
    config::ServerConfig,
    error::{Error, Result, SetupStage},
    handler::HandlerFactory,
    net::{acceptor::AcceptHandler, socket::Socket},
    reactor::{Reactor, ShutdownHandle},
    registry::HandlerRegistry,
};

/// A TCP server: one listening socket, one reactor thread and a pool of workers.
///
/// ## Example
///
/// ```rust,no_run
/// use millrace::{protocols::{self, Protocol}, Server, ServerConfig};
///
/// let config = ServerConfig::builder().port(12345).num_threads(4).build();
/// let server = Server::bind(config)?;
/// server.run(protocols::factory(Protocol::Echo))?; // blocks until stopped
/// # Ok::<(), millrace::Error>(())
/// ```
pub struct Server {
    listener: Socket,
    reactor: Reactor,
    config: ServerConfig,
    local_addr: SocketAddr,
}

impl Server {
    /// Opens the listening socket on `0.0.0.0:port` and prepares the reactor and pool.
    ///
    /// ## Errors
    ///
    /// Every failure here is fatal and reported as [`Error::Setup`] naming the failed stage.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let result = Self::setup(config);
        if let Err(e) = &result {
            error!("{e}");
        }
        result
    }

    fn setup(config: ServerConfig) -> Result<Self> {
        let mut listener = Socket::nonblocking().map_err(Error::setup(SetupStage::Socket))?;
        listener
            .set_reuse_addr()
            .map_err(Error::setup(SetupStage::ReuseAddr))?;
        listener
            .bind_any(config.port)
            .map_err(Error::setup(SetupStage::Bind))?;
        listener.listen().map_err(Error::setup(SetupStage::Listen))?;
        let local_addr = listener.local_addr()?;

        let reactor = Reactor::new(
            config.num_threads,
            config.events_capacity,
            config.poll_timeout(),
        )
        .map_err(Error::setup(SetupStage::Poll))?;

        Ok(Self {
            listener,
            reactor,
            config,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.reactor.get_shutdown_handle(),
            registry: self.reactor.registry(),
        }
    }

    /// Serves connections with handlers built by `factory` until stopped.
    ///
    /// Blocks the calling thread. Returns once [`ServerHandle::stop`] was called and the pool
    /// has drained, or with an error if polling or the listening socket fails.
    pub fn run(mut self, factory: HandlerFactory) -> Result<()> {
        let acceptor = AcceptHandler::new(
            self.listener,
            factory,
            self.reactor.registry(),
            self.reactor.controller(),
        )
        .with_max_connections(self.config.max_connections);
        self.reactor
            .set_acceptor(acceptor)
            .map_err(Error::setup(SetupStage::Register))
            .inspect_err(|e| error!("{e}"))?;

        info!(
            "server start on port {} with {} workers",
            self.local_addr.port(),
            self.config.num_threads
        );
        self.reactor.run()
    }

    /// Binds `port` with `threads` workers and serves until stopped.
    pub fn start(factory: HandlerFactory, port: u16, threads: usize) -> Result<()> {
        let config = ServerConfig::builder()
            .port(port)
            .num_threads(threads)
            .build();
        Self::bind(config)?.run(factory)
    }
}

/// Cloneable control surface of a [`Server`], usable from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: ShutdownHandle,
    registry: Arc<HandlerRegistry>,
}

impl ServerHandle {
    /// Asks the reactor to stop. [`Server::run`] returns after the pool drains.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    /// Connections currently registered, including ones being processed.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }
}
