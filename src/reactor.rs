use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::{Token, Waker};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    event::Readiness,
    handler::{ConnectionHandler, Flow},
    net::{acceptor::AcceptHandler, socket::INVALID_DESCRIPTOR},
    poll::{Controller, Interest, Multiplexer},
    registry::HandlerRegistry,
    thread_pool::ThreadPool,
};

/// Token of the listening socket. Connection tokens are registry slab keys and never get
/// near it.
pub const LISTENER: Token = Token(usize::MAX - 1);

/// The event loop: one thread waits for readiness and hands ready connections to the pool.
pub struct Reactor {
    multiplexer: Multiplexer,
    controller: Controller,
    registry: Arc<HandlerRegistry>,
    pool: ThreadPool,
    acceptor: Option<AcceptHandler>,
    poll_timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(workers: usize, events_capacity: usize, poll_timeout: Option<Duration>) -> Result<Self> {
        let multiplexer = Multiplexer::new(events_capacity)?;
        let controller = multiplexer.controller();
        Ok(Self {
            multiplexer,
            controller,
            registry: Arc::new(HandlerRegistry::new()),
            pool: ThreadPool::new(workers),
            acceptor: None,
            poll_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn get_shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            running: Arc::clone(&self.running),
            waker: self.multiplexer.waker(),
        }
    }

    /// Registers the listening socket. Accept events are then handled on the reactor thread.
    pub fn set_acceptor(&mut self, acceptor: AcceptHandler) -> Result<()> {
        self.controller.add(
            acceptor.socket().descriptor(),
            Interest::READABLE | Interest::EDGE,
            LISTENER,
        )?;
        self.acceptor = Some(acceptor);
        Ok(())
    }

    /// Runs until [`ShutdownHandle::shutdown`] is called or the listener fails.
    ///
    /// On return the pool has drained its queue and every remaining connection is closed.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.event_loop();
        self.running.store(false, Ordering::SeqCst);

        self.pool.shutdown();
        let closed = self.registry.clear();
        info!(closed, "reactor stopped");
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            let events = self.multiplexer.wait(self.poll_timeout)?;
            for event in events {
                self.dispatch(event)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Readiness) -> Result<()> {
        let token = event.token();
        if token == LISTENER {
            return self.accept();
        }

        if event.is_hang_up() || event.is_error() {
            info!(?token, "socket closed by peer");
            self.close(token);
        } else if event.is_readable() {
            self.submit(token);
        } else {
            warn!(?event, "unknown event");
            self.close(token);
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        let Some(acceptor) = self.acceptor.as_mut() else {
            warn!("listener event without an acceptor");
            return Ok(());
        };
        match acceptor.process() {
            Flow::Continue => Ok(()),
            Flow::Close => {
                let fd = acceptor.socket().descriptor();
                if let Err(e) = self.controller.remove(fd, LISTENER) {
                    error!("epoll del listener error: {e}");
                }
                self.acceptor = None;
                self.stop.store(true, Ordering::SeqCst);
                error!("listening socket failed, stopping server");
                Err(Error::ListenerFailed)
            }
        }
    }

    /// Deregisters and drops a connection on the reactor thread.
    fn close(&self, token: Token) {
        match self.registry.remove(token) {
            Some(handler) => {
                deregister(&self.controller, token, handler.as_ref());
                drop(handler);
            }
            None => debug!(?token, "close requested for a connection not held by the registry"),
        }
    }

    fn submit(&self, token: Token) {
        let Some(handler) = self.registry.check_out(token) else {
            debug!(?token, "readable event without an idle handler");
            return;
        };
        let registry = Arc::clone(&self.registry);
        let controller = self.controller.clone();

        if let Err(e) = self
            .pool
            .execute(move || process_on_worker(token, handler, &registry, &controller))
        {
            // the rejected task dropped the handler and with it the socket
            error!(?token, "failed to dispatch connection: {e}");
            self.controller.forget(token);
            self.registry.remove(token);
        }
    }
}

/// Body of every worker task: one `process()` call followed by re-arm or teardown.
fn process_on_worker(
    token: Token,
    mut handler: Box<dyn ConnectionHandler>,
    registry: &HandlerRegistry,
    controller: &Controller,
) {
    let flow = match panic::catch_unwind(AssertUnwindSafe(|| handler.process())) {
        Ok(flow) => flow,
        Err(_) => {
            error!(?token, "handler panicked, closing connection");
            Flow::Close
        }
    };

    if flow == Flow::Close || !handler.socket().is_open() {
        deregister(controller, token, handler.as_ref());
        registry.remove(token);
        drop(handler);
        return;
    }

    let fd = handler.socket().descriptor();
    if let Err(handler) = registry.check_in(token, handler) {
        debug!(?token, "slot vanished while processing");
        deregister(controller, token, handler.as_ref());
        return;
    }
    if let Err(e) = controller.modify(fd, Interest::CONNECTION, token) {
        error!(?token, "epoll mod error: {e}");
        // the token is disarmed, so the handler is still idle in its slot
        if let Err(e) = controller.remove(fd, token) {
            error!(?token, fd, "epoll del error: {e}");
        }
        registry.remove(token);
    }
}

fn deregister(controller: &Controller, token: Token, handler: &dyn ConnectionHandler) {
    let fd = handler.socket().descriptor();
    if fd == INVALID_DESCRIPTOR {
        controller.forget(token);
        return;
    }
    if let Err(e) = controller.remove(fd, token) {
        error!(?token, fd, "epoll del error: {e}");
    }
}

/// Stops a running [`Reactor`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!("failed to wake the reactor: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
