//! Readiness multiplexer over `mio` (epoll on Linux) with one-shot delivery.
//!
//! mio registrations are always edge-triggered. One-shot delivery is layered on top with an
//! armed flag per token: once an event for a one-shot token has been handed out by
//! [`Multiplexer::wait`], later events for it are swallowed until [`Controller::modify`]
//! re-arms it. Re-arming re-registers the descriptor, and epoll re-evaluates readiness on
//! `EPOLL_CTL_MOD`, so an edge that fired while the token was disarmed is reported again.
//!
//! ```text
//!   reactor thread                      worker thread
//!   ──────────────                      ─────────────
//!   wait() ── event(T) ── disarm T ──▶  process()
//!   wait() ── event(T) ── dropped         │
//!   wait() ◀───────── re-report ──────  modify(T)  (arm + EPOLL_CTL_MOD)
//! ```

use std::{
    collections::HashMap,
    fmt, io,
    ops::BitOr,
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use mio::{unix::SourceFd, Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    error::{Error, Result},
    event::Readiness,
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Reserved for the waker that interrupts a blocked [`Multiplexer::wait`].
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Interest flags for [`Controller::add`] and [`Controller::modify`].
///
/// Hang-up and error conditions are always reported by the kernel; `HANG_UP` is accepted for
/// readability at call sites. `EDGE` documents the trigger mode mio always uses.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b0_0001);
    pub const WRITABLE: Interest = Interest(0b0_0010);
    pub const HANG_UP: Interest = Interest(0b0_0100);
    pub const EDGE: Interest = Interest(0b0_1000);
    pub const ONESHOT: Interest = Interest(0b1_0000);

    /// What every connection is (re-)armed with.
    pub const CONNECTION: Interest =
        Interest(Self::READABLE.0 | Self::EDGE.0 | Self::ONESHOT.0);

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_oneshot(self) -> bool {
        self.contains(Self::ONESHOT)
    }

    fn to_mio(self) -> Result<mio::Interest> {
        match (
            self.contains(Self::READABLE),
            self.contains(Self::WRITABLE),
        ) {
            (true, true) => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Ok(mio::Interest::READABLE),
            (false, true) => Ok(mio::Interest::WRITABLE),
            (false, false) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interest must include READABLE or WRITABLE",
            )
            .into()),
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::HANG_UP, "HANG_UP"),
            (Self::EDGE, "EDGE"),
            (Self::ONESHOT, "ONESHOT"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Interest({})", set.join(" | "))
    }
}

#[derive(Debug, Clone, Copy)]
struct Arming {
    oneshot: bool,
    armed: bool,
}

/// Control half of the multiplexer: add, modify and remove interest.
///
/// Cheap to clone and safe to use from any thread, including while the reactor thread is
/// blocked in [`Multiplexer::wait`].
#[derive(Clone)]
pub struct Controller {
    registry: Arc<Registry>,
    arming: Arc<Mutex<HashMap<Token, Arming>>>,
}

impl Controller {
    pub fn add(&self, fd: RawFd, interest: Interest, token: Token) -> Result<()> {
        let mio_interest = interest.to_mio()?;
        {
            let mut arming = self.arming.lock();
            if arming.contains_key(&token) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{token:?} is already registered"),
                )
                .into());
            }
            arming.insert(
                token,
                Arming {
                    oneshot: interest.is_oneshot(),
                    armed: true,
                },
            );
        }

        if let Err(e) = self.registry.register(&mut SourceFd(&fd), token, mio_interest) {
            self.arming.lock().remove(&token);
            return Err(e.into());
        }
        trace!(fd, ?token, ?interest, "poll add");
        Ok(())
    }

    /// Re-arms `token` with `interest`.
    pub fn modify(&self, fd: RawFd, interest: Interest, token: Token) -> Result<()> {
        let mio_interest = interest.to_mio()?;
        {
            let mut arming = self.arming.lock();
            let entry = arming.get_mut(&token).ok_or(Error::UnknownToken(token))?;
            entry.oneshot = interest.is_oneshot();
            entry.armed = true;
        }
        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&fd), token, mio_interest)
        {
            if let Some(entry) = self.arming.lock().get_mut(&token) {
                entry.armed = false;
            }
            return Err(e.into());
        }
        trace!(fd, ?token, ?interest, "poll modify");
        Ok(())
    }

    pub fn remove(&self, fd: RawFd, token: Token) -> Result<()> {
        self.arming.lock().remove(&token);
        self.registry.deregister(&mut SourceFd(&fd))?;
        trace!(fd, ?token, "poll remove");
        Ok(())
    }

    /// Drops the arming state of a token whose descriptor is already closed.
    pub fn forget(&self, token: Token) {
        self.arming.lock().remove(&token);
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.arming.lock().contains_key(&token)
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    controller: Controller,
    waker: Arc<Waker>,
}

impl Multiplexer {
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            controller: Controller {
                registry: Arc::new(registry),
                arming: Arc::new(Mutex::new(HashMap::new())),
            },
            waker: Arc::new(waker),
        })
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Blocks until at least one registered descriptor is ready, the waker fires, or
    /// `timeout` elapses (`None` waits forever).
    ///
    /// Events come back in kernel order. Disarmed one-shot tokens and the waker are filtered
    /// out, so the result may be empty.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut arming = self.controller.arming.lock();
        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            match arming.get_mut(&token) {
                Some(entry) if entry.armed => {
                    if entry.oneshot {
                        entry.armed = false;
                    }
                    ready.push(Readiness::from(event));
                }
                Some(_) => trace!(?token, "event for disarmed token suppressed"),
                None => trace!(?token, "event for unregistered token dropped"),
            }
        }
        Ok(ready)
    }
}
