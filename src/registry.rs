//! Token → handler registry owned by the server.
//!
//! Tokens are slab keys, so looking up the handler for an event is an index, not a hash.
//! A slot stays reserved for as long as its descriptor is registered with the multiplexer;
//! while a worker processes the connection the handler is checked out and the slot is empty.

use mio::Token;
use parking_lot::Mutex;
use slab::Slab;

use crate::handler::ConnectionHandler;

type Handler = Box<dyn ConnectionHandler>;

enum Slot {
    Idle(Handler),
    Busy,
}

#[derive(Default)]
pub struct HandlerRegistry {
    slots: Mutex<Slab<Slot>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handler: Handler) -> Token {
        Token(self.slots.lock().insert(Slot::Idle(handler)))
    }

    /// Moves the handler out for processing. The slot stays reserved.
    ///
    /// Returns `None` if the token is unknown or the handler is already checked out.
    pub fn check_out(&self, token: Token) -> Option<Handler> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(token.0)?;
        match std::mem::replace(slot, Slot::Busy) {
            Slot::Idle(handler) => Some(handler),
            Slot::Busy => None,
        }
    }

    /// Puts a processed handler back into its reserved slot.
    ///
    /// Hands the handler back if the slot no longer exists.
    pub fn check_in(&self, token: Token, handler: Handler) -> Result<(), Handler> {
        let mut slots = self.slots.lock();
        match slots.get_mut(token.0) {
            Some(slot) if matches!(slot, Slot::Busy) => {
                *slot = Slot::Idle(handler);
                Ok(())
            }
            _ => Err(handler),
        }
    }

    /// Frees the slot, returning the handler if it was not checked out.
    pub fn remove(&self, token: Token) -> Option<Handler> {
        let mut slots = self.slots.lock();
        if !slots.contains(token.0) {
            return None;
        }
        match slots.remove(token.0) {
            Slot::Idle(handler) => Some(handler),
            Slot::Busy => None,
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.slots.lock().contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every idle handler, closing their sockets.
    pub fn clear(&self) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().collect();
        drained.len()
    }
}
