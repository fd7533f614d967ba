//! Ready-made connection handlers.
//!
//! Each protocol is an ordinary [`ConnectionHandler`](crate::handler::ConnectionHandler);
//! [`factory`] builds the [`HandlerFactory`] the server needs for a [`Protocol`].

use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    error::Error,
    handler::{self, HandlerFactory},
};

pub mod chat;
pub mod echo;
pub mod framed_echo;

pub use chat::{ChatHandler, ChatRooms};
pub use echo::EchoHandler;
pub use framed_echo::{framed_echo, FramedEcho};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Echo,
    Chat,
    Framed,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Echo => "echo",
            Protocol::Chat => "chat",
            Protocol::Framed => "framed",
        }
    }

    /// File name the demo binary looks for next to its executable.
    pub fn config_file_name(self) -> String {
        format!("{}_server.json", self.name())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo" => Ok(Protocol::Echo),
            "chat" => Ok(Protocol::Chat),
            "framed" => Ok(Protocol::Framed),
            other => Err(Error::Config(format!("unknown protocol {other:?}"))),
        }
    }
}

/// Handler factory for `protocol`. Chat connections of one factory share one set of rooms.
pub fn factory(protocol: Protocol) -> HandlerFactory {
    match protocol {
        Protocol::Echo => handler::factory(EchoHandler::new),
        Protocol::Chat => {
            let rooms = Arc::new(ChatRooms::new());
            handler::factory(move |socket| ChatHandler::new(socket, Arc::clone(&rooms)))
        }
        Protocol::Framed => handler::factory(framed_echo),
    }
}
