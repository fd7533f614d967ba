use std::{io, net::SocketAddr, result::Result as StdResult};

use mio::Token;

pub type Result<T> = StdResult<T, Error>;

/// Stage of server setup that failed. Any of these is fatal: the server never starts serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Socket,
    ReuseAddr,
    Bind,
    Listen,
    Poll,
    Register,
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            SetupStage::Socket => "socket init",
            SetupStage::ReuseAddr => "socket set reuse addr",
            SetupStage::Bind => "socket bind",
            SetupStage::Listen => "socket listen",
            SetupStage::Poll => "poll init",
            SetupStage::Register => "poll add listener",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{stage} error: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: io::Error,
    },

    #[error("accept error: {0}")]
    Accept(#[source] io::Error),

    #[error("listening socket failed")]
    ListenerFailed,

    #[error("invalid address {0}")]
    Address(String),

    #[error("socket is closed")]
    Closed,

    #[error("send to {peer} would block after {written} of {total} bytes")]
    ShortWrite {
        peer: SocketAddr,
        written: usize,
        total: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("token {0:?} is not registered")]
    UnknownToken(Token),

    #[error("thread pool is shut down")]
    PoolShutDown,

    #[error("task was dropped before producing a result")]
    TaskCanceled,

    #[error("frame payload of {0} bytes does not fit a 4 digit length prefix")]
    FrameTooLarge(usize),
}

impl Error {
    /// Tags an I/O failure with the setup stage it happened in.
    pub(crate) fn setup(stage: SetupStage) -> impl FnOnce(Error) -> Error {
        move |e| match e {
            Error::Io(source) => Error::Setup { stage, source },
            other => other,
        }
    }
}
