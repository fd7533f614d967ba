use tracing::{error, info};

use crate::{
    handler::{ConnectionHandler, Flow},
    net::socket::{Recv, Socket},
};

const READ_BUF_LEN: usize = 1024;

/// Sends every chunk it receives straight back to the peer.
pub struct EchoHandler {
    socket: Socket,
    buf: Box<[u8]>,
}

impl EchoHandler {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            buf: vec![0; READ_BUF_LEN].into_boxed_slice(),
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn process(&mut self) -> Flow {
        let n = match self.socket.recv(&mut self.buf) {
            Ok(Recv::Data(n)) => n,
            Ok(Recv::WouldBlock) => return Flow::Continue,
            Ok(Recv::Closed) => {
                info!(
                    "close({}:{})",
                    self.socket.peer_ip(),
                    self.socket.peer_port()
                );
                return Flow::Close;
            }
            Err(e) => {
                error!("socket recv error: {e}");
                return Flow::Close;
            }
        };

        let data = &self.buf[..n];
        let line = String::from_utf8_lossy(data);
        let line = line.strip_suffix('\n').unwrap_or(&line);
        info!(
            "recv({}:{}): {line}",
            self.socket.peer_ip(),
            self.socket.peer_port()
        );

        if let Err(e) = self.socket.send_all(data) {
            error!("socket send error: {e}");
            return Flow::Close;
        }
        info!(
            "send({}:{}): {line}",
            self.socket.peer_ip(),
            self.socket.peer_port()
        );
        Flow::Continue
    }

    fn socket(&self) -> &Socket {
        &self.socket
    }
}
