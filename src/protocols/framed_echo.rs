use tracing::{error, info};

use crate::{
    framed::{FramedHandler, MessageHandler, Outbox},
    handler::Flow,
    net::socket::Socket,
};

/// Replies to every framed message with the same payload, framed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedEcho;

impl MessageHandler for FramedEcho {
    fn on_message(&mut self, out: &mut Outbox<'_>, payload: &[u8]) -> Flow {
        let socket = out.socket();
        info!(
            "recv({}:{}): {}",
            socket.peer_ip(),
            socket.peer_port(),
            String::from_utf8_lossy(payload)
        );
        match out.send(payload) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!("socket send error: {e}");
                Flow::Close
            }
        }
    }
}

pub fn framed_echo(socket: Socket) -> FramedHandler<FramedEcho> {
    FramedHandler::new(socket, FramedEcho)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::ConnectionHandler, net::socket::SockFlags};
    use std::{
        io::{Read, Write},
        net::TcpStream,
        thread,
        time::Duration,
    };

    #[test]
    fn test_replies_framed() {
        let mut listener = Socket::nonblocking().unwrap();
        listener.bind("127.0.0.1", 0).unwrap();
        listener.listen().unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let socket = loop {
            if let Some(socket) = listener.accept(SockFlags::NONBLOCK).unwrap() {
                break socket;
            }
            thread::sleep(Duration::from_millis(5));
        };
        let mut handler = framed_echo(socket);

        client.write_all(b"0003abc0002de").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handler.process(), Flow::Continue);

        let mut reply = [0u8; 13];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"0003abc0002de");
    }
}
