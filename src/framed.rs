//! Length-prefixed messages over a stream socket.
//!
//! A frame is four ASCII decimal digits giving the payload length, then the payload:
//! `"0005hello"`. Frames may arrive split across reads or several to a read; the handler
//! buffers bytes in a [`RingBuffer`] and hands complete payloads to a [`MessageHandler`].

use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    handler::{ConnectionHandler, Flow},
    net::socket::{Recv, Socket},
    ring_buffer::RingBuffer,
};

pub const PREFIX_LEN: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = 9999;
pub const RING_CAPACITY: usize = 4096;
pub const SCRATCH_LEN: usize = 1024;

/// Application callback for [`FramedHandler`].
pub trait MessageHandler: Send + 'static {
    /// Called once per complete payload, in arrival order.
    fn on_message(&mut self, out: &mut Outbox<'_>, payload: &[u8]) -> Flow;
}

/// Prepends the zero-padded length prefix to `payload`.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:04}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parses a length prefix. `None` unless all four bytes are ASCII digits.
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Option<usize> {
    prefix.iter().try_fold(0usize, |len, b| {
        b.is_ascii_digit().then(|| len * 10 + usize::from(b - b'0'))
    })
}

/// Write side handed to [`MessageHandler::on_message`]. Frames everything it sends.
pub struct Outbox<'a> {
    socket: &'a Socket,
}

impl<'a> Outbox<'a> {
    pub fn new(socket: &'a Socket) -> Self {
        Self { socket }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode(payload)?;
        trace!(
            peer = ?self.socket.addr(),
            "send: {}",
            String::from_utf8_lossy(payload)
        );
        self.socket.send_all(&frame)
    }

    pub fn socket(&self) -> &Socket {
        self.socket
    }
}

/// Connection handler decoding length-prefixed frames for an application handler `A`.
pub struct FramedHandler<A> {
    socket: Socket,
    ring: RingBuffer,
    scratch: Box<[u8]>,
    max_payload: usize,
    app: A,
}

impl<A: MessageHandler> FramedHandler<A> {
    pub fn new(socket: Socket, app: A) -> Self {
        Self {
            socket,
            ring: RingBuffer::new(RING_CAPACITY),
            scratch: vec![0; SCRATCH_LEN].into_boxed_slice(),
            max_payload: RING_CAPACITY - PREFIX_LEN,
            app,
        }
    }

    /// Lowers the largest accepted payload. Values above what the ring can hold are clamped.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(RING_CAPACITY - PREFIX_LEN);
        self
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    fn fill(&mut self) -> Result<Recv> {
        let room = self.ring.free().min(self.scratch.len());
        let received = self.socket.recv(&mut self.scratch[..room])?;
        if let Recv::Data(n) = received {
            self.ring.put(&self.scratch[..n]);
            trace!(
                peer = ?self.socket.addr(),
                "recv: {}",
                String::from_utf8_lossy(&self.scratch[..n])
            );
        }
        Ok(received)
    }

    /// Delivers every complete frame buffered so far.
    fn drain_frames(&mut self) -> Flow {
        let mut prefix = [0u8; PREFIX_LEN];
        while self.ring.len() >= PREFIX_LEN {
            self.ring.peek(&mut prefix);
            let Some(len) = parse_prefix(&prefix) else {
                warn!(peer = ?self.socket.addr(), ?prefix, "malformed length prefix");
                return Flow::Close;
            };
            if len > self.max_payload {
                warn!(peer = ?self.socket.addr(), len, "frame exceeds maximum payload");
                return Flow::Close;
            }
            if self.ring.len() < PREFIX_LEN + len {
                break;
            }

            self.ring.pop(PREFIX_LEN);
            let mut payload = vec![0u8; len];
            self.ring.get(&mut payload);
            let mut outbox = Outbox::new(&self.socket);
            if self.app.on_message(&mut outbox, &payload) == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }
}

impl<A: MessageHandler> ConnectionHandler for FramedHandler<A> {
    fn process(&mut self) -> Flow {
        match self.fill() {
            Ok(Recv::Data(_)) => self.drain_frames(),
            Ok(Recv::WouldBlock) => Flow::Continue,
            Ok(Recv::Closed) => {
                info!(peer = ?self.socket.addr(), "connection closed by peer");
                Flow::Close
            }
            Err(e) => {
                debug!(peer = ?self.socket.addr(), "socket recv error: {e}");
                Flow::Close
            }
        }
    }

    fn socket(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpStream,
        sync::Arc,
        thread,
        time::Duration,
    };

    use parking_lot::Mutex;

    use crate::net::socket::SockFlags;

    type Seen = Arc<Mutex<Vec<Vec<u8>>>>;

    struct Recorder(Seen);

    impl MessageHandler for Recorder {
        fn on_message(&mut self, _out: &mut Outbox<'_>, payload: &[u8]) -> Flow {
            self.0.lock().push(payload.to_vec());
            Flow::Continue
        }
    }

    struct Reply;

    impl MessageHandler for Reply {
        fn on_message(&mut self, out: &mut Outbox<'_>, payload: &[u8]) -> Flow {
            out.send(payload).is_ok().into()
        }
    }

    fn recorder(seen: Seen) -> Recorder {
        Recorder(seen)
    }

    /// A server-side socket connected to a blocking client stream.
    fn connected() -> (Socket, TcpStream) {
        let mut listener = Socket::nonblocking().unwrap();
        listener.bind("127.0.0.1", 0).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let server = loop {
            if let Some(socket) = listener.accept(SockFlags::NONBLOCK).unwrap() {
                break socket;
            }
            thread::sleep(Duration::from_millis(5));
        };
        (server, client)
    }

    /// Processes until `cond` holds or the retries run out.
    fn pump<A: MessageHandler>(handler: &mut FramedHandler<A>, cond: impl Fn() -> bool) -> Flow {
        for _ in 0..50 {
            let flow = handler.process();
            if flow == Flow::Close || cond() {
                return flow;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Flow::Continue
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(b"hello").unwrap(), b"0005hello");
        assert_eq!(encode(b"").unwrap(), b"0000");
        assert!(matches!(
            encode(&vec![0u8; 10_000]),
            Err(Error::FrameTooLarge(10_000))
        ));
    }

    #[test]
    fn test_parse_prefix() {
        assert_eq!(parse_prefix(b"0005"), Some(5));
        assert_eq!(parse_prefix(b"9999"), Some(9999));
        assert_eq!(parse_prefix(b"00a5"), None);
        assert_eq!(parse_prefix(b" 005"), None);
    }

    #[test]
    fn test_single_frame() {
        let seen = Seen::default();
        let (socket, mut client) = connected();
        let mut handler = FramedHandler::new(socket, recorder(Arc::clone(&seen)));

        client.write_all(b"0005hello").unwrap();
        let flow = pump(&mut handler, || !seen.lock().is_empty());
        assert_eq!(flow, Flow::Continue);
        assert_eq!(*seen.lock(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let seen = Seen::default();
        let (socket, mut client) = connected();
        let mut handler = FramedHandler::new(socket, recorder(Arc::clone(&seen)));

        client.write_all(b"0005hel").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handler.process(), Flow::Continue);
        assert!(seen.lock().is_empty());

        client.write_all(b"lo").unwrap();
        pump(&mut handler, || !seen.lock().is_empty());
        assert_eq!(*seen.lock(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let seen = Seen::default();
        let (socket, mut client) = connected();
        let mut handler = FramedHandler::new(socket, recorder(Arc::clone(&seen)));

        client.write_all(b"0002hi00000003bye").unwrap();
        pump(&mut handler, || seen.lock().len() == 3);
        assert_eq!(
            *seen.lock(),
            vec![b"hi".to_vec(), Vec::new(), b"bye".to_vec()]
        );
    }

    #[test]
    fn test_malformed_prefix_closes() {
        let (socket, mut client) = connected();
        let mut handler = FramedHandler::new(socket, recorder(Seen::default()));
        client.write_all(b"hello").unwrap();
        assert_eq!(pump(&mut handler, || false), Flow::Close);
    }

    #[test]
    fn test_oversized_frame_closes() {
        let (socket, mut client) = connected();
        let mut handler =
            FramedHandler::new(socket, recorder(Seen::default())).with_max_payload(8);
        client.write_all(b"0009123456789").unwrap();
        assert_eq!(pump(&mut handler, || false), Flow::Close);
    }

    #[test]
    fn test_peer_close() {
        let (socket, client) = connected();
        let mut handler = FramedHandler::new(socket, recorder(Seen::default()));
        drop(client);
        assert_eq!(pump(&mut handler, || false), Flow::Close);
    }

    #[test]
    fn test_outbox_frames_replies() {
        let (socket, mut client) = connected();
        let mut handler = FramedHandler::new(socket, Reply);

        client.write_all(b"0004ping").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut reply = Vec::new();
        for _ in 0..50 {
            handler.process();
            let mut buf = [0u8; 16];
            if let Ok(n) = client.read(&mut buf) {
                reply.extend_from_slice(&buf[..n]);
            }
            if reply.len() >= 8 {
                break;
            }
        }
        assert_eq!(reply, b"0004ping");
    }
}
