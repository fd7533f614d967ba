use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use millrace::{
    handler,
    protocols::{self, Protocol},
    ConnectionHandler, Flow, HandlerFactory, Recv, Server, ServerConfig, ServerHandle, Socket,
};

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<millrace::Result<()>>>,
}

impl Running {
    fn start(factory: HandlerFactory) -> Self {
        Self::start_with(ServerConfig::builder(), factory)
    }

    fn start_with(builder: millrace::config::ServerConfigBuilder, factory: HandlerFactory) -> Self {
        let config = builder
            .port(0)
            .num_threads(4)
            .poll_timeout(Duration::from_millis(20))
            .build();
        let server = Server::bind(config).unwrap();
        let port = server.local_addr().port();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run(factory));
        assert!(wait_until(|| handle.is_running()));
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            handle,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn echo_round_trip_and_close() {
    let server = Running::start(protocols::factory(Protocol::Echo));
    let mut client = server.connect();

    client.write_all(b"hello\n").unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");
    assert_eq!(server.handle.connection_count(), 1);

    drop(client);
    assert!(wait_until(|| server.handle.connection_count() == 0));
}

#[test]
fn reset_connection_is_removed() {
    let server = Running::start(protocols::factory(Protocol::Echo));
    let client = server.connect();
    assert!(wait_until(|| server.handle.connection_count() == 1));

    // a zero linger turns the close into a reset, reported as a hang-up
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client);
    assert!(wait_until(|| server.handle.connection_count() == 0));

    let mut other = server.connect();
    other.write_all(b"still here\n").unwrap();
    let mut reply = [0u8; 11];
    other.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"still here\n");
}

#[test]
fn echo_serves_many_clients() {
    let server = Running::start(protocols::factory(Protocol::Echo));

    let clients: Vec<_> = (0..16)
        .map(|i| {
            let mut stream = server.connect();
            thread::spawn(move || {
                for round in 0..20 {
                    let msg = format!("client {i} round {round}\n");
                    stream.write_all(msg.as_bytes()).unwrap();
                    let mut reply = vec![0u8; msg.len()];
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(reply, msg.as_bytes());
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    assert!(wait_until(|| server.handle.connection_count() == 0));
}

/// Records overlapping `process()` calls on the same connection.
struct Exclusive {
    socket: Socket,
    active: AtomicUsize,
    overlaps: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl ConnectionHandler for Exclusive {
    fn process(&mut self) -> Flow {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));

        let mut buf = [0u8; 64];
        let flow = match self.socket.recv(&mut buf) {
            Ok(Recv::Data(n)) => self.socket.send_all(&buf[..n]).is_ok().into(),
            Ok(Recv::WouldBlock) => Flow::Continue,
            Ok(Recv::Closed) | Err(_) => Flow::Close,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        flow
    }

    fn socket(&self) -> &Socket {
        &self.socket
    }
}

#[test]
fn connection_is_never_processed_concurrently() {
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = {
        let overlaps = Arc::clone(&overlaps);
        let calls = Arc::clone(&calls);
        handler::factory(move |socket| Exclusive {
            socket,
            active: AtomicUsize::new(0),
            overlaps: Arc::clone(&overlaps),
            calls: Arc::clone(&calls),
        })
    };
    let server = Running::start(factory);
    let mut client = server.connect();

    // small writes in quick succession raise many edges while a call is in flight
    let total = 2_000;
    let writer = {
        let mut stream = client.try_clone().unwrap();
        thread::spawn(move || {
            for _ in 0..total / 4 {
                stream.write_all(b"abcd").unwrap();
            }
        })
    };
    let mut received = vec![0u8; total];
    client.read_exact(&mut received).unwrap();
    writer.join().unwrap();

    assert!(received.chunks(4).all(|c| c == b"abcd"));
    assert!(calls.load(Ordering::SeqCst) > 0);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn chat_group_flow() {
    let server = Running::start(protocols::factory(Protocol::Chat));

    let mut alice = server.connect();
    let mut alice_in = BufReader::new(alice.try_clone().unwrap());
    let mut bob = server.connect();
    let mut bob_in = BufReader::new(bob.try_clone().unwrap());

    alice.write_all(b"name=alice\n").unwrap();
    assert_eq!(read_line(&mut alice_in), "your name is: alice now!\n");
    alice.write_all(b"group=1\n").unwrap();
    assert_eq!(read_line(&mut alice_in), "you are in group: 1 now!\n");

    bob.write_all(b"hi\n").unwrap();
    assert_eq!(read_line(&mut bob_in), "unknown: hi\n");
    assert_eq!(read_line(&mut bob_in), "(you are not in one group!)\n");

    bob.write_all(b"name=bob\n").unwrap();
    assert_eq!(read_line(&mut bob_in), "your name is: bob now!\n");
    bob.write_all(b"group=1\n").unwrap();
    assert_eq!(read_line(&mut bob_in), "you are in group: 1 now!\n");
    assert_eq!(read_line(&mut alice_in), "Welcome bob join group 1!\n");

    bob.write_all(b"hello alice\n").unwrap();
    assert_eq!(read_line(&mut bob_in), "bob: hello alice\n");
    assert_eq!(read_line(&mut alice_in), "bob: hello alice\n");

    // bob leaves; alice keeps chatting alone in the group
    bob.shutdown(Shutdown::Both).unwrap();
    assert!(wait_until(|| server.handle.connection_count() == 1));
    alice.write_all(b"anyone?\n").unwrap();
    assert_eq!(read_line(&mut alice_in), "alice: anyone?\n");
}

#[test]
fn framed_echo_over_tcp() {
    let server = Running::start(protocols::factory(Protocol::Framed));
    let mut client = server.connect();

    client.write_all(b"0005hel").unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"lo0003abc").unwrap();

    let mut reply = [0u8; 16];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"0005hello0003abc");
}

#[test]
fn framed_rejects_malformed_prefix() {
    let server = Running::start(protocols::factory(Protocol::Framed));
    let mut client = server.connect();

    client.write_all(b"oops").unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert!(wait_until(|| server.handle.connection_count() == 0));
}

#[test]
fn max_connections_is_enforced() {
    let server = Running::start_with(
        ServerConfig::builder().max_connections(2),
        protocols::factory(Protocol::Echo),
    );
    let _a = server.connect();
    let _b = server.connect();
    assert!(wait_until(|| server.handle.connection_count() == 2));

    let mut c = server.connect();
    let mut buf = [0u8; 1];
    assert_eq!(c.read(&mut buf).unwrap(), 0);
    assert_eq!(server.handle.connection_count(), 2);
}

#[test]
fn stop_closes_open_connections() {
    let mut server = Running::start(protocols::factory(Protocol::Echo));
    let mut client = server.connect();
    assert!(wait_until(|| server.handle.connection_count() == 1));

    server.handle.stop();
    let result = server.thread.take().unwrap().join().unwrap();
    assert!(result.is_ok());
    assert!(!server.handle.is_running());
    assert_eq!(server.handle.connection_count(), 0);

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}
