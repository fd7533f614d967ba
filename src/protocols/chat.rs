//! Line-oriented group chat.
//!
//! Commands, one per line:
//!
//! | line          | effect                                                        |
//! |---------------|---------------------------------------------------------------|
//! | `name=<n>`    | sets the display name, replies `your name is: <n> now!`       |
//! | `group=<g>`   | leaves the current group and joins `g`, greets the others     |
//! | anything else | broadcast as `<name>: <text>` to the group, sender included   |
//!
//! Members that never picked a name are shown as `unknown`.

use std::{
    collections::{BTreeSet, HashMap},
    num::IntErrorKind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{
    error::Result,
    handler::{ConnectionHandler, Flow},
    net::socket::{PeerWriter, Recv, Socket},
};

pub const DEFAULT_NAME: &str = "unknown";

const READ_BUF_LEN: usize = 1024;
const MAX_LINE_LEN: usize = 4096;

pub type MemberId = u64;
pub type GroupId = i32;

struct Member {
    name: Option<String>,
    group: Option<GroupId>,
    writer: PeerWriter,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<MemberId, Member>,
    groups: HashMap<GroupId, BTreeSet<MemberId>>,
}

impl RoomState {
    fn leave_group(&mut self, id: MemberId) {
        let Some(group) = self.members.get_mut(&id).and_then(|m| m.group.take()) else {
            return;
        };
        if let Some(members) = self.groups.get_mut(&group) {
            members.remove(&id);
            if members.is_empty() {
                self.groups.remove(&group);
            }
        }
    }
}

/// Names and group memberships of every connected chat client.
///
/// Shared by all chat handlers of a server. A single lock covers the tables and the
/// writes to other members, so two broadcasts do not interleave within one recipient's
/// stream. Direct replies go through the owning socket outside the lock and may still land
/// between the pieces of a broadcast that hit a short write.
#[derive(Default)]
pub struct ChatRooms {
    state: Mutex<RoomState>,
    next_id: AtomicU64,
}

impl ChatRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, writer: PeerWriter) -> MemberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().members.insert(
            id,
            Member {
                name: None,
                group: None,
                writer,
            },
        );
        id
    }

    pub fn leave(&self, id: MemberId) {
        let mut state = self.state.lock();
        state.leave_group(id);
        state.members.remove(&id);
    }

    pub fn set_name(&self, id: MemberId, name: &str) {
        if let Some(member) = self.state.lock().members.get_mut(&id) {
            member.name = Some(name.to_owned());
        }
    }

    pub fn name_of(&self, id: MemberId) -> String {
        self.state
            .lock()
            .members
            .get(&id)
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| DEFAULT_NAME.to_owned())
    }

    /// Moves `id` into `group`, leaving its previous group first.
    pub fn set_group(&self, id: MemberId, group: GroupId) {
        let mut state = self.state.lock();
        if !state.members.contains_key(&id) {
            return;
        }
        state.leave_group(id);
        if let Some(member) = state.members.get_mut(&id) {
            member.group = Some(group);
        }
        state.groups.entry(group).or_default().insert(id);
    }

    pub fn group_of(&self, id: MemberId) -> Option<GroupId> {
        self.state.lock().members.get(&id).and_then(|m| m.group)
    }

    pub fn group_size(&self, group: GroupId) -> usize {
        self.state.lock().groups.get(&group).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `msg` to every member of the sender's group.
    ///
    /// Returns `Ok(false)` when the sender is in no group. A failed write to another member
    /// is logged and skipped; a failed write to the sender is returned.
    pub fn broadcast(&self, from: MemberId, msg: &str, include_self: bool) -> Result<bool> {
        let state = self.state.lock();
        let Some(group) = state.members.get(&from).and_then(|m| m.group) else {
            return Ok(false);
        };
        let Some(targets) = state.groups.get(&group) else {
            return Ok(false);
        };

        for &target in targets {
            if target == from && !include_self {
                continue;
            }
            let Some(member) = state.members.get(&target) else {
                continue;
            };
            match member.writer.send_all(msg.as_bytes()) {
                Ok(()) => info!(
                    "send({}): {}",
                    member.writer.peer(),
                    msg.trim_end_matches('\n')
                ),
                Err(e) if target == from => return Err(e),
                Err(e) => warn!("socket send error to {}: {e}", member.writer.peer()),
            }
        }
        Ok(true)
    }
}

/// Per-connection chat state: the member id and any partial line.
pub struct ChatHandler {
    socket: Socket,
    rooms: Arc<ChatRooms>,
    member: Option<MemberId>,
    pending: Vec<u8>,
    buf: Box<[u8]>,
}

impl ChatHandler {
    pub fn new(socket: Socket, rooms: Arc<ChatRooms>) -> Self {
        let member = match socket.try_clone_writer() {
            Ok(writer) => Some(rooms.join(writer)),
            Err(e) => {
                error!("failed to clone chat socket: {e}");
                None
            }
        };
        Self {
            socket,
            rooms,
            member,
            pending: Vec::new(),
            buf: vec![0; READ_BUF_LEN].into_boxed_slice(),
        }
    }

    pub fn member(&self) -> Option<MemberId> {
        self.member
    }

    fn reply(&self, msg: &str) -> Result<()> {
        self.socket.send_all(msg.as_bytes())?;
        info!(
            "send({}:{}): {}",
            self.socket.peer_ip(),
            self.socket.peer_port(),
            msg.trim_end_matches('\n')
        );
        Ok(())
    }

    fn handle_line(&self, id: MemberId, line: &str) -> Result<()> {
        if let Some(name) = line.strip_prefix("name=") {
            self.rooms.set_name(id, name);
            return self.reply(&format!("your name is: {name} now!\n"));
        }

        if let Some(arg) = line.strip_prefix("group=") {
            let group = match arg.trim().parse::<GroupId>() {
                Ok(group) => group,
                Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow | IntErrorKind::NegOverflow) => {
                    return self.reply("out of range, please input\n");
                }
                Err(_) => return self.reply("invalid argument\n"),
            };
            self.rooms.set_group(id, group);
            let name = self.rooms.name_of(id);
            self.reply(&format!("you are in group: {group} now!\n"))?;
            self.rooms
                .broadcast(id, &format!("Welcome {name} join group {group}!\n"), false)?;
            return Ok(());
        }

        let msg = format!("{}: {line}\n", self.rooms.name_of(id));
        if !self.rooms.broadcast(id, &msg, true)? {
            self.reply(&msg)?;
            self.reply("(you are not in one group!)\n")?;
        }
        Ok(())
    }

    /// Splits complete lines off the pending bytes and handles each.
    fn handle_pending(&mut self, id: MemberId) -> Flow {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Err(e) = self.handle_line(id, line) {
                error!("socket send error: {e}");
                return Flow::Close;
            }
        }
        if self.pending.len() > MAX_LINE_LEN {
            warn!(
                "line from {}:{} exceeds {MAX_LINE_LEN} bytes, closing",
                self.socket.peer_ip(),
                self.socket.peer_port()
            );
            return Flow::Close;
        }
        Flow::Continue
    }
}

impl ConnectionHandler for ChatHandler {
    fn process(&mut self) -> Flow {
        let Some(id) = self.member else {
            return Flow::Close;
        };
        match self.socket.recv(&mut self.buf) {
            Ok(Recv::Data(n)) => {
                info!(
                    "recv({}:{}): {}",
                    self.socket.peer_ip(),
                    self.socket.peer_port(),
                    String::from_utf8_lossy(&self.buf[..n]).trim_end_matches('\n')
                );
                self.pending.extend_from_slice(&self.buf[..n]);
                self.handle_pending(id)
            }
            Ok(Recv::WouldBlock) => Flow::Continue,
            Ok(Recv::Closed) => {
                info!(
                    "close({}:{})",
                    self.socket.peer_ip(),
                    self.socket.peer_port()
                );
                Flow::Close
            }
            Err(e) => {
                error!("socket recv error: {e}");
                Flow::Close
            }
        }
    }

    fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Drop for ChatHandler {
    fn drop(&mut self) {
        if let Some(id) = self.member.take() {
            self.rooms.leave(id);
        }
    }
}
