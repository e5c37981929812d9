//! Adapters track room membership and fan packets out to their targets.
//! The default [`InMemoryAdapter`] keeps the state of a single node in
//! memory; alternative implementations can share it between nodes, as long
//! as they preserve these semantics locally and forward non-`local`
//! broadcasts to their peers.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use itertools::Itertools;

use crate::errors::{BroadcastError, SocketError};
use crate::ns::Namespace;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::Socket;
use crate::transport::WriteOptions;

/// A room identifier.
pub type Room = Cow<'static, str>;

/// A trait for types usable as a room parameter.
///
/// [`String`], [`Vec<String>`], [`&'static str`](str), [`Sid`] and const
/// arrays are implemented by default.
pub trait RoomParam: 'static {
    type IntoIter: Iterator<Item = Room>;

    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for String {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self))
    }
}
impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Borrowed(self))
    }
}
impl RoomParam for Vec<String> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<String>, fn(String) -> Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
impl RoomParam for Vec<&'static str> {
    type IntoIter = std::iter::Map<std::vec::IntoIter<&'static str>, fn(&'static str) -> Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl<const COUNT: usize> RoomParam for [&'static str; COUNT] {
    type IntoIter =
        std::iter::Map<std::array::IntoIter<&'static str, COUNT>, fn(&'static str) -> Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Borrowed)
    }
}
impl<const COUNT: usize> RoomParam for [String; COUNT] {
    type IntoIter = std::iter::Map<std::array::IntoIter<String, COUNT>, fn(String) -> Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(Cow::Owned)
    }
}
impl RoomParam for Sid {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(Cow::Owned(self.as_str().to_owned()))
    }
}

/// Broadcast modifiers. All default to false.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastFlags {
    /// Allow the transport to compress the written frames.
    pub compress: bool,
    /// Drop the packet for sockets whose transport is not currently
    /// writable instead of queueing it.
    pub volatile: bool,
    /// Do not forward the broadcast to other nodes of the cluster.
    pub local: bool,
    /// Exclude the originating socket from the targets.
    pub broadcast: bool,
}

/// Target selection and modifiers for one broadcast.
#[derive(Clone, Debug, Default)]
pub struct BroadcastOptions {
    /// The rooms to broadcast to. Empty means every socket known to the
    /// adapter.
    pub rooms: Vec<Room>,
    /// Rooms whose members are excluded from the targets.
    pub except_rooms: Vec<Room>,
    /// Socket ids excluded from the targets.
    pub except: HashSet<Sid>,
    pub flags: BroadcastFlags,
    /// The originating socket, when the broadcast comes from a socket
    /// rather than a namespace.
    pub sender: Option<Sid>,
}

impl BroadcastOptions {
    pub fn new(sender: Sid) -> Self {
        Self {
            sender: Some(sender),
            ..Default::default()
        }
    }
}

/// Membership bookkeeping and packet fan-out for one namespace.
///
/// Membership operations are infallible against unknown sids and rooms:
/// removals are idempotent and a broadcast towards a socket that is already
/// gone is a silent no-op.
pub trait Adapter: Sized + Send + Sync + 'static {
    /// Create a new adapter with a back-reference to the namespace it
    /// serves.
    fn new(ns: Weak<Namespace<Self>>) -> Self;

    /// Initialize the adapter (subscribe to a cluster bus, ...).
    fn init(&self) {}
    /// Close the adapter.
    fn close(&self) {}

    /// Number of nodes serving this namespace.
    fn server_count(&self) -> u16;

    /// Add the socket to every room, creating rooms on demand.
    fn add_all(&self, sid: Sid, rooms: impl RoomParam);
    /// Remove the socket from the rooms, dropping rooms that become empty.
    fn del(&self, sid: &Sid, rooms: impl RoomParam);
    /// Remove the socket from every room it belongs to.
    fn del_all(&self, sid: &Sid);

    /// Broadcast the packet to every socket selected by `opts`. The packet
    /// is encoded once and the frames are written to every target.
    fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), BroadcastError>;

    /// The rooms the socket belongs to, or empty.
    fn socket_rooms(&self, sid: &Sid) -> HashSet<Room>;

    /// The socket ids present in the given rooms (every socket known to
    /// the adapter when `rooms` is empty). Async so that cross-node
    /// adapters can aggregate over the cluster.
    fn sockets(&self, rooms: Vec<Room>) -> impl Future<Output = HashSet<Sid>> + Send;

    /// The local sockets selected by `opts`.
    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<Arc<Socket<Self>>>;

    /// Make the sockets selected by `opts` join the rooms.
    fn add_sockets(&self, opts: &BroadcastOptions, rooms: impl RoomParam);
    /// Make the sockets selected by `opts` leave the rooms.
    fn del_sockets(&self, opts: &BroadcastOptions, rooms: impl RoomParam);
    /// Disconnect the sockets selected by `opts` from their namespace.
    fn disconnect_sockets(&self, opts: &BroadcastOptions) -> Result<(), Vec<SocketError>>;
}

/// The default single-node adapter.
#[derive(Debug)]
pub struct InMemoryAdapter {
    /// Room -> members.
    rooms: RwLock<HashMap<Room, HashSet<Sid>>>,
    /// Socket -> rooms it belongs to. Kept in lockstep with `rooms` so both
    /// directions are O(1).
    sids: RwLock<HashMap<Sid, HashSet<Room>>>,
    ns: Weak<Namespace<Self>>,
}

impl Adapter for InMemoryAdapter {
    fn new(ns: Weak<Namespace<Self>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            sids: RwLock::new(HashMap::new()),
            ns,
        }
    }

    fn server_count(&self) -> u16 {
        1
    }

    fn add_all(&self, sid: Sid, rooms: impl RoomParam) {
        let mut rooms_map = self.rooms.write().unwrap();
        let mut sids_map = self.sids.write().unwrap();
        for room in rooms.into_room_iter() {
            rooms_map
                .entry(room.clone())
                .or_default()
                .insert(sid.clone());
            sids_map.entry(sid.clone()).or_default().insert(room);
        }
    }

    fn del(&self, sid: &Sid, rooms: impl RoomParam) {
        let mut rooms_map = self.rooms.write().unwrap();
        let mut sids_map = self.sids.write().unwrap();
        for room in rooms.into_room_iter() {
            if let Some(members) = rooms_map.get_mut(&room) {
                members.remove(sid);
                if members.is_empty() {
                    rooms_map.remove(&room);
                }
            }
            if let Some(joined) = sids_map.get_mut(sid) {
                joined.remove(&room);
                if joined.is_empty() {
                    sids_map.remove(sid);
                }
            }
        }
    }

    fn del_all(&self, sid: &Sid) {
        let mut rooms_map = self.rooms.write().unwrap();
        let mut sids_map = self.sids.write().unwrap();
        for room in sids_map.remove(sid).unwrap_or_default() {
            if let Some(members) = rooms_map.get_mut(&room) {
                members.remove(sid);
                if members.is_empty() {
                    rooms_map.remove(&room);
                }
            }
        }
    }

    fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), BroadcastError> {
        let ns = match self.ns.upgrade() {
            Some(ns) => ns,
            None => return Ok(()),
        };
        let sids = self.select_sids(&opts);
        tracing::debug!(ns = %ns.path, "broadcasting packet to {} sockets", sids.len());

        // Encode once, write the same frames to every target.
        let frames = ns.parser().encode(packet);
        let write_opts = WriteOptions {
            compress: opts.flags.compress,
        };

        for sid in sids {
            let socket = match ns.get_socket(&sid) {
                Some(s) => s,
                None => continue,
            };
            if opts.flags.volatile && !socket.conn_writable() {
                tracing::trace!(%sid, "dropping volatile packet, transport not writable");
                continue;
            }
            socket.send_raw(frames.clone(), write_opts);
        }
        Ok(())
    }

    fn socket_rooms(&self, sid: &Sid) -> HashSet<Room> {
        self.sids
            .read()
            .unwrap()
            .get(sid)
            .cloned()
            .unwrap_or_default()
    }

    fn sockets(&self, rooms: Vec<Room>) -> impl Future<Output = HashSet<Sid>> + Send {
        let set = if rooms.is_empty() {
            self.sids.read().unwrap().keys().cloned().collect()
        } else {
            let rooms_map = self.rooms.read().unwrap();
            rooms
                .iter()
                .filter_map(|room| rooms_map.get(room))
                .flatten()
                .cloned()
                .collect()
        };
        std::future::ready(set)
    }

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<Arc<Socket<Self>>> {
        match self.ns.upgrade() {
            Some(ns) => self
                .select_sids(opts)
                .into_iter()
                .filter_map(|sid| ns.get_socket(&sid))
                .collect(),
            None => Vec::new(),
        }
    }

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: impl RoomParam) {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for sid in self.select_sids(opts) {
            self.add_all(sid, rooms.clone());
        }
    }

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: impl RoomParam) {
        let rooms: Vec<Room> = rooms.into_room_iter().collect();
        for sid in self.select_sids(opts) {
            self.del(&sid, rooms.clone());
        }
    }

    fn disconnect_sockets(&self, opts: &BroadcastOptions) -> Result<(), Vec<SocketError>> {
        let errors: Vec<SocketError> = self
            .fetch_sockets(opts)
            .into_iter()
            .filter_map(|socket| socket.disconnect().err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl InMemoryAdapter {
    /// Resolve `opts` to the targeted socket ids, deduplicated.
    fn select_sids(&self, opts: &BroadcastOptions) -> Vec<Sid> {
        let except = self.except_sids(opts);
        let excluded = |sid: &Sid| {
            except.contains(sid)
                || (opts.flags.broadcast && opts.sender.as_ref() == Some(sid))
        };

        if opts.rooms.is_empty() {
            self.sids
                .read()
                .unwrap()
                .keys()
                .filter(|sid| !excluded(sid))
                .cloned()
                .collect()
        } else {
            let rooms_map = self.rooms.read().unwrap();
            opts.rooms
                .iter()
                .filter_map(|room| rooms_map.get(room))
                .flatten()
                .unique()
                .filter(|sid| !excluded(sid))
                .cloned()
                .collect()
        }
    }

    fn except_sids(&self, opts: &BroadcastOptions) -> HashSet<Sid> {
        let mut except = opts.except.clone();
        let rooms_map = self.rooms.read().unwrap();
        for room in &opts.except_rooms {
            if let Some(members) = rooms_map.get(room) {
                except.extend(members.iter().cloned());
            }
        }
        except
    }
}
