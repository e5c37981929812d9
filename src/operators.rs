//! Chainable operators selecting the targets of an emit and shaping the
//! outgoing packet.
//!
//! * [`ConfOperators`] configure a message for the single socket they were
//!   created from; this is the only place an acknowledgement can be
//!   requested.
//! * [`BroadcastOperators`] select sockets through the namespace adapter.
//!   Rooms and flags travel inside the operator value and are handed to the
//!   adapter as plain arguments, so no state is ever staged on the
//!   namespace itself.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::ack::AckStream;
use crate::adapter::{Adapter, BroadcastOptions, InMemoryAdapter, Room, RoomParam};
use crate::errors::{BroadcastError, SendError, SocketError};
use crate::ns::Namespace;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::{is_reserved, Socket};
use crate::transport::WriteOptions;

/// Chainable operators configuring a message for a single socket.
pub struct ConfOperators<'a, A: Adapter = InMemoryAdapter> {
    socket: &'a Socket<A>,
    binary: Vec<Bytes>,
    binary_flag: Option<bool>,
    compress: bool,
    volatile: bool,
    timeout: Option<Duration>,
}

impl<'a, A: Adapter> ConfOperators<'a, A> {
    pub(crate) fn new(socket: &'a Socket<A>) -> Self {
        Self {
            socket,
            binary: Vec::new(),
            binary_flag: None,
            compress: false,
            volatile: false,
            timeout: None,
        }
    }

    /// Attach binary payloads to the message.
    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Force or suppress binary framing, overriding the attachment-based
    /// detection.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary_flag = Some(binary);
        self
    }

    /// Allow (or forbid) the transport to compress the written frames.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Drop the message instead of queueing it if the transport is not
    /// currently writable.
    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    /// Custom acknowledgement timeout for this message.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Switch to broadcast selection: all sockets of the room(s) except the
    /// originating one.
    pub fn to(self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::from(self).to(rooms)
    }

    /// Alias for [`to`](Self::to).
    pub fn within(self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.to(rooms)
    }

    /// Switch to broadcast selection, excluding all sockets of the given
    /// room(s).
    pub fn except(self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::from(self).except(rooms)
    }

    /// Broadcast to the whole namespace except the originating socket.
    pub fn broadcast(self) -> BroadcastOperators<A> {
        BroadcastOperators::from(self).broadcast()
    }

    /// Broadcast without forwarding to other nodes of the cluster.
    pub fn local(self) -> BroadcastOperators<A> {
        BroadcastOperators::from(self).local()
    }

    /// Emit the event to the socket.
    pub fn emit<T: ?Sized + Serialize>(
        mut self,
        event: impl Into<Cow<'static, str>>,
        data: &T,
    ) -> Result<(), SendError> {
        let event = event.into();
        let data = serde_json::to_value(data)?;
        if is_reserved(&event) {
            let binary = std::mem::take(&mut self.binary);
            self.socket.dispatch_local(event, data, binary);
            return Ok(());
        }
        if !self.socket.connected() {
            return Err(SendError::Socket(SocketError::Closed));
        }
        let packet = self.get_packet(event, data);
        if self.volatile && !self.socket.conn_writable() {
            tracing::trace!(sid = %self.socket.id, "dropping volatile packet, transport not writable");
            return Ok(());
        }
        let opts = WriteOptions {
            compress: self.compress,
        };
        self.socket.send_with_opts(packet, opts)?;
        Ok(())
    }

    /// Emit the event and wait for the client acknowledgement.
    ///
    /// The packet id is allocated from the namespace counter and the
    /// returned [`AckStream`] resolves when the matching ACK arrives.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        mut self,
        event: impl Into<Cow<'static, str>>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        let event = event.into();
        if is_reserved(&event) {
            return Err(SendError::ReservedEvent);
        }
        let data = serde_json::to_value(data)?;
        if !self.socket.connected() {
            return Err(SendError::Socket(SocketError::Closed));
        }

        let mut packet = self.get_packet(event, data);
        let ack_id = self.socket.ns.next_ack_id();
        packet.inner.set_ack_id(ack_id);

        let (tx, rx) = oneshot::channel();
        let timeout = self.timeout.unwrap_or(self.socket.config().ack_timeout);
        if self.volatile && !self.socket.conn_writable() {
            // Dropped packet: the sender side is dropped so the stream
            // resolves instead of waiting for an ack that cannot come.
            drop(tx);
        } else {
            let opts = WriteOptions {
                compress: self.compress,
            };
            self.socket.send_with_opts(packet, opts)?;
            self.socket.acks.lock().unwrap().insert(ack_id, tx);
        }
        Ok(AckStream::new(tokio::time::timeout(timeout, rx)))
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(self, data: &T) -> Result<(), SendError> {
        self.emit("message", data)
    }

    fn get_packet(&mut self, event: Cow<'static, str>, data: Value) -> Packet {
        let ns = self.socket.ns.path.clone();
        let binary = self.binary_flag.unwrap_or(!self.binary.is_empty());
        if binary {
            Packet::bin_event(ns, event, data, std::mem::take(&mut self.binary))
        } else {
            Packet::event(ns, event, data)
        }
    }
}

/// Chainable operators selecting sockets through the namespace adapter.
pub struct BroadcastOperators<A: Adapter = InMemoryAdapter> {
    ns: Arc<Namespace<A>>,
    binary: Vec<Bytes>,
    binary_flag: Option<bool>,
    opts: BroadcastOptions,
}

impl<'a, A: Adapter> From<ConfOperators<'a, A>> for BroadcastOperators<A> {
    fn from(conf: ConfOperators<'a, A>) -> Self {
        let mut operators = Self::from_sock(conf.socket.ns.clone(), conf.socket.id.clone());
        operators.binary = conf.binary;
        operators.binary_flag = conf.binary_flag;
        operators.opts.flags.compress = conf.compress;
        operators.opts.flags.volatile = conf.volatile;
        operators
    }
}

impl<A: Adapter> BroadcastOperators<A> {
    pub(crate) fn new(ns: Arc<Namespace<A>>) -> Self {
        Self {
            ns,
            binary: Vec::new(),
            binary_flag: None,
            opts: BroadcastOptions::default(),
        }
    }

    /// Rebuild operators from an externally assembled selection. Used for
    /// template-level broadcasts fanning out over child namespaces.
    pub(crate) fn from_parts(
        ns: Arc<Namespace<A>>,
        opts: BroadcastOptions,
        binary: Vec<Bytes>,
        binary_flag: Option<bool>,
    ) -> Self {
        Self {
            ns,
            binary,
            binary_flag,
            opts,
        }
    }

    /// A broadcast originated by a socket always excludes its originator.
    pub(crate) fn from_sock(ns: Arc<Namespace<A>>, sid: Sid) -> Self {
        let mut opts = BroadcastOptions::new(sid);
        opts.flags.broadcast = true;
        Self {
            ns,
            binary: Vec::new(),
            binary_flag: None,
            opts,
        }
    }

    /// Target all sockets of the given room(s).
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Alias for [`to`](Self::to).
    pub fn within(self, rooms: impl RoomParam) -> Self {
        self.to(rooms)
    }

    /// Exclude all sockets of the given room(s) from the targets.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.opts.except_rooms.extend(rooms.into_room_iter());
        self
    }

    /// Exclude specific socket ids from the targets.
    pub fn except_sids(mut self, sids: impl IntoIterator<Item = Sid>) -> Self {
        self.opts.except.extend(sids);
        self
    }

    /// Exclude the originating socket from the targets.
    pub fn broadcast(mut self) -> Self {
        self.opts.flags.broadcast = true;
        self
    }

    /// Keep the broadcast on this node, never forwarding it to the rest of
    /// the cluster.
    pub fn local(mut self) -> Self {
        self.opts.flags.local = true;
        self
    }

    /// Skip sockets whose transport is not currently writable.
    pub fn volatile(mut self) -> Self {
        self.opts.flags.volatile = true;
        self
    }

    /// Allow (or forbid) the transport to compress the written frames.
    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.flags.compress = compress;
        self
    }

    /// Force or suppress binary framing, overriding the attachment-based
    /// detection.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary_flag = Some(binary);
        self
    }

    /// Attach binary payloads to the message.
    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Emit the event to every selected socket. The packet is encoded once
    /// and fanned out by the adapter.
    pub fn emit<T: ?Sized + Serialize>(
        mut self,
        event: impl Into<Cow<'static, str>>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        let event = event.into();
        if is_reserved(&event) {
            // There is no generic listener registry at the namespace level:
            // a reserved-name broadcast never reaches the wire.
            tracing::debug!(ns = %self.ns.path, %event, "reserved event name, dropping broadcast");
            return Ok(());
        }
        let data = serde_json::to_value(data)?;
        let packet = self.get_packet(event, data);
        self.ns.adapter.broadcast(packet, self.opts)
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(self, data: &T) -> Result<(), BroadcastError> {
        self.emit("message", data)
    }

    /// The socket ids present in the targeted rooms, across the whole
    /// cluster for distributed adapters.
    pub async fn all_sockets(self) -> HashSet<Sid> {
        self.ns.adapter.sockets(self.opts.rooms).await
    }

    /// The local sockets matching the selection.
    pub fn sockets(self) -> Vec<Arc<Socket<A>>> {
        self.ns.adapter.fetch_sockets(&self.opts)
    }

    /// Make every selected socket join the given room(s).
    pub fn join(self, rooms: impl RoomParam) {
        self.ns.adapter.add_sockets(&self.opts, rooms)
    }

    /// Make every selected socket leave the given room(s).
    pub fn leave(self, rooms: impl RoomParam) {
        self.ns.adapter.del_sockets(&self.opts, rooms)
    }

    /// Disconnect every selected socket from the namespace.
    pub fn disconnect(self) -> Result<(), Vec<SocketError>> {
        self.ns.adapter.disconnect_sockets(&self.opts)
    }

    /// The rooms targeted so far.
    pub fn rooms(&self) -> &[Room] {
        &self.opts.rooms
    }

    fn get_packet(&mut self, event: Cow<'static, str>, data: Value) -> Packet {
        let ns = self.ns.path.clone();
        let binary = self.binary_flag.unwrap_or(!self.binary.is_empty());
        if binary {
            Packet::bin_event(ns, event, data, std::mem::take(&mut self.binary))
        } else {
            Packet::event(ns, event, data)
        }
    }
}
