//! A [`Socket`] is the logical endpoint of one namespace on one client
//! connection. It is the user-facing handle: events, acknowledgements,
//! rooms and lifecycle listeners all live here.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::ack::{AckResult, AckSender, AckStream};
use crate::adapter::{Adapter, InMemoryAdapter, Room, RoomParam};
use crate::client::Client;
use crate::config::ServerConfig;
use crate::errors::{SendError, SocketError};
use crate::handler::{
    BoxedEventMiddleware, BoxedMessageHandler, ErrorHandler, LifecycleHandler, MessageHandler,
    MiddlewareRes,
};
use crate::handshake::Handshake;
use crate::ns::Namespace;
use crate::operators::{BroadcastOperators, ConfOperators};
use crate::packet::{Packet, PacketData};
use crate::parser::{Frame, Parser};
use crate::sid::Sid;
use crate::transport::{Connection, ReadyState, WriteOptions};

/// Event names that never travel on the wire as EVENT packets. Emitting one
/// raises it on the local listener registry instead, and inbound EVENT
/// packets carrying one are dropped.
pub const RESERVED_EVENTS: &[&str] = &[
    "error",
    "connect",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub(crate) fn is_reserved(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// All the possible reasons for a [`Socket`] to be disconnected from its
/// namespace.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The client gracefully closed the connection.
    TransportClose,

    /// The connection was abruptly closed.
    TransportError,

    /// The client sent frames that could not be decoded.
    PacketParsingError,

    /// The client sent a DISCONNECT packet for this namespace.
    ClientNamespaceDisconnect,

    /// The socket was disconnected from the namespace on the server side.
    ServerNamespaceDisconnect,

    /// The whole server is being closed.
    ClosingServer,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DisconnectReason::*;
        let str: &'static str = match self {
            TransportClose => "transport close",
            TransportError => "transport error",
            PacketParsingError => "parse error",
            ClientNamespaceDisconnect => "client namespace disconnect",
            ServerNamespaceDisconnect => "server namespace disconnect",
            ClosingServer => "server shutting down",
        };
        f.write_str(str)
    }
}

/// A logical endpoint in one namespace over one client connection.
///
/// Sockets are jointly referenced by their [`Namespace`] and their
/// [`Client`]; both references are dropped on close.
pub struct Socket<A: Adapter = InMemoryAdapter> {
    /// The socket id. Also the name of the room the socket is implicitly a
    /// member of while connected.
    pub id: Sid,
    /// Snapshot of the request that established the connection, merged
    /// with the query of the namespace connection.
    pub handshake: Handshake,
    pub(crate) ns: Arc<Namespace<A>>,
    pub(crate) client: Weak<Client<A>>,
    weak_self: Weak<Socket<A>>,
    conn: Arc<dyn Connection>,
    parser: Parser,
    config: ServerConfig,
    connected: AtomicBool,
    message_handlers: RwLock<HashMap<Cow<'static, str>, BoxedMessageHandler<A>>>,
    event_middlewares: RwLock<Vec<BoxedEventMiddleware<A>>>,
    disconnecting_handler: Mutex<Option<LifecycleHandler<A>>>,
    disconnect_handler: Mutex<Option<LifecycleHandler<A>>>,
    error_handler: Mutex<Option<ErrorHandler<A>>>,
    pub(crate) acks: Mutex<HashMap<i64, oneshot::Sender<AckResult<Value>>>>,
}

impl<A: Adapter> Socket<A> {
    pub(crate) fn new(
        ns: Arc<Namespace<A>>,
        client: &Arc<Client<A>>,
        query: &HashMap<String, String>,
    ) -> Arc<Self> {
        let conn = client.conn();
        let id = Sid::new(&ns.path, conn.id());
        let handshake = Handshake::new(client.meta(), query);
        Arc::new_cyclic(|weak_self| Self {
            id,
            handshake,
            ns,
            client: Arc::downgrade(client),
            weak_self: weak_self.clone(),
            conn,
            parser: client.parser(),
            config: client.config().clone(),
            connected: AtomicBool::new(false),
            message_handlers: RwLock::new(HashMap::new()),
            event_middlewares: RwLock::new(Vec::new()),
            disconnecting_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            acks: Mutex::new(HashMap::new()),
        })
    }

    /// Register a handler for the given event.
    ///
    /// The payload is deserialized to the handler's `Param` type; if that
    /// fails the handler is not called. Handlers of events for which the
    /// client requested an acknowledgement receive an armed
    /// [`AckSender`].
    pub fn on<C, F, Param>(&self, event: impl Into<Cow<'static, str>>, callback: C)
    where
        C: Fn(Arc<Socket<A>>, Param, Vec<Bytes>, AckSender<A>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
        Param: DeserializeOwned + Send + Sync + 'static,
    {
        let handler = move |s: Arc<Socket<A>>,
                            p: Param,
                            b: Vec<Bytes>,
                            a: AckSender<A>|
              -> BoxFuture<'static, ()> { Box::pin(callback(s, p, b, a)) };
        self.message_handlers
            .write()
            .unwrap()
            .insert(event.into(), MessageHandler::boxed(handler));
    }

    /// Append an event-time middleware, run in registration order before
    /// any inbound event reaches handlers. An error sends an ERROR packet
    /// to the client and suppresses the event.
    pub fn use_<C, F, E>(&self, middleware: C)
    where
        C: Fn(Arc<Socket<A>>, Cow<'static, str>, Value) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mw: BoxedEventMiddleware<A> =
            Arc::new(move |s, event, data| -> BoxFuture<'static, MiddlewareRes> {
                let fut = middleware(s, event, data);
                Box::pin(
                    async move { fut.await.map_err(|e| Box::new(e) as Box<dyn Display + Send>) },
                )
            });
        self.event_middlewares.write().unwrap().push(mw);
    }

    /// Register the listener called when the socket starts disconnecting:
    /// room membership is still queryable at that point.
    pub fn on_disconnecting<C>(&self, callback: C)
    where
        C: FnOnce(Arc<Socket<A>>, DisconnectReason) + Send + 'static,
    {
        self.disconnecting_handler
            .lock()
            .unwrap()
            .replace(Box::new(callback));
    }

    /// Register the listener called once the socket left its rooms and was
    /// removed from its namespace and client.
    pub fn on_disconnect<C>(&self, callback: C)
    where
        C: FnOnce(Arc<Socket<A>>, DisconnectReason) + Send + 'static,
    {
        self.disconnect_handler
            .lock()
            .unwrap()
            .replace(Box::new(callback));
    }

    /// Register the listener for namespace-scoped errors reported to this
    /// socket. Without one, errors are logged so they are not lost.
    pub fn on_error<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>, String) + Send + Sync + 'static,
    {
        self.error_handler.lock().unwrap().replace(Arc::new(callback));
    }

    /// Emit an event to the client.
    ///
    /// Array-like data (tuples, vectors, arrays) is flattened into multiple
    /// arguments; anything else becomes the single argument.
    /// Reserved event names are raised on the local listener registry
    /// instead of the wire.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: &T,
    ) -> Result<(), SendError> {
        ConfOperators::new(self).emit(event, data)
    }

    /// Emit an event and wait for the client acknowledgement.
    ///
    /// The returned [`AckStream`] resolves to the typed response or to an
    /// [`AckError`](crate::errors::AckError) on timeout.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        &self,
        event: impl Into<Cow<'static, str>>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        ConfOperators::new(self).emit_with_ack(event, data)
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(&self, data: &T) -> Result<(), SendError> {
        self.emit("message", data)
    }

    /// Alias for [`send`](Self::send).
    pub fn write<T: ?Sized + Serialize>(&self, data: &T) -> Result<(), SendError> {
        self.send(data)
    }

    // Room actions

    /// Add the socket to the given room(s).
    pub fn join(&self, rooms: impl RoomParam) {
        self.ns.adapter.add_all(self.id.clone(), rooms)
    }

    /// Remove the socket from the given room(s).
    pub fn leave(&self, rooms: impl RoomParam) {
        self.ns.adapter.del(&self.id, rooms)
    }

    /// Remove the socket from every room it belongs to.
    pub fn leave_all(&self) {
        self.ns.adapter.del_all(&self.id)
    }

    /// All rooms this socket belongs to.
    pub fn rooms(&self) -> HashSet<Room> {
        self.ns.adapter.socket_rooms(&self.id)
    }

    // Broadcast operators

    /// Select every socket of the given room(s), excluding this one.
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::from_sock(self.ns.clone(), self.id.clone()).to(rooms)
    }

    /// Alias for [`to`](Self::to).
    pub fn within(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.to(rooms)
    }

    /// Filter out every socket of the given room(s) from the broadcast.
    pub fn except(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::from_sock(self.ns.clone(), self.id.clone()).except(rooms)
    }

    /// Broadcast to every socket of the namespace except this one.
    pub fn broadcast(&self) -> BroadcastOperators<A> {
        BroadcastOperators::from_sock(self.ns.clone(), self.id.clone()).broadcast()
    }

    /// Keep the broadcast on this node, never forwarding it to the rest of
    /// the cluster.
    pub fn local(&self) -> BroadcastOperators<A> {
        BroadcastOperators::from_sock(self.ns.clone(), self.id.clone()).local()
    }

    /// Drop the next emit instead of queueing it when the transport is not
    /// writable.
    pub fn volatile(&self) -> ConfOperators<'_, A> {
        ConfOperators::new(self).volatile()
    }

    /// Allow (or forbid) the transport to compress the next emit.
    pub fn compress(&self, compress: bool) -> ConfOperators<'_, A> {
        ConfOperators::new(self).compress(compress)
    }

    /// Force or suppress binary framing for the next emit, overriding the
    /// attachment-based detection.
    pub fn binary(&self, binary: bool) -> ConfOperators<'_, A> {
        ConfOperators::new(self).binary(binary)
    }

    /// Attach binary payloads to the next emit.
    pub fn bin(&self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> ConfOperators<'_, A> {
        ConfOperators::new(self).bin(binary)
    }

    /// Set a custom acknowledgement timeout for the next emit.
    pub fn timeout(&self, timeout: Duration) -> ConfOperators<'_, A> {
        ConfOperators::new(self).timeout(timeout)
    }

    /// Whether the socket is currently connected to its namespace.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the socket was disconnected from its namespace.
    pub fn disconnected(&self) -> bool {
        !self.connected()
    }

    /// The namespace path of this socket.
    pub fn ns(&self) -> &str {
        &self.ns.path
    }

    /// Disconnect the socket from its namespace: notify the peer with a
    /// DISCONNECT packet and run the local close sequence.
    pub fn disconnect(self: Arc<Self>) -> Result<(), SocketError> {
        // The peer notification is best-effort: a gone transport is about
        // to tear everything down anyway.
        self.send_packet(Packet::disconnect(self.ns.path.clone())).ok();
        self.close(DisconnectReason::ServerNamespaceDisconnect);
        Ok(())
    }

    /// Disconnect the whole client: every socket of the underlying
    /// connection is closed and the connection itself is shut down.
    pub fn disconnect_all(self: Arc<Self>) {
        if let Some(client) = self.client.upgrade() {
            client.disconnect();
        }
    }

    // ===== internal plumbing =====

    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn conn_writable(&self) -> bool {
        self.conn.writable()
    }

    pub(crate) fn send_packet(&self, packet: Packet) -> Result<(), SocketError> {
        self.send_with_opts(packet, WriteOptions::default())
    }

    pub(crate) fn send_with_opts(
        &self,
        packet: Packet,
        opts: WriteOptions,
    ) -> Result<(), SocketError> {
        if self.conn.ready_state() != ReadyState::Open {
            return Err(SocketError::Closed);
        }
        for frame in self.parser.encode(packet) {
            self.conn.write(frame, opts);
        }
        Ok(())
    }

    /// Write pre-encoded frames. Dead transports are a silent no-op so that
    /// broadcasts never fail on sockets that raced a disconnect.
    pub(crate) fn send_raw(&self, frames: Vec<Frame>, opts: WriteOptions) {
        if self.conn.ready_state() != ReadyState::Open {
            return;
        }
        for frame in frames {
            self.conn.write(frame, opts);
        }
    }

    /// Raise an event on the local listener registry, never touching the
    /// adapter or the wire.
    pub(crate) fn dispatch_local(&self, event: Cow<'static, str>, data: Value, bins: Vec<Bytes>) {
        let me = match self.arc() {
            Some(me) => me,
            None => return,
        };
        if let Some(handler) = self.message_handlers.read().unwrap().get(&event) {
            if let Err(_e) = handler.call(me, data, bins, None) {
                tracing::debug!(sid = %self.id, %event, "local listener payload mismatch: {_e}");
            }
        }
    }

    /// Called by the namespace once the connection was approved: register
    /// as connected, auto-join the room named by the own id, then confirm
    /// the connection to the peer unless the CONNECT reply was already
    /// piggy-backed on the transport handshake.
    pub(crate) fn onconnect(&self) -> Result<(), SocketError> {
        let me = match self.arc() {
            Some(me) => me,
            None => return Err(SocketError::Closed),
        };
        self.connected.store(true, Ordering::SeqCst);
        self.ns.insert_connected(me);
        self.ns.adapter.add_all(self.id.clone(), self.id.clone());
        if !self.ns.connect_elided() {
            self.send_packet(Packet::connect(self.ns.path.clone()))?;
        }
        Ok(())
    }

    /// Close the socket. Idempotent; the first call wins.
    ///
    /// Order: `disconnecting` listener (rooms still visible), leave all
    /// rooms, removal from namespace and client, `disconnect` listener.
    pub(crate) fn close(&self, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::trace!(sid = %self.id, ns = %self.ns.path, %reason, "closing socket");

        let me = self.arc();
        let disconnecting = self.disconnecting_handler.lock().unwrap().take();
        if let (Some(me), Some(handler)) = (me.clone(), disconnecting) {
            handler(me, reason);
        }

        self.ns.adapter.del_all(&self.id);
        self.ns.remove_socket(&self.id);
        if let Some(client) = self.client.upgrade() {
            client.remove_socket(&self.id, &self.ns.path);
        }

        let disconnect = self.disconnect_handler.lock().unwrap().take();
        if let (Some(me), Some(handler)) = (me, disconnect) {
            handler(me, reason);
        }
    }

    /// Handle one decoded inbound packet addressed to this socket.
    pub(crate) async fn recv(&self, packet: PacketData) {
        match packet {
            PacketData::Event(event, data, ack) => {
                self.recv_event(event, data, Vec::new(), ack).await
            }
            PacketData::BinaryEvent(event, payload, ack) => {
                self.recv_event(event, payload.data, payload.bin, ack).await
            }
            PacketData::EventAck(data, ack) => self.recv_ack(data, Vec::new(), ack),
            PacketData::BinaryAck(payload, ack) => self.recv_ack(payload.data, payload.bin, ack),
            PacketData::Disconnect => self.close(DisconnectReason::ClientNamespaceDisconnect),
            PacketData::Error(message) => self.notify_error(message),
            // CONNECT packets are routed by the client before sockets exist.
            PacketData::Connect => {}
        }
    }

    async fn recv_event(
        &self,
        event: Cow<'static, str>,
        data: Value,
        bins: Vec<Bytes>,
        ack_id: Option<i64>,
    ) {
        if is_reserved(&event) {
            tracing::debug!(sid = %self.id, %event, "reserved event name on the wire, dropping");
            return;
        }
        let me = match self.arc() {
            Some(me) => me,
            None => return,
        };

        // Snapshot so middlewares installed mid-run only affect later
        // events.
        let middlewares = self.event_middlewares.read().unwrap().clone();
        for mw in middlewares {
            if let Err(e) = mw(me.clone(), event.clone(), data.clone()).await {
                tracing::debug!(sid = %self.id, %event, "event middleware rejected: {e}");
                self.send_packet(Packet::error(self.ns.path.clone(), e.to_string()))
                    .ok();
                return;
            }
        }

        if let Some(handler) = self.message_handlers.read().unwrap().get(&event) {
            if let Err(_e) = handler.call(me, data, bins, ack_id) {
                tracing::debug!(sid = %self.id, %event, "handler payload mismatch: {_e}");
            }
        }
    }

    fn recv_ack(&self, data: Value, binary: Vec<Bytes>, ack: i64) {
        if let Some(tx) = self.acks.lock().unwrap().remove(&ack) {
            tx.send(Ok(crate::ack::AckResponse { data, binary })).ok();
        } else {
            // Unknown or already-consumed id: duplicate acks land here too.
            tracing::debug!(sid = %self.id, ack, "ack with unknown id, ignoring");
        }
    }

    /// Raise a namespace-scoped error on this socket. Without a registered
    /// listener the error goes to the log, so it is never silently lost.
    pub(crate) fn notify_error(&self, message: String) {
        let handler = self.error_handler.lock().unwrap().clone();
        match (handler, self.arc()) {
            (Some(handler), Some(me)) => handler(me, message),
            _ => tracing::error!(sid = %self.id, ns = %self.ns.path, "socket error: {message}"),
        }
    }
}

impl<A: Adapter> Debug for Socket<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("ns", &self.ns.path)
            .field("connected", &self.connected())
            .finish()
    }
}

impl<A: Adapter> PartialEq for Socket<A> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
impl Socket<InMemoryAdapter> {
    pub(crate) fn new_dummy(sid: Sid, ns: Arc<Namespace<InMemoryAdapter>>) -> Arc<Self> {
        let conn = Arc::new(crate::test_util::StubConnection::new(sid.as_str()));
        Arc::new_cyclic(|weak_self| Self {
            id: sid,
            handshake: Handshake::new(&Default::default(), &HashMap::new()),
            ns,
            client: Weak::new(),
            weak_self: weak_self.clone(),
            conn,
            parser: Parser::default(),
            config: ServerConfig::default(),
            connected: AtomicBool::new(true),
            message_handlers: RwLock::new(HashMap::new()),
            event_middlewares: RwLock::new(Vec::new()),
            disconnecting_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            acks: Mutex::new(HashMap::new()),
        })
    }
}
