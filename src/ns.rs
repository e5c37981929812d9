//! Namespaces scope sockets, rooms and connect-time middleware under one
//! path. [`ParentNamespace`] is the dynamic variant: a template registered
//! under a matcher, spawning concrete child namespaces on demand.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;

use crate::adapter::{
    Adapter, BroadcastFlags, BroadcastOptions, InMemoryAdapter, Room, RoomParam,
};
use crate::client::Client;
use crate::errors::{BroadcastError, ConnectFail};
use crate::handler::{BoxedConnectMiddleware, ConnectListener, MiddlewareRes};
use crate::io::ServerInner;
use crate::operators::BroadcastOperators;
use crate::packet::Packet;
use crate::parser::Parser;
use crate::sid::Sid;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::ReadyState;

/// A named communication scope multiplexed over client connections.
///
/// Holds the sockets created under its path, the connect-time middleware
/// pipeline, the connect listeners and one [`Adapter`] instance for room
/// bookkeeping and fan-out.
pub struct Namespace<A: Adapter = InMemoryAdapter> {
    pub path: String,
    pub(crate) adapter: Arc<A>,
    parser: Parser,
    server: Weak<ServerInner<A>>,
    weak_self: Weak<Namespace<A>>,
    /// Every socket constructed for this namespace, approved or not.
    sockets: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    /// Approved sockets, visible to the adapter.
    connected: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    middlewares: RwLock<Vec<BoxedConnectMiddleware<A>>>,
    connect_listeners: RwLock<Vec<ConnectListener<A>>>,
    /// Packet id allocator: ids are strictly monotonic per namespace.
    ack_counter: AtomicI64,
    /// Whether the CONNECT reply for this namespace is piggy-backed on the
    /// transport handshake and must not be re-sent. Only ever true for the
    /// default namespace.
    connect_elided: AtomicBool,
}

impl<A: Adapter> Namespace<A> {
    pub(crate) fn new(path: String, server: Weak<ServerInner<A>>, parser: Parser) -> Arc<Self> {
        let ns = Arc::new_cyclic(|weak_self| Self {
            path,
            adapter: Arc::new(A::new(weak_self.clone())),
            parser,
            server,
            weak_self: weak_self.clone(),
            sockets: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            connect_listeners: RwLock::new(Vec::new()),
            ack_counter: AtomicI64::new(0),
            connect_elided: AtomicBool::new(false),
        });
        ns.adapter.init();
        ns
    }

    /// Append a connect-time middleware of the form
    /// `async fn(socket) -> Result<(), E>`. An error rejects the
    /// connection: the client receives an ERROR packet carrying the message
    /// and no socket is registered.
    ///
    /// Installing a middleware on the default namespace cancels the
    /// piggy-backed CONNECT optimization, since the connection may now be
    /// rejected.
    pub fn use_<C, F, E>(&self, middleware: C)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mw: BoxedConnectMiddleware<A> =
            Arc::new(move |s| -> BoxFuture<'static, MiddlewareRes> {
                let fut = middleware(s);
                Box::pin(async move {
                    fut.await
                        .map_err(|e| Box::new(e) as Box<dyn Display + Send>)
                })
            });
        self.middlewares.write().unwrap().push(mw);

        if self.path == "/" {
            self.connect_elided.store(false, Ordering::SeqCst);
            if let Some(server) = self.server.upgrade() {
                server.clear_initial_packet();
            }
        }
    }

    /// Register a listener invoked with every socket accepted into this
    /// namespace.
    pub fn on_connect<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>) + Send + Sync + 'static,
    {
        self.connect_listeners.write().unwrap().push(Arc::new(callback));
    }

    // Broadcast surface

    /// Target all sockets of the given room(s).
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).to(rooms)
    }

    /// Alias for [`to`](Self::to).
    pub fn within(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.to(rooms)
    }

    /// Exclude all sockets of the given room(s).
    pub fn except(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).except(rooms)
    }

    /// Keep the broadcast on this node.
    pub fn local(&self) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).local()
    }

    /// Skip sockets whose transport is not currently writable.
    pub fn volatile(&self) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).volatile()
    }

    /// Allow (or forbid) the transport to compress the written frames.
    pub fn compress(&self, compress: bool) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).compress(compress)
    }

    /// Force or suppress binary framing for the broadcast.
    pub fn binary(&self, binary: bool) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).binary(binary)
    }

    /// Attach binary payloads to the broadcast.
    pub fn bin(
        &self,
        binary: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> BroadcastOperators<A> {
        BroadcastOperators::new(self.arc()).bin(binary)
    }

    /// Emit an event to every socket of the namespace.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl Into<std::borrow::Cow<'static, str>>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        BroadcastOperators::new(self.arc()).emit(event, data)
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(&self, data: &T) -> Result<(), BroadcastError> {
        BroadcastOperators::new(self.arc()).send(data)
    }

    /// The socket ids connected to this namespace, across the whole
    /// cluster for distributed adapters.
    pub async fn all_sockets(&self) -> HashSet<Sid> {
        self.adapter.sockets(Vec::<Room>::new()).await
    }

    /// The locally connected sockets of this namespace.
    pub fn get_sockets(&self) -> Vec<Arc<Socket<A>>> {
        self.connected.read().unwrap().values().cloned().collect()
    }

    /// A locally connected socket by id.
    pub fn get_socket(&self, sid: &Sid) -> Option<Arc<Socket<A>>> {
        self.connected.read().unwrap().get(sid).cloned()
    }

    pub fn has(&self, sid: &Sid) -> bool {
        self.connected.read().unwrap().contains_key(sid)
    }

    // ===== internal plumbing =====

    /// Connect a client to this namespace.
    ///
    /// The middleware chain is a snapshot taken at entry; its completion is
    /// deferred one scheduling tick so that callers observing the `connect`
    /// event always see post-registration state. If the transport went away
    /// in the meantime the connection is abandoned silently; a middleware
    /// error is answered with an ERROR packet and the socket is never
    /// registered.
    pub(crate) async fn add(
        &self,
        client: &Arc<Client<A>>,
        query: &HashMap<String, String>,
    ) -> Result<Arc<Socket<A>>, ConnectFail> {
        let socket = Socket::new(self.arc(), client, query);
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket.clone());

        let middlewares = self.middlewares.read().unwrap().clone();
        let mut rejection = None;
        for mw in middlewares {
            if let Err(e) = mw(socket.clone()).await {
                rejection = Some(e.to_string());
                break;
            }
        }

        tokio::task::yield_now().await;

        if client.conn().ready_state() != ReadyState::Open {
            self.remove_socket(&socket.id);
            return Err(ConnectFail);
        }

        if let Some(message) = rejection {
            tracing::trace!(ns = %self.path, sid = %socket.id, "connect middleware rejected: {message}");
            socket
                .send_packet(Packet::error(self.path.clone(), message))
                .ok();
            self.remove_socket(&socket.id);
            return Err(ConnectFail);
        }

        if socket.onconnect().is_err() {
            self.remove_socket(&socket.id);
            return Err(ConnectFail);
        }
        client.register_socket(&socket);

        let listeners = self.connect_listeners.read().unwrap().clone();
        for listener in listeners {
            listener(socket.clone());
        }
        Ok(socket)
    }

    pub(crate) fn insert_connected(&self, socket: Arc<Socket<A>>) {
        self.connected
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket);
    }

    /// Remove a socket from the namespace maps. Idempotent.
    pub(crate) fn remove_socket(&self, sid: &Sid) {
        self.sockets.write().unwrap().remove(sid);
        self.connected.write().unwrap().remove(sid);
    }

    /// Next packet id expecting a response. Strictly monotonic.
    pub(crate) fn next_ack_id(&self) -> i64 {
        self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn connect_elided(&self) -> bool {
        self.connect_elided.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_elided(&self, elided: bool) {
        self.connect_elided.store(elided, Ordering::SeqCst);
    }

    pub(crate) fn middleware_count(&self) -> usize {
        self.middlewares.read().unwrap().len()
    }

    pub(crate) fn parser(&self) -> Parser {
        self.parser
    }

    fn arc(&self) -> Arc<Self> {
        // A method call implies an outstanding strong reference.
        self.weak_self.upgrade().unwrap()
    }

    pub(crate) fn close(&self, reason: DisconnectReason) {
        let sockets = self.get_sockets();
        tracing::debug!(ns = %self.path, "closing {} sockets in namespace", sockets.len());
        for socket in sockets {
            socket.close(reason);
        }
        self.adapter.close();
    }
}

impl<A: Adapter> Debug for Namespace<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.sockets.read().unwrap().len())
            .field("connected", &self.connected.read().unwrap().len())
            .finish()
    }
}

/// How a [`ParentNamespace`] decides whether it accepts a namespace name.
pub enum NsMatcher {
    /// Accepts names matching the regex.
    Regex(Regex),
    /// Accepts names for which the predicate, given the name and the
    /// connection query, returns true.
    Predicate(Box<dyn Fn(&str, &HashMap<String, String>) -> bool + Send + Sync>),
}

impl NsMatcher {
    fn matches(&self, name: &str, query: &HashMap<String, String>) -> bool {
        match self {
            NsMatcher::Regex(re) => re.is_match(name),
            NsMatcher::Predicate(predicate) => predicate(name, query),
        }
    }
}

impl Debug for NsMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NsMatcher::Regex(re) => f.debug_tuple("Regex").field(re).finish(),
            NsMatcher::Predicate(_) => f.debug_tuple("Predicate").finish(),
        }
    }
}

/// A namespace template registered under a matcher. Children are created
/// lazily when a CONNECT names a matching namespace; each child copies the
/// template's middleware snapshot and connect listeners and registers
/// itself in the server map, so later CONNECTs to the same name are static
/// hits.
pub struct ParentNamespace<A: Adapter = InMemoryAdapter> {
    /// Synthetic name of the template (`"/_<counter>"`).
    pub name: String,
    matcher: NsMatcher,
    server: Weak<ServerInner<A>>,
    middlewares: RwLock<Vec<BoxedConnectMiddleware<A>>>,
    connect_listeners: RwLock<Vec<ConnectListener<A>>>,
    children: RwLock<HashMap<String, Arc<Namespace<A>>>>,
}

impl<A: Adapter> ParentNamespace<A> {
    pub(crate) fn new(name: String, matcher: NsMatcher, server: Weak<ServerInner<A>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            matcher,
            server,
            middlewares: RwLock::new(Vec::new()),
            connect_listeners: RwLock::new(Vec::new()),
            children: RwLock::new(HashMap::new()),
        })
    }

    /// Append a connect-time middleware to the template. Only children
    /// created afterwards inherit it.
    pub fn use_<C, F, E>(&self, middleware: C)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mw: BoxedConnectMiddleware<A> =
            Arc::new(move |s| -> BoxFuture<'static, MiddlewareRes> {
                let fut = middleware(s);
                Box::pin(async move {
                    fut.await
                        .map_err(|e| Box::new(e) as Box<dyn Display + Send>)
                })
            });
        self.middlewares.write().unwrap().push(mw);
    }

    /// Register a connect listener rebound to every child created
    /// afterwards.
    pub fn on_connect<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>) + Send + Sync + 'static,
    {
        self.connect_listeners.write().unwrap().push(Arc::new(callback));
    }

    pub(crate) fn matches(&self, name: &str, query: &HashMap<String, String>) -> bool {
        self.matcher.matches(name, query)
    }

    /// Instantiate the concrete namespace for an accepted name.
    pub(crate) fn create_child(&self, name: &str) -> Option<Arc<Namespace<A>>> {
        let server = self.server.upgrade()?;
        let ns = Namespace::new(name.to_string(), self.server.clone(), server.parser());
        *ns.middlewares.write().unwrap() = self.middlewares.read().unwrap().clone();
        *ns.connect_listeners.write().unwrap() = self.connect_listeners.read().unwrap().clone();
        server.register_ns(ns.clone());
        self.children
            .write()
            .unwrap()
            .insert(name.to_string(), ns.clone());
        tracing::debug!(parent = %self.name, child = %ns.path, "created child namespace");
        Some(ns)
    }

    /// The children instantiated so far.
    pub fn children(&self) -> Vec<Arc<Namespace<A>>> {
        self.children.read().unwrap().values().cloned().collect()
    }

    /// Target all sockets of the given room(s), in every child.
    pub fn to(&self, rooms: impl RoomParam) -> ParentBroadcast<A> {
        self.operators().to(rooms)
    }

    /// Exclude all sockets of the given room(s), in every child.
    pub fn except(&self, rooms: impl RoomParam) -> ParentBroadcast<A> {
        self.operators().except(rooms)
    }

    /// Emit an event to every socket of every child namespace.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl Into<std::borrow::Cow<'static, str>>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        self.operators().emit(event, data)
    }

    fn operators(&self) -> ParentBroadcast<A> {
        ParentBroadcast {
            children: self.children(),
            rooms: Vec::new(),
            except_rooms: Vec::new(),
            flags: BroadcastFlags::default(),
            binary: Vec::new(),
            binary_flag: None,
        }
    }
}

impl<A: Adapter> Debug for ParentNamespace<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentNamespace")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("children", &self.children.read().unwrap().len())
            .finish()
    }
}

/// Template-level broadcast: the selection is built once and handed to each
/// child's adapter as explicit arguments.
pub struct ParentBroadcast<A: Adapter = InMemoryAdapter> {
    children: Vec<Arc<Namespace<A>>>,
    rooms: Vec<Room>,
    except_rooms: Vec<Room>,
    flags: BroadcastFlags,
    binary: Vec<Bytes>,
    binary_flag: Option<bool>,
}

impl<A: Adapter> ParentBroadcast<A> {
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.rooms.extend(rooms.into_room_iter());
        self
    }

    pub fn within(self, rooms: impl RoomParam) -> Self {
        self.to(rooms)
    }

    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.except_rooms.extend(rooms.into_room_iter());
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.flags.volatile = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.flags.compress = compress;
        self
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary_flag = Some(binary);
        self
    }

    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Emit through every child's adapter. The first failure is returned
    /// after every child was attempted.
    pub fn emit<T: ?Sized + Serialize>(
        self,
        event: impl Into<std::borrow::Cow<'static, str>>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        let event = event.into();
        let mut first_err = None;
        for child in self.children {
            let opts = BroadcastOptions {
                rooms: self.rooms.clone(),
                except_rooms: self.except_rooms.clone(),
                except: Default::default(),
                flags: self.flags.clone(),
                sender: None,
            };
            let operators = BroadcastOperators::from_parts(
                child,
                opts,
                self.binary.clone(),
                self.binary_flag,
            );
            if let Err(e) = operators.emit(event.clone(), data) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(self, data: &T) -> Result<(), BroadcastError> {
        self.emit("message", data)
    }
}

#[cfg(test)]
impl Namespace<InMemoryAdapter> {
    pub(crate) fn new_dummy<const S: usize>(sids: [Sid; S]) -> Arc<Self> {
        let ns = Namespace::new("/".to_string(), Weak::new(), Parser::default());
        for sid in sids {
            let socket = Socket::new_dummy(sid.clone(), ns.clone());
            ns.sockets
                .write()
                .unwrap()
                .insert(sid.clone(), socket.clone());
            ns.connected.write().unwrap().insert(sid, socket);
        }
        ns
    }
}
