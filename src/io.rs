//! The [`Server`] is the root of the system: it owns the namespace
//! registries and the clients, wires transport connections to [`Client`]s
//! and exposes the public surface delegated to the default namespace.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use regex::Regex;
use serde::Serialize;

use crate::adapter::{Adapter, InMemoryAdapter, RoomParam};
use crate::client::Client;
use crate::config::ServerConfig;
use crate::errors::BroadcastError;
use crate::ns::{Namespace, NsMatcher, ParentNamespace};
use crate::operators::BroadcastOperators;
use crate::packet::Packet;
use crate::parser::Parser;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Connection, ConnectionMeta, TransportServer};

pub(crate) struct ServerInner<A: Adapter = InMemoryAdapter> {
    config: ServerConfig,
    parser: Parser,
    weak_self: Weak<ServerInner<A>>,
    nsps: RwLock<HashMap<String, Arc<Namespace<A>>>>,
    /// Parent namespaces, tried in registration order.
    parent_nsps: RwLock<Vec<Arc<ParentNamespace<A>>>>,
    parent_counter: AtomicUsize,
    clients: RwLock<HashMap<String, Arc<Client<A>>>>,
    transport: RwLock<Option<Arc<dyn TransportServer>>>,
}

impl<A: Adapter> ServerInner<A> {
    pub(crate) fn parser(&self) -> Parser {
        self.parser
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn get_ns(&self, name: &str) -> Option<Arc<Namespace<A>>> {
        self.nsps.read().unwrap().get(name).cloned()
    }

    /// Return the namespace for `name`, creating it on first use. Names
    /// are canonicalized to begin with `/`.
    pub(crate) fn of_path(&self, name: &str) -> Arc<Namespace<A>> {
        let path = canonical_path(name);
        if let Some(ns) = self.nsps.read().unwrap().get(&path) {
            return ns.clone();
        }
        let mut nsps = self.nsps.write().unwrap();
        if let Some(ns) = nsps.get(&path) {
            return ns.clone();
        }
        tracing::debug!(ns = %path, "creating namespace");
        let ns = Namespace::new(path.clone(), self.weak_self.clone(), self.parser);
        nsps.insert(path, ns.clone());
        ns
    }

    /// Register a dynamically created child namespace so later CONNECTs to
    /// the same name bypass the matchers.
    pub(crate) fn register_ns(&self, ns: Arc<Namespace<A>>) {
        self.nsps.write().unwrap().insert(ns.path.clone(), ns);
    }

    /// First parent namespace accepting the name, in registration order.
    pub(crate) fn match_parent(
        &self,
        name: &str,
        query: &HashMap<String, String>,
    ) -> Option<Arc<ParentNamespace<A>>> {
        self.parent_nsps
            .read()
            .unwrap()
            .iter()
            .find(|parent| parent.matches(name, query))
            .cloned()
    }

    pub(crate) fn remove_client(&self, conn_id: &str) {
        self.clients.write().unwrap().remove(conn_id);
    }

    /// Cancel the piggy-backed CONNECT optimization. Called when the first
    /// middleware lands on the default namespace.
    pub(crate) fn clear_initial_packet(&self) {
        if let Some(transport) = self.transport.read().unwrap().as_ref() {
            transport.set_initial_packet(None);
        }
        if let Some(default) = self.get_ns("/") {
            default.set_connect_elided(false);
        }
    }
}

/// The root handle. Cheap to clone and shareable everywhere; several
/// independent instances may coexist in one process, each with its own
/// registries.
pub struct Server<A: Adapter = InMemoryAdapter>(Arc<ServerInner<A>>);

impl Server<InMemoryAdapter> {
    /// A server with the default configuration and the in-memory adapter.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }
}

impl Default for Server<InMemoryAdapter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Adapter> Server<A> {
    /// A server with the given configuration. The adapter type is chosen
    /// through the generic parameter.
    pub fn with_config(config: ServerConfig) -> Self {
        let inner = Arc::new_cyclic(|weak_self| ServerInner {
            config,
            parser: Parser::default(),
            weak_self: weak_self.clone(),
            nsps: RwLock::new(HashMap::new()),
            parent_nsps: RwLock::new(Vec::new()),
            parent_counter: AtomicUsize::new(0),
            clients: RwLock::new(HashMap::new()),
            transport: RwLock::new(None),
        });
        // The default namespace exists from the start.
        inner.of_path("/");
        Self(inner)
    }

    pub fn config(&self) -> &ServerConfig {
        self.0.config()
    }

    /// The namespace registered under `name`, created on first use. Names
    /// are canonicalized to begin with `/`.
    pub fn of(&self, name: impl AsRef<str>) -> Arc<Namespace<A>> {
        self.0.of_path(name.as_ref())
    }

    /// A namespace registered under `name`, if it exists.
    pub fn get_ns(&self, name: impl AsRef<str>) -> Option<Arc<Namespace<A>>> {
        self.0.get_ns(&canonical_path(name.as_ref()))
    }

    /// Register a dynamic namespace template accepting every name matching
    /// the regex.
    pub fn of_regex(&self, regex: Regex) -> Arc<ParentNamespace<A>> {
        self.add_parent(NsMatcher::Regex(regex))
    }

    /// Register a dynamic namespace template accepting every name for
    /// which the predicate, given the name and the connection query,
    /// returns true.
    pub fn of_fn<P>(&self, predicate: P) -> Arc<ParentNamespace<A>>
    where
        P: Fn(&str, &HashMap<String, String>) -> bool + Send + Sync + 'static,
    {
        self.add_parent(NsMatcher::Predicate(Box::new(predicate)))
    }

    fn add_parent(&self, matcher: NsMatcher) -> Arc<ParentNamespace<A>> {
        let name = format!("/_{}", self.0.parent_counter.fetch_add(1, Ordering::SeqCst));
        let parent = ParentNamespace::new(name, matcher, Arc::downgrade(&self.0));
        self.0.parent_nsps.write().unwrap().push(parent.clone());
        parent
    }

    /// Append a connect-time middleware to the default namespace.
    pub fn use_<C, F, E>(&self, middleware: C)
    where
        C: Fn(Arc<Socket<A>>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.of("/").use_(middleware);
    }

    /// Register a connect listener on the default namespace.
    pub fn on_connect<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>) + Send + Sync + 'static,
    {
        self.of("/").on_connect(callback);
    }

    /// Target all sockets of the given room(s) of the default namespace.
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.of("/").to(rooms)
    }

    /// Alias for [`to`](Self::to).
    pub fn within(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.of("/").within(rooms)
    }

    /// Exclude all sockets of the given room(s) of the default namespace.
    pub fn except(&self, rooms: impl RoomParam) -> BroadcastOperators<A> {
        self.of("/").except(rooms)
    }

    /// Emit an event to every socket of the default namespace.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl Into<std::borrow::Cow<'static, str>>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        self.of("/").emit(event, data)
    }

    /// Alias for `emit("message", data)`.
    pub fn send<T: ?Sized + Serialize>(&self, data: &T) -> Result<(), BroadcastError> {
        self.of("/").send(data)
    }

    /// Attach the transport server.
    ///
    /// If the default namespace has no middleware, a pre-encoded CONNECT
    /// packet is handed to the transport so the first handshake response
    /// already carries the namespace confirmation, saving one round trip.
    /// Installing a middleware on `/` later cancels this.
    pub fn attach(&self, transport: Arc<dyn TransportServer>) {
        let default = self.of("/");
        if default.middleware_count() == 0 {
            let frames = self.0.parser.encode(Packet::connect("/"));
            transport.set_initial_packet(Some(frames));
            default.set_connect_elided(true);
        }
        *self.0.transport.write().unwrap() = Some(transport);
    }

    /// Accept a new transport connection: creates the [`Client`] and
    /// starts its implicit default-namespace connection. The transport
    /// driver keeps the returned handle to forward connection events.
    pub fn on_connection(&self, conn: Arc<dyn Connection>, meta: ConnectionMeta) -> Arc<Client<A>> {
        tracing::debug!(conn = conn.id(), "transport connection established");
        let client = Client::new(conn, meta, &self.0);
        self.0
            .clients
            .write()
            .unwrap()
            .insert(client.id().to_string(), client.clone());
        client.connect("/", HashMap::new());
        client
    }

    /// Close every client connection, the namespaces' adapters and the
    /// attached transport.
    pub async fn close(&self) {
        tracing::debug!("closing server");
        let clients: Vec<_> = {
            let mut map = self.0.clients.write().unwrap();
            map.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.conn().close();
            client.on_close(DisconnectReason::ClosingServer);
        }
        let nsps: Vec<_> = self.0.nsps.read().unwrap().values().cloned().collect();
        for ns in nsps {
            ns.close(DisconnectReason::ClosingServer);
        }
        if let Some(transport) = self.0.transport.write().unwrap().take() {
            transport.close();
        }
    }
}

impl<A: Adapter> Clone for Server<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Adapter> Debug for Server<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("nsps", &self.0.nsps.read().unwrap().len())
            .field("clients", &self.0.clients.read().unwrap().len())
            .finish()
    }
}

fn canonical_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
