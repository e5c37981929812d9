//! A [`Client`] owns one transport connection and demultiplexes decoded
//! packets among the sockets established over it (at most one per
//! namespace).

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::adapter::{Adapter, InMemoryAdapter};
use crate::config::ServerConfig;
use crate::errors::DecodeError;
use crate::handshake::parse_query;
use crate::io::ServerInner;
use crate::packet::{Packet, PacketData};
use crate::parser::{Decoder, Frame, Parser};
use crate::sid::Sid;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Connection, ConnectionMeta, ReadyState, WriteOptions};

/// Write options for a single client-bound packet.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PacketOptions {
    pub volatile: bool,
    pub compress: bool,
}

/// The per-connection multiplexer.
///
/// Born when the transport reports a connection; dies on transport
/// close/error or an explicit [`disconnect`](Client::disconnect). The
/// transport driver forwards the connection events to
/// [`on_data`](Client::on_data), [`on_error`](Client::on_error) and
/// [`on_close`](Client::on_close).
pub struct Client<A: Adapter = InMemoryAdapter> {
    conn: Arc<dyn Connection>,
    meta: ConnectionMeta,
    server: Weak<ServerInner<A>>,
    weak_self: Weak<Client<A>>,
    parser: Parser,
    config: ServerConfig,
    decoder: Mutex<Option<Decoder>>,
    /// Sockets by id, one per namespace.
    sockets: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    /// The same sockets, by namespace path.
    nsps: RwLock<HashMap<String, Arc<Socket<A>>>>,
    /// Non-default connects received before the default-namespace socket
    /// was established, replayed in order once it is.
    connect_buffer: Mutex<Vec<(String, HashMap<String, String>)>>,
    default_connected: AtomicBool,
    closed: AtomicBool,
}

impl<A: Adapter> Client<A> {
    pub(crate) fn new(
        conn: Arc<dyn Connection>,
        meta: ConnectionMeta,
        server: &Arc<ServerInner<A>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            parser: server.parser(),
            config: server.config().clone(),
            decoder: Mutex::new(Some(server.parser().decoder())),
            conn,
            meta,
            server: Arc::downgrade(server),
            weak_self: weak_self.clone(),
            sockets: RwLock::new(HashMap::new()),
            nsps: RwLock::new(HashMap::new()),
            connect_buffer: Mutex::new(Vec::new()),
            default_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The id of the underlying transport connection.
    pub fn id(&self) -> &str {
        self.conn.id()
    }

    /// The socket established for the given namespace, if any.
    pub fn socket(&self, ns: &str) -> Option<Arc<Socket<A>>> {
        self.nsps.read().unwrap().get(ns).cloned()
    }

    /// Feed one inbound transport frame to the decoder and route the
    /// decoded packet. Packets of one connection are processed in arrival
    /// order; event delivery is deferred one scheduling tick.
    pub async fn on_data(&self, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let res = {
            let mut decoder = self.decoder.lock().unwrap();
            match decoder.as_mut() {
                Some(decoder) => decoder.add(frame),
                None => return,
            }
        };
        match res {
            Ok(Some(packet)) => self.ondecoded(packet).await,
            Ok(None) => {}
            Err(err) => self.on_decode_error(err),
        }
    }

    /// Transport-level error: forwarded to every socket's error listeners,
    /// then the connection is closed. Fatal for this connection only.
    pub fn on_error(&self, error: String) {
        tracing::debug!(conn = self.conn.id(), "connection error: {error}");
        let sockets: Vec<_> = self.sockets.read().unwrap().values().cloned().collect();
        for socket in sockets {
            socket.notify_error(error.clone());
        }
        self.conn.close();
    }

    /// Transport close: the sole authoritative cleanup trigger. Idempotent;
    /// subsequent transport or decoder events are ignored.
    pub fn on_close(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(conn = self.conn.id(), %reason, "client closed");

        if let Some(mut decoder) = self.decoder.lock().unwrap().take() {
            decoder.destroy();
        }
        let sockets: Vec<_> = {
            let mut map = self.sockets.write().unwrap();
            map.drain().map(|(_, socket)| socket).collect()
        };
        for socket in sockets {
            socket.close(reason);
        }
        self.nsps.write().unwrap().clear();
        self.connect_buffer.lock().unwrap().clear();
        if let Some(server) = self.server.upgrade() {
            server.remove_client(self.conn.id());
        }
    }

    /// Server-side teardown of the whole connection. No per-namespace
    /// DISCONNECT packets are sent: the transport close is visible to the
    /// peer on its own.
    pub fn disconnect(&self) {
        self.conn.close();
        self.on_close(DisconnectReason::ServerNamespaceDisconnect);
    }

    // ===== internal plumbing =====

    async fn ondecoded(&self, packet: Packet) {
        match packet.inner {
            PacketData::Connect => {
                let (name, query) = split_ns_query(&packet.ns);
                self.connect(&name, query);
            }
            inner => {
                let socket = self.nsps.read().unwrap().get(packet.ns.as_ref()).cloned();
                match socket {
                    Some(socket) => {
                        // Deliver on a later tick than decode, so listeners
                        // registered inside a connect listener are in place.
                        tokio::task::yield_now().await;
                        socket.recv(inner).await;
                    }
                    None => tracing::debug!(
                        conn = self.conn.id(),
                        ns = %packet.ns,
                        "packet for a namespace without an established socket, dropping"
                    ),
                }
            }
        }
    }

    /// Route a CONNECT: static namespace, then parent matchers in
    /// registration order, else an "Invalid namespace" ERROR.
    pub(crate) fn connect(&self, name: &str, query: HashMap<String, String>) {
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return,
        };
        if server.get_ns(name).is_some() {
            self.do_connect(name.to_string(), query);
        } else if let Some(parent) = server.match_parent(name, &query) {
            if parent.create_child(name).is_some() {
                self.do_connect(name.to_string(), query);
            }
        } else {
            tracing::debug!(conn = self.conn.id(), ns = name, "invalid namespace requested");
            self.packet(
                Packet::invalid_namespace(name.to_string()),
                PacketOptions::default(),
            );
        }
    }

    fn do_connect(&self, name: String, query: HashMap<String, String>) {
        // No non-default namespace activity before the root handshake
        // completed on this transport.
        if name != "/" && !self.default_connected.load(Ordering::SeqCst) {
            self.connect_buffer.lock().unwrap().push((name, query));
            return;
        }
        let (server, client) = match (self.server.upgrade(), self.weak_self.upgrade()) {
            (Some(server), Some(client)) => (server, client),
            _ => return,
        };
        let ns = server.of_path(&name);
        tokio::spawn(async move {
            match ns.add(&client, &query).await {
                Ok(_socket) => {
                    if ns.path == "/" {
                        client.default_connected.store(true, Ordering::SeqCst);
                        client.flush_connect_buffer();
                    }
                }
                Err(_) => {
                    if ns.path == "/" {
                        client.reject_buffered_connects();
                    }
                }
            }
        });
    }

    /// Replay connects buffered behind the default-namespace handshake, in
    /// arrival order.
    fn flush_connect_buffer(&self) {
        let buffered: Vec<_> = self.connect_buffer.lock().unwrap().drain(..).collect();
        for (name, query) in buffered {
            self.connect(&name, query);
        }
    }

    /// The default-namespace connect was rejected: answer each buffered
    /// entry with an ERROR packet instead of dropping it silently.
    fn reject_buffered_connects(&self) {
        let buffered: Vec<_> = self.connect_buffer.lock().unwrap().drain(..).collect();
        for (name, _) in buffered {
            self.packet(Packet::invalid_namespace(name), PacketOptions::default());
        }
    }

    /// Write one packet to the transport. Dropped silently if the
    /// connection is not open, or not writable for volatile packets.
    pub(crate) fn packet(&self, packet: Packet, opts: PacketOptions) {
        if self.conn.ready_state() != ReadyState::Open {
            return;
        }
        if opts.volatile && !self.conn.writable() {
            return;
        }
        let write_opts = WriteOptions {
            compress: opts.compress,
        };
        for frame in self.parser.encode(packet) {
            self.conn.write(frame, write_opts);
        }
    }

    pub(crate) fn register_socket(&self, socket: &Arc<Socket<A>>) {
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket.clone());
        self.nsps
            .write()
            .unwrap()
            .insert(socket.ns().to_string(), socket.clone());
    }

    /// Unregister a socket from both maps. Idempotent.
    pub(crate) fn remove_socket(&self, sid: &Sid, ns_path: &str) {
        self.sockets.write().unwrap().remove(sid);
        self.nsps.write().unwrap().remove(ns_path);
    }

    pub(crate) fn conn(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    pub(crate) fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub(crate) fn parser(&self) -> Parser {
        self.parser
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn on_decode_error(&self, err: DecodeError) {
        tracing::debug!(conn = self.conn.id(), "frame decoding error: {err}");
        self.on_error(err.to_string());
    }
}

impl<A: Adapter> Debug for Client<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn.id())
            .field("sockets", &self.sockets.read().unwrap().len())
            .finish()
    }
}

/// Split the `nsp` field of a CONNECT packet into the namespace path and
/// its query.
fn split_ns_query(ns: &str) -> (String, HashMap<String, String>) {
    match ns.split_once('?') {
        Some((name, query)) => (name.to_string(), parse_query(query)),
        None => (ns.to_string(), HashMap::new()),
    }
}
