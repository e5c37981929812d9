#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use wiremux::{
    Client, CommonParser, Connection, ConnectionMeta, Frame, Packet, Parse, ReadyState, Server,
    TransportServer, WriteOptions,
};

/// In-memory transport connection: written frames land on a channel.
pub struct StubConnection {
    id: String,
    state: RwLock<ReadyState>,
    writable: AtomicBool,
    tx: mpsc::UnboundedSender<Frame>,
}

impl StubConnection {
    pub fn new(id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: id.to_string(),
            state: RwLock::new(ReadyState::Open),
            writable: AtomicBool::new(true),
            tx,
        });
        (conn, rx)
    }

    /// Toggle writability without closing, for volatile-emit tests.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }
}

impl Connection for StubConnection {
    fn id(&self) -> &str {
        &self.id
    }
    fn ready_state(&self) -> ReadyState {
        *self.state.read().unwrap()
    }
    fn writable(&self) -> bool {
        self.ready_state() == ReadyState::Open && self.writable.load(Ordering::SeqCst)
    }
    fn write(&self, frame: Frame, _opts: WriteOptions) {
        self.tx.send(frame).ok();
    }
    fn close(&self) {
        *self.state.write().unwrap() = ReadyState::Closed;
    }
}

/// In-memory transport server recording the attached initial packet.
#[derive(Default)]
pub struct StubTransportServer {
    pub initial_packet: Mutex<Option<Vec<Frame>>>,
    pub closed: AtomicBool,
}

impl StubTransportServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn initial_packet(&self) -> Option<Vec<Frame>> {
        self.initial_packet.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportServer for StubTransportServer {
    fn set_initial_packet(&self, frames: Option<Vec<Frame>>) {
        *self.initial_packet.lock().unwrap() = frames;
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One connected test client: the transport side of the connection plus the
/// frames the server wrote to it.
pub struct ClientHandle {
    pub conn: Arc<StubConnection>,
    pub client: Arc<Client>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

impl ClientHandle {
    /// Feed a raw text frame to the server side.
    pub async fn send_str(&self, data: impl Into<String>) {
        self.client.on_data(Frame::Text(data.into())).await;
    }

    pub async fn send_frame(&self, frame: Frame) {
        self.client.on_data(frame).await;
    }

    /// Next frame written by the server, decoded.
    pub async fn recv(&mut self) -> Packet {
        decode_frame(timeout_rcv(&mut self.rx).await)
    }

    /// Next raw frame written by the server.
    pub async fn recv_frame(&mut self) -> Frame {
        timeout_rcv(&mut self.rx).await
    }

    /// Assert that the server wrote nothing for a little while.
    pub async fn assert_no_frame(&mut self) {
        let res = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await;
        if let Ok(Some(frame)) = res {
            panic!("unexpected frame: {:?}", frame);
        }
    }
}

/// Open a connection and wait for the default-namespace handshake.
pub async fn connect_client(io: &Server, id: &str) -> ClientHandle {
    let (conn, mut rx) = StubConnection::new(id);
    let client = io.on_connection(conn.clone(), ConnectionMeta::default());
    let frame = timeout_rcv(&mut rx).await;
    assert_eq!(frame, Frame::Text("0".to_string()));
    // Let the connect task finish listener dispatch.
    tokio::time::sleep(Duration::from_millis(5)).await;
    ClientHandle { conn, client, rx }
}

/// Open a connection without waiting for any handshake frame (middleware /
/// elision scenarios).
pub async fn connect_client_raw(io: &Server, id: &str) -> ClientHandle {
    let (conn, rx) = StubConnection::new(id);
    let client = io.on_connection(conn.clone(), ConnectionMeta::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    ClientHandle { conn, client, rx }
}

/// Connect an additional namespace on an established client and wait for
/// the confirmation.
pub async fn join_ns(handle: &mut ClientHandle, ns: &str) {
    handle.send_str(format!("0{},", ns)).await;
    let packet = handle.recv().await;
    assert_eq!(packet, Packet::connect(ns.to_string()));
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub async fn timeout_rcv<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("timed out waiting on channel")
        .expect("channel closed")
}

pub fn decode_frame(frame: Frame) -> Packet {
    CommonParser
        .decoder()
        .add(frame)
        .expect("undecodable frame")
        .expect("incomplete packet")
}
