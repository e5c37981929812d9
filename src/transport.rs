//! The seam between the core and the underlying transport layer.
//!
//! The core never opens sockets itself: the embedder owns the accept loop,
//! upgrades, heartbeats and framing, and drives the core by
//! * calling [`Server::on_connection`](crate::Server::on_connection) when a
//!   transport connection is established, and
//! * forwarding the connection's `data`, `error` and `close` events to
//!   [`Client::on_data`](crate::Client::on_data),
//!   [`Client::on_error`](crate::Client::on_error) and
//!   [`Client::on_close`](crate::Client::on_close).

use std::net::SocketAddr;

use crate::parser::Frame;

/// State of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Per-frame write options forwarded to the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Whether the transport may compress this frame.
    pub compress: bool,
}

/// A single live transport connection.
///
/// Writes are fire-and-forget: a frame written while the connection is not
/// open is dropped by the caller, so implementations may assume
/// [`ReadyState::Open`].
pub trait Connection: Send + Sync + 'static {
    /// Connection id, unique within the process.
    fn id(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    /// Whether a frame written right now would be flushed rather than
    /// queued. Used by volatile emits to decide between sending and
    /// dropping.
    fn writable(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    fn write(&self, frame: Frame, opts: WriteOptions);

    fn close(&self);
}

/// The listening side of the transport, consumed by
/// [`Server::attach`](crate::Server::attach).
pub trait TransportServer: Send + Sync + 'static {
    /// Attach (or clear, with `None`) frames to piggy-back on the next
    /// handshake responses. Used to fuse the default-namespace CONNECT
    /// reply with the transport handshake and save a round trip.
    fn set_initial_packet(&self, frames: Option<Vec<Frame>>);

    fn close(&self);
}

/// Request metadata captured when the transport connection was established.
/// It seeds the immutable [`Handshake`](crate::handshake::Handshake) of
/// every socket multiplexed over the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub headers: http::HeaderMap,
    pub uri: http::Uri,
    pub remote_addr: Option<SocketAddr>,
    /// Whether the connection came in over a TLS transport.
    pub secure: bool,
}
