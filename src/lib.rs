#![warn(
    clippy::all,
    clippy::todo,
    clippy::empty_enum,
    clippy::mem_forget,
    clippy::needless_continue,
    clippy::needless_borrow,
    clippy::match_wildcard_for_single_variants,
    clippy::if_let_mutex,
    clippy::await_holding_lock,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::macro_use_imports,
    clippy::option_option,
    clippy::unnested_or_patterns,
    rust_2018_idioms,
    future_incompatible,
    nonstandard_style
)]
//! Server-side core of a bidirectional, event-oriented messaging layer.
//!
//! One long-lived transport connection multiplexes many logical channels
//! ("namespaces"), group subscriptions ("rooms") and application events.
//! This crate is the multiplexing and dispatch engine: it turns a stream of
//! decoded protocol packets into addressed event deliveries, enforces
//! namespace membership, manages room fan-out and serializes outbound
//! packets back onto the transport.
//!
//! * The transport itself (upgrades, heartbeats, framing) lives behind the
//!   [`transport`] seam: the embedder drives the core through
//!   [`Server::on_connection`] and the [`Client`] event methods.
//! * The wire codec lives behind the [`parser`] seam; the built-in
//!   [`parser::CommonParser`] implements the default text format.
//! * Broadcast fan-out goes through the pluggable [`adapter::Adapter`];
//!   the in-memory implementation serves a single node.
//!
//! ```
//! use wiremux::Server;
//!
//! let io = Server::new();
//! io.of("/chat").on_connect(|socket| {
//!     socket.on("message", |socket, data: serde_json::Value, _bin, _ack| async move {
//!         // Broadcast to everyone in the sender's rooms except itself.
//!         socket.to("lobby").emit("message", &data).ok();
//!     });
//! });
//! ```

pub mod ack;
pub mod adapter;
pub mod client;
pub mod config;
pub mod errors;
pub(crate) mod handler;
pub mod handshake;
pub mod io;
pub mod ns;
pub mod operators;
pub mod packet;
pub mod parser;
pub mod sid;
pub mod socket;
pub mod transport;

pub use ack::{AckResponse, AckSender, AckStream};
pub use adapter::{Adapter, BroadcastFlags, BroadcastOptions, InMemoryAdapter, Room, RoomParam};
pub use client::Client;
pub use config::{ServerConfig, ServerConfigBuilder};
pub use errors::{AckError, AdapterError, BroadcastError, DecodeError, SendError, SocketError};
pub use handshake::Handshake;
pub use io::Server;
pub use ns::{Namespace, NsMatcher, ParentBroadcast, ParentNamespace};
pub use operators::{BroadcastOperators, ConfOperators};
pub use packet::{Packet, PacketData};
pub use parser::{CommonParser, Decoder, Frame, Parse, Parser};
pub use sid::Sid;
pub use socket::{DisconnectReason, Socket, RESERVED_EVENTS};
pub use transport::{Connection, ConnectionMeta, ReadyState, TransportServer, WriteOptions};
