/// Errors raised while decoding incoming frames. They are fatal for the
/// connection they occurred on, not for the process.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("invalid json payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("binary frame received without a pending binary packet")]
    UnexpectedBinaryFrame,
}

/// Error writing to a single socket.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The socket is disconnected or its transport is no longer open.
    #[error("socket closed")]
    Closed,
}

/// Error type for single-socket emit operations.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("error serializing packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("error sending data through the transport: {0:?}")]
    Socket(#[from] SocketError),

    /// Reserved event names are raised locally and cannot carry an
    /// acknowledgement request.
    #[error("cannot request an acknowledgement for a reserved event")]
    ReservedEvent,
}

/// Error type for broadcast operations. Failing sockets do not prevent the
/// packet from reaching the other targets; they are collected here.
#[derive(thiserror::Error, Debug)]
pub enum BroadcastError {
    #[error("error sending data through the transport: {0:?}")]
    Socket(Vec<SocketError>),

    #[error("error serializing packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

impl From<Vec<SocketError>> for BroadcastError {
    fn from(value: Vec<SocketError>) -> Self {
        Self::Socket(value)
    }
}

/// Error type for acknowledgement results.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The ack response could not be deserialized to the expected type.
    #[error("cannot deserialize ack response: {0:?}")]
    Decode(#[from] serde_json::Error),

    /// The client did not acknowledge in time.
    #[error("ack timeout")]
    Timeout,

    /// The socket went away before acknowledging.
    #[error("error sending data through the transport: {0:?}")]
    Socket(#[from] SocketError),
}

/// An error produced by an adapter implementation. The in-memory adapter is
/// infallible; cross-node adapters surface their transport failures here.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct AdapterError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

/// Marker for an aborted namespace connection: middleware rejection or a
/// transport that went away mid-handshake.
#[derive(Debug)]
pub(crate) struct ConnectFail;
