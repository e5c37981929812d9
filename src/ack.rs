//! Acknowledgement plumbing.
//!
//! An emit expecting a reply allocates a packet id from its namespace,
//! parks a oneshot sender under that id and hands back an [`AckStream`]
//! resolving to the typed response. On the receiving side, handlers of
//! events carrying an id are given an [`AckSender`] which can reply at most
//! once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot::Receiver;
use tokio::time::Timeout;

use crate::adapter::{Adapter, InMemoryAdapter};
use crate::errors::{AckError, SendError};
use crate::packet::Packet;
use crate::socket::Socket;

/// An acknowledgement sent by the client.
#[derive(Debug)]
pub struct AckResponse<T> {
    /// The data returned by the client.
    pub data: T,
    /// Binary attachments of the response, empty if there are none.
    pub binary: Vec<Bytes>,
}

pub(crate) type AckResult<T> = Result<AckResponse<T>, AckError>;

pin_project_lite::pin_project! {
    /// A [`Future`] resolving to the [`AckResponse`] received from the
    /// client, or an [`AckError`] on timeout, transport loss or a response
    /// that does not deserialize to `T`.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    #[derive(Debug)]
    pub struct AckStream<T> {
        #[pin]
        rx: Timeout<Receiver<AckResult<Value>>>,
        _marker: std::marker::PhantomData<T>,
    }
}

impl<T> AckStream<T> {
    pub(crate) fn new(rx: Timeout<Receiver<AckResult<Value>>>) -> Self {
        Self {
            rx,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for AckStream<T> {
    type Output = AckResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().rx.poll(cx) {
            Poll::Ready(Ok(Ok(res))) => Poll::Ready(res.and_then(map_ack_response)),
            // The sender was dropped without a response: the socket closed.
            Poll::Ready(Ok(Err(_))) => {
                Poll::Ready(Err(AckError::Socket(crate::errors::SocketError::Closed)))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(AckError::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn map_ack_response<T: DeserializeOwned>(res: AckResponse<Value>) -> AckResult<T> {
    // Ack payloads are argument arrays; unwrap the single-argument case so
    // plain types deserialize directly.
    let data = match res.data {
        Value::Array(v) if v.len() == 1 => v.into_iter().next().unwrap_or(Value::Null),
        v => v,
    };
    let data = serde_json::from_value(data)?;
    Ok(AckResponse {
        data,
        binary: res.binary,
    })
}

/// Replies to an event that requested an acknowledgement.
///
/// `send` consumes the sender: an acknowledgement can be sent at most once.
/// If the client did not request one, `send` is a no-op.
#[derive(Debug)]
pub struct AckSender<A: Adapter = InMemoryAdapter> {
    socket: Arc<Socket<A>>,
    ack_id: Option<i64>,
    binary: Vec<Bytes>,
    binary_flag: Option<bool>,
}

impl<A: Adapter> AckSender<A> {
    pub(crate) fn new(socket: Arc<Socket<A>>, ack_id: Option<i64>) -> Self {
        Self {
            socket,
            ack_id,
            binary: Vec::new(),
            binary_flag: None,
        }
    }

    /// Add binary attachments to the acknowledgement.
    pub fn bin(mut self, binary: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.binary = binary.into_iter().map(Into::into).collect();
        self
    }

    /// Force or suppress the binary framing of the acknowledgement,
    /// overriding the attachment-based detection.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary_flag = Some(binary);
        self
    }

    /// Send the acknowledgement back to the client.
    pub fn send(self, data: impl Serialize) -> Result<(), SendError> {
        let ack_id = match self.ack_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let ns = self.socket.ns().to_owned();
        let data = serde_json::to_value(data)?;
        let binary = match self.binary_flag {
            Some(forced) => forced,
            None => !self.binary.is_empty(),
        };
        let packet = if binary {
            Packet::bin_ack(ns, data, self.binary, ack_id)
        } else {
            Packet::ack(ns, data, ack_id)
        };
        self.socket.send_packet(packet)?;
        Ok(())
    }
}
