//! Protocol packet model. The wire representation lives in
//! [`parser`](crate::parser); this module only describes the decoded shape
//! shared by the core and the codec.

use std::borrow::Cow;

use bytes::Bytes;
use serde_json::{json, Value};

/// A decoded protocol packet: a payload addressed to one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub inner: PacketData,
    pub ns: Cow<'static, str>,
}

impl Packet {
    /// Acknowledges a namespace connection.
    pub fn connect(ns: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: PacketData::Connect,
            ns: ns.into(),
        }
    }

    pub fn disconnect(ns: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns: ns.into(),
        }
    }

    /// An error addressed to one namespace: middleware rejections and
    /// unknown-namespace refusals.
    pub fn error(ns: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Error(message.into()),
            ns: ns.into(),
        }
    }

    pub fn invalid_namespace(ns: impl Into<Cow<'static, str>>) -> Self {
        Self::error(ns, "Invalid namespace")
    }

    pub fn event(
        ns: impl Into<Cow<'static, str>>,
        e: impl Into<Cow<'static, str>>,
        data: Value,
    ) -> Self {
        Self {
            inner: PacketData::Event(e.into(), data, None),
            ns: ns.into(),
        }
    }

    pub fn bin_event(
        ns: impl Into<Cow<'static, str>>,
        e: impl Into<Cow<'static, str>>,
        data: Value,
        bin: Vec<Bytes>,
    ) -> Self {
        let payload = BinaryPayload::outgoing(data, bin);
        Self {
            inner: PacketData::BinaryEvent(e.into(), payload, None),
            ns: ns.into(),
        }
    }

    pub fn ack(ns: impl Into<Cow<'static, str>>, data: Value, ack: i64) -> Self {
        Self {
            inner: PacketData::EventAck(data, ack),
            ns: ns.into(),
        }
    }

    pub fn bin_ack(ns: impl Into<Cow<'static, str>>, data: Value, bin: Vec<Bytes>, ack: i64) -> Self {
        let payload = BinaryPayload::outgoing(data, bin);
        Self {
            inner: PacketData::BinaryAck(payload, ack),
            ns: ns.into(),
        }
    }
}

/// | Type          | Index | Usage                                                 |
/// |---------------|-------|-------------------------------------------------------|
/// | CONNECT       | 0     | Namespace connection handshake.                       |
/// | DISCONNECT    | 1     | Namespace disconnection.                              |
/// | EVENT         | 2     | Application event.                                    |
/// | ACK           | 3     | Acknowledgement of an event.                          |
/// | ERROR         | 4     | Namespace-scoped error (rejection, invalid namespace).|
/// | BINARY_EVENT  | 5     | Application event with binary attachments.            |
/// | BINARY_ACK    | 6     | Acknowledgement with binary attachments.              |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData {
    Connect,
    Disconnect,
    Event(Cow<'static, str>, Value, Option<i64>),
    EventAck(Value, i64),
    Error(String),
    BinaryEvent(Cow<'static, str>, BinaryPayload, Option<i64>),
    BinaryAck(BinaryPayload, i64),
}

impl PacketData {
    /// Set the ack id on packets that can carry one.
    pub(crate) fn set_ack_id(&mut self, ack_id: i64) {
        match self {
            PacketData::Event(_, _, ack) | PacketData::BinaryEvent(_, _, ack) => {
                *ack = Some(ack_id)
            }
            _ => {}
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        matches!(
            self,
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _)
        )
    }
}

/// Payload of a binary packet: the JSON part (with attachment placeholders
/// stripped) plus the attachments collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPayload {
    pub data: Value,
    pub bin: Vec<Bytes>,
    pub(crate) payload_count: usize,
}

impl BinaryPayload {
    /// Build from decoded incoming data, removing placeholders and counting
    /// the attachments still to be received.
    pub(crate) fn incoming(mut data: Value) -> Self {
        let payload_count = match &mut data {
            Value::Array(v) => {
                let count = v.len();
                v.retain(|v| v.as_object().and_then(|o| o.get("_placeholder")).is_none());
                count - v.len()
            }
            val => {
                if val.as_object().and_then(|o| o.get("_placeholder")).is_some() {
                    data = Value::Array(vec![]);
                    1
                } else {
                    0
                }
            }
        };

        Self {
            data,
            bin: Vec::new(),
            payload_count,
        }
    }

    /// Build from outgoing data, appending one placeholder per attachment.
    pub(crate) fn outgoing(data: Value, bin: Vec<Bytes>) -> Self {
        let mut data = match data {
            Value::Array(v) => Value::Array(v),
            d => Value::Array(vec![d]),
        };
        let payload_count = bin.len();
        if let Some(arr) = data.as_array_mut() {
            for i in 0..payload_count {
                arr.push(json!({
                    "_placeholder": true,
                    "num": i
                }));
            }
        }
        Self {
            data,
            bin,
            payload_count,
        }
    }

    pub(crate) fn add_payload(&mut self, payload: Bytes) {
        self.bin.push(payload);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.payload_count == self.bin.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outgoing_payload_placeholders() {
        let p = BinaryPayload::outgoing(json!({"k": "v"}), vec![Bytes::from_static(&[1])]);
        assert_eq!(p.payload_count, 1);
        assert_eq!(
            p.data,
            json!([{"k": "v"}, {"_placeholder": true, "num": 0}])
        );
    }

    #[test]
    fn incoming_payload_strips_placeholders() {
        let p = BinaryPayload::incoming(json!([{"k": "v"}, {"_placeholder": true, "num": 0}]));
        assert_eq!(p.payload_count, 1);
        assert_eq!(p.data, json!([{"k": "v"}]));
        assert!(!p.is_complete());
    }

    #[test]
    fn ack_id_only_on_events() {
        let mut p = Packet::event("/", "ev", json!([])).inner;
        p.set_ack_id(3);
        assert_eq!(p, PacketData::Event("ev".into(), json!([]), Some(3)));

        let mut p = Packet::disconnect("/").inner;
        p.set_ack_id(3);
        assert_eq!(p, PacketData::Disconnect);
    }
}
