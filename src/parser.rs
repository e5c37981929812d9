//! Wire codec seam and its default implementation.
//!
//! The core is written against [`Parse`]: `encode` turns a packet into an
//! ordered list of frames (the JSON header first, then one binary frame per
//! attachment) and [`Decoder`] incrementally reassembles inbound frames,
//! surfacing a packet only once every attachment arrived.
//!
//! [`CommonParser`] implements the text wire format
//! `<type>[<attachments>-][<namespace>,][<ack id>][json payload]`.

use std::borrow::Cow;

use bytes::Bytes;
use serde_json::Value;

use crate::errors::DecodeError;
use crate::packet::{BinaryPayload, Packet, PacketData};

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// A packet codec.
pub trait Parse: Send + Sync + 'static {
    /// Encode a packet into the ordered list of frames to write.
    fn encode(&self, packet: Packet) -> Vec<Frame>;

    /// Create a fresh incremental decoder for one connection.
    fn decoder(&self) -> Decoder;
}

/// The default text codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonParser;

/// The codec handle stored by the core. Cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parser(CommonParser);

impl Parser {
    pub(crate) fn encode(&self, packet: Packet) -> Vec<Frame> {
        self.0.encode(packet)
    }
    pub(crate) fn decoder(&self) -> Decoder {
        self.0.decoder()
    }
}

/// Incremental decoder: buffers a binary packet until all its attachments
/// have been received.
#[derive(Debug, Default)]
pub struct Decoder {
    partial: Option<Packet>,
}

impl Decoder {
    /// Feed one frame. Returns a packet once one is complete.
    pub fn add(&mut self, frame: Frame) -> Result<Option<Packet>, DecodeError> {
        match frame {
            Frame::Text(data) => {
                if self.partial.is_some() {
                    // A text frame may not interrupt a pending binary packet.
                    self.partial = None;
                    return Err(DecodeError::InvalidPacketType);
                }
                let packet = decode_str(&data)?;
                match &packet.inner {
                    PacketData::BinaryEvent(_, payload, _) | PacketData::BinaryAck(payload, _)
                        if !payload.is_complete() =>
                    {
                        self.partial = Some(packet);
                        Ok(None)
                    }
                    _ => Ok(Some(packet)),
                }
            }
            Frame::Binary(bin) => {
                let mut packet = self
                    .partial
                    .take()
                    .ok_or(DecodeError::UnexpectedBinaryFrame)?;
                let payload = match &mut packet.inner {
                    PacketData::BinaryEvent(_, payload, _) | PacketData::BinaryAck(payload, _) => {
                        payload
                    }
                    _ => return Err(DecodeError::UnexpectedBinaryFrame),
                };
                payload.add_payload(bin);
                if payload.is_complete() {
                    Ok(Some(packet))
                } else {
                    self.partial = Some(packet);
                    Ok(None)
                }
            }
        }
    }

    /// Drop any partially decoded state. Called on connection teardown.
    pub fn destroy(&mut self) {
        self.partial = None;
    }
}

impl Parse for CommonParser {
    fn encode(&self, packet: Packet) -> Vec<Frame> {
        let bin = match packet.inner {
            PacketData::BinaryEvent(_, ref payload, _) | PacketData::BinaryAck(ref payload, _) => {
                payload.bin.clone()
            }
            _ => Vec::new(),
        };
        let mut frames = Vec::with_capacity(1 + bin.len());
        frames.push(Frame::Text(encode_str(packet)));
        frames.extend(bin.into_iter().map(Frame::Binary));
        frames
    }

    fn decoder(&self) -> Decoder {
        Decoder::default()
    }
}

fn index(data: &PacketData) -> char {
    match data {
        PacketData::Connect => '0',
        PacketData::Disconnect => '1',
        PacketData::Event(_, _, _) => '2',
        PacketData::EventAck(_, _) => '3',
        PacketData::Error(_) => '4',
        PacketData::BinaryEvent(_, _, _) => '5',
        PacketData::BinaryAck(_, _) => '6',
    }
}

/// Prefix the event name to the argument list: `["event", ...args]`.
fn event_payload(event: &str, data: Value) -> Vec<Value> {
    let mut args = match data {
        Value::Array(v) => v,
        Value::Null => vec![],
        d => vec![d],
    };
    args.insert(0, Value::String(event.to_owned()));
    args
}

/// Enforce that an ack payload is an array: `[...args]`.
fn ack_payload(data: Value) -> Vec<Value> {
    match data {
        Value::Array(v) => v,
        Value::Null => vec![],
        d => vec![d],
    }
}

fn encode_str(packet: Packet) -> String {
    let mut res = String::with_capacity(16 + packet.ns.len());
    res.push(index(&packet.inner));

    // For binary packets the attachment count comes before the namespace.
    let push_nsp = |res: &mut String| {
        if !packet.ns.is_empty() && packet.ns != "/" {
            if !packet.ns.starts_with('/') {
                res.push('/');
            }
            res.push_str(&packet.ns);
            res.push(',');
        }
    };

    if !packet.inner.is_binary() {
        push_nsp(&mut res);
    }

    match packet.inner {
        PacketData::Connect | PacketData::Disconnect => (),
        PacketData::Error(message) => {
            res.push_str(&Value::String(message).to_string());
        }
        PacketData::Event(event, data, ack) => {
            if let Some(ack) = ack {
                res.push_str(&ack.to_string());
            }
            res.push_str(&Value::Array(event_payload(&event, data)).to_string());
        }
        PacketData::EventAck(data, ack) => {
            res.push_str(&ack.to_string());
            res.push_str(&Value::Array(ack_payload(data)).to_string());
        }
        PacketData::BinaryEvent(event, payload, ack) => {
            res.push_str(&payload.payload_count.to_string());
            res.push('-');
            push_nsp(&mut res);
            if let Some(ack) = ack {
                res.push_str(&ack.to_string());
            }
            res.push_str(&Value::Array(event_payload(&event, payload.data)).to_string());
        }
        PacketData::BinaryAck(payload, ack) => {
            res.push_str(&payload.payload_count.to_string());
            res.push('-');
            push_nsp(&mut res);
            res.push_str(&ack.to_string());
            res.push_str(&Value::Array(ack_payload(payload.data)).to_string());
        }
    }
    res
}

/// Split `["<event>", ...args]` into the event name and the argument array.
fn decode_event_payload(data: &str) -> Result<(String, Value), DecodeError> {
    let packet = match serde_json::from_str::<Value>(data)? {
        Value::Array(packet) => packet,
        _ => return Err(DecodeError::InvalidEventName),
    };

    let mut iter = packet.into_iter();
    let event = match iter.next() {
        Some(Value::String(e)) => e,
        _ => return Err(DecodeError::InvalidEventName),
    };
    let payload = Value::from_iter(iter);
    Ok((event, payload))
}

/// Decode a packet from its text header:
/// `<type>[<attachments>-][<namespace>,][<ack id>][json payload]`.
/// Binary attachments are collected afterwards by the [`Decoder`].
fn decode_str(value: &str) -> Result<Packet, DecodeError> {
    // Separators are all ASCII so the header can be scanned byte-wise.
    let chars = value.as_bytes();
    let index = *chars.first().ok_or(DecodeError::InvalidPacketType)?;
    if !(b'0'..=b'6').contains(&index) {
        return Err(DecodeError::InvalidPacketType);
    }
    let mut i = 1;

    // Skip the attachment count of binary packets.
    if index == b'5' || index == b'6' {
        loop {
            match chars.get(i) {
                Some(b'-') => {
                    i += 1;
                    break;
                }
                Some(c) if c.is_ascii_digit() => i += 1,
                _ => return Err(DecodeError::InvalidPacketType),
            }
        }
    }

    let start_index = i;
    // Custom namespaces start with a slash.
    let ns: Cow<'static, str> = if chars.get(i) == Some(&b'/') {
        loop {
            match chars.get(i) {
                Some(b',') => {
                    i += 1;
                    break Cow::Owned(value[start_index..i - 1].to_string());
                }
                // Some clients omit the trailing comma when the namespace
                // ends the packet, e.g. `1/custom`.
                None => break Cow::Owned(value[start_index..i].to_string()),
                Some(_) => i += 1,
            }
        }
    } else {
        Cow::Borrowed("/")
    };

    let start_index = i;
    let ack: Option<i64> = loop {
        match chars.get(i) {
            Some(c) if c.is_ascii_digit() => i += 1,
            Some(b'[') | Some(b'{') | Some(b'"') if i > start_index => {
                break value[start_index..i].parse().ok()
            }
            _ => break None,
        }
    };

    let data = &value[i..];
    let inner = match index {
        b'0' => PacketData::Connect,
        b'1' => PacketData::Disconnect,
        b'2' => {
            let (event, payload) = decode_event_payload(data)?;
            PacketData::Event(event.into(), payload, ack)
        }
        b'3' => {
            let payload = serde_json::from_str(data)?;
            PacketData::EventAck(payload, ack.ok_or(DecodeError::InvalidPacketType)?)
        }
        b'4' => {
            let message: String = if data.is_empty() {
                String::new()
            } else {
                serde_json::from_str(data)?
            };
            PacketData::Error(message)
        }
        b'5' => {
            let (event, payload) = decode_event_payload(data)?;
            PacketData::BinaryEvent(event.into(), BinaryPayload::incoming(payload), ack)
        }
        b'6' => {
            let payload = serde_json::from_str(data)?;
            PacketData::BinaryAck(
                BinaryPayload::incoming(payload),
                ack.ok_or(DecodeError::InvalidPacketType)?,
            )
        }
        _ => return Err(DecodeError::InvalidPacketType),
    };

    Ok(Packet { inner, ns })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn decode(value: &str) -> Packet {
        CommonParser.decoder().add(Frame::Text(value.to_string())).unwrap().unwrap()
    }
    fn encode(packet: Packet) -> String {
        match CommonParser.encode(packet).remove(0) {
            Frame::Text(s) => s,
            Frame::Binary(_) => panic!("expected a text frame"),
        }
    }

    #[test]
    fn packet_decode_connect() {
        assert_eq!(decode("0"), Packet::connect("/"));
        assert_eq!(decode("0/admin™,"), Packet::connect("/admin™"));
        // The namespace of a connect packet may carry a query string.
        assert_eq!(decode("0/chat?token=a,"), Packet::connect("/chat?token=a"));
    }

    #[test]
    fn packet_encode_connect() {
        assert_eq!(encode(Packet::connect("/")), "0");
        assert_eq!(encode(Packet::connect("/admin™")), "0/admin™,");
    }

    #[test]
    fn packet_decode_disconnect() {
        assert_eq!(decode("1"), Packet::disconnect("/"));
        assert_eq!(decode("1/admin™,"), Packet::disconnect("/admin™"));
        assert_eq!(decode("1/custom"), Packet::disconnect("/custom"));
    }

    #[test]
    fn packet_encode_disconnect() {
        assert_eq!(encode(Packet::disconnect("/")), "1");
        assert_eq!(encode(Packet::disconnect("/admin™")), "1/admin™,");
    }

    #[test]
    fn packet_decode_event() {
        assert_eq!(
            decode(&format!("2{}", json!(["event", {"data": "value"}]))),
            Packet::event("/", "event", json!([{"data": "value"}]))
        );

        // With ack id
        let mut with_ack = Packet::event("/", "event", json!([{"data": "value"}]));
        with_ack.inner.set_ack_id(1);
        assert_eq!(
            decode(&format!("21{}", json!(["event", {"data": "value"}]))),
            with_ack
        );

        // With namespace
        assert_eq!(
            decode(&format!("2/admin™,{}", json!(["event", {"data": "value™"}]))),
            Packet::event("/admin™", "event", json!([{"data": "value™"}]))
        );
    }

    #[test]
    fn packet_encode_event() {
        assert_eq!(
            encode(Packet::event("/", "event", json!({"data": "value™"}))),
            format!("2{}", json!(["event", {"data": "value™"}]))
        );

        let mut with_ack = Packet::event("/", "event", json!({"data": "value™"}));
        with_ack.inner.set_ack_id(1);
        assert_eq!(
            encode(with_ack),
            format!("21{}", json!(["event", {"data": "value™"}]))
        );

        assert_eq!(
            encode(Packet::event("/admin™", "event", json!({"data": "value™"}))),
            format!("2/admin™,{}", json!(["event", {"data": "value™"}]))
        );
    }

    #[test]
    fn packet_decode_event_ack() {
        assert_eq!(decode("354[\"data\"]"), Packet::ack("/", json!(["data"]), 54));
        assert_eq!(
            decode("3/admin™,54[\"data\"]"),
            Packet::ack("/admin™", json!(["data"]), 54)
        );
    }

    #[test]
    fn packet_encode_event_ack() {
        assert_eq!(encode(Packet::ack("/", json!("data"), 54)), "354[\"data\"]");
        assert_eq!(
            encode(Packet::ack("/admin™", json!("data"), 54)),
            "3/admin™,54[\"data\"]"
        );
    }

    #[test]
    fn packet_encode_decode_error() {
        assert_eq!(
            encode(Packet::invalid_namespace("/admin")),
            "4/admin,\"Invalid namespace\""
        );
        assert_eq!(
            decode("4/admin,\"forbidden\""),
            Packet::error("/admin", "forbidden")
        );
    }

    #[test]
    fn packet_encode_binary_event() {
        let frames = CommonParser.encode(Packet::bin_event(
            "/",
            "event",
            json!({"data": "value™"}),
            vec![Bytes::from_static(&[1])],
        ));
        assert_eq!(
            frames,
            vec![
                Frame::Text(format!(
                    "51-{}",
                    json!(["event", {"data": "value™"}, {"_placeholder": true, "num": 0}])
                )),
                Frame::Binary(Bytes::from_static(&[1])),
            ]
        );
    }

    #[test]
    fn packet_decode_binary_event_incremental() {
        let mut decoder = CommonParser.decoder();
        let header = format!(
            "51-{}",
            json!(["event", {"data": "value™"}, {"_placeholder": true, "num": 0}])
        );
        assert_eq!(decoder.add(Frame::Text(header)).unwrap(), None);
        let packet = decoder
            .add(Frame::Binary(Bytes::from_static(&[1])))
            .unwrap()
            .unwrap();

        match packet.inner {
            PacketData::BinaryEvent(event, payload, None) => {
                assert_eq!(event, "event");
                assert_eq!(payload.data, json!([{"data": "value™"}]));
                assert_eq!(payload.bin, vec![Bytes::from_static(&[1])]);
            }
            p => panic!("unexpected packet: {:?}", p),
        }
    }

    #[test]
    fn packet_decode_binary_ack() {
        let mut decoder = CommonParser.decoder();
        let header = format!(
            "61-/admin,54{}",
            json!([{"data": "value™"}, {"_placeholder": true, "num": 0}])
        );
        assert_eq!(decoder.add(Frame::Text(header)).unwrap(), None);
        let packet = decoder
            .add(Frame::Binary(Bytes::from_static(&[1])))
            .unwrap()
            .unwrap();
        assert_eq!(packet.ns, "/admin");
        match packet.inner {
            PacketData::BinaryAck(payload, 54) => {
                assert_eq!(payload.data, json!([{"data": "value™"}]));
                assert_eq!(payload.bin, vec![Bytes::from_static(&[1])]);
            }
            p => panic!("unexpected packet: {:?}", p),
        }
    }

    #[test]
    fn unexpected_binary_frame() {
        let mut decoder = CommonParser.decoder();
        let err = decoder
            .add(Frame::Binary(Bytes::from_static(&[1])))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedBinaryFrame));
    }

    #[test]
    fn invalid_packet_type() {
        let mut decoder = CommonParser.decoder();
        assert!(decoder.add(Frame::Text("9".into())).is_err());
        assert!(decoder.add(Frame::Text(String::new())).is_err());
    }
}
