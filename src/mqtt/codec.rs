#![forbid(unsafe_code)]

// MQTT 3.1.1 client-side wire codec: just the packets a subscriber-only
// load client exchanges. Encoding writes into a caller-supplied BytesMut;
// decoding is streaming and tolerates frames split across reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const TYPE_CONNECT: u8 = 0x10;
const TYPE_CONNACK: u8 = 0x20;
const TYPE_PUBLISH: u8 = 0x30;
const TYPE_PUBACK: u8 = 0x40;
const TYPE_SUBSCRIBE: u8 = 0x82; // includes mandatory flag bits
const TYPE_SUBACK: u8 = 0x90;
const TYPE_PINGREQ: u8 = 0xC0;
const TYPE_PINGRESP: u8 = 0xD0;
const TYPE_DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_USERNAME: u8 = 0x80;

/// SUBACK per-topic refusal code.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed remaining length")]
    BadRemainingLength,
    #[error("packet body truncated")]
    Truncated,
    #[error("unsupported packet type {0:#04x}")]
    UnsupportedPacket(u8),
    #[error("invalid UTF-8 in topic name")]
    BadTopic,
}

/// Inbound packets a client can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connack {
        session_present: bool,
        code: u8,
    },
    Suback {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Publish {
        topic: String,
        packet_id: Option<u16>,
        qos: u8,
        payload: Bytes,
    },
    Pingresp,
}

/// CONNECT with clean session. Authentication is client-identifier only:
/// the identifier doubles as the username and no password is sent.
pub fn encode_connect(buf: &mut BytesMut, client_id: &str, username: Option<&str>, keepalive_secs: u16) {
    let mut body = BytesMut::with_capacity(16 + client_id.len());
    put_string(&mut body, PROTOCOL_NAME);
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = FLAG_CLEAN_SESSION;
    if username.is_some() {
        flags |= FLAG_USERNAME;
    }
    body.put_u8(flags);
    body.put_u16(keepalive_secs);

    put_string(&mut body, client_id.as_bytes());
    if let Some(username) = username {
        put_string(&mut body, username.as_bytes());
    }

    put_frame(buf, TYPE_CONNECT, &body);
}

/// SUBSCRIBE for a single topic filter.
pub fn encode_subscribe(buf: &mut BytesMut, packet_id: u16, topic: &str, qos: u8) {
    let mut body = BytesMut::with_capacity(5 + topic.len());
    body.put_u16(packet_id);
    put_string(&mut body, topic.as_bytes());
    body.put_u8(qos);
    put_frame(buf, TYPE_SUBSCRIBE, &body);
}

/// PUBACK acknowledging a QoS 1 delivery.
pub fn encode_puback(buf: &mut BytesMut, packet_id: u16) {
    buf.put_u8(TYPE_PUBACK);
    buf.put_u8(2);
    buf.put_u16(packet_id);
}

pub fn encode_pingreq(buf: &mut BytesMut) {
    buf.put_u8(TYPE_PINGREQ);
    buf.put_u8(0);
}

pub fn encode_disconnect(buf: &mut BytesMut) {
    buf.put_u8(TYPE_DISCONNECT);
    buf.put_u8(0);
}

/// Decode one packet from the front of `buf`, or None if a complete frame
/// has not arrived yet.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let (remaining, header_len) = match decode_remaining_length(&buf[1..])? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    let frame_len = 1 + header_len + remaining;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(frame_len);
    frame.advance(1 + header_len);

    match first & 0xF0 {
        TYPE_CONNACK => {
            if frame.len() < 2 {
                return Err(CodecError::Truncated);
            }
            let session_present = frame.get_u8() & 0x01 != 0;
            let code = frame.get_u8();
            Ok(Some(Packet::Connack {
                session_present,
                code,
            }))
        }
        TYPE_SUBACK => {
            if frame.len() < 3 {
                return Err(CodecError::Truncated);
            }
            let packet_id = frame.get_u16();
            let codes = frame.to_vec();
            Ok(Some(Packet::Suback { packet_id, codes }))
        }
        TYPE_PUBLISH => {
            let qos = (first >> 1) & 0x03;
            if frame.len() < 2 {
                return Err(CodecError::Truncated);
            }
            let topic_len = frame.get_u16() as usize;
            if frame.len() < topic_len {
                return Err(CodecError::Truncated);
            }
            let topic = String::from_utf8(frame.split_to(topic_len).to_vec())
                .map_err(|_| CodecError::BadTopic)?;
            let packet_id = if qos > 0 {
                if frame.len() < 2 {
                    return Err(CodecError::Truncated);
                }
                Some(frame.get_u16())
            } else {
                None
            };
            Ok(Some(Packet::Publish {
                topic,
                packet_id,
                qos,
                payload: frame.freeze(),
            }))
        }
        TYPE_PINGRESP => Ok(Some(Packet::Pingresp)),
        other => Err(CodecError::UnsupportedPacket(other)),
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn put_frame(buf: &mut BytesMut, packet_type: u8, body: &[u8]) {
    buf.put_u8(packet_type);
    put_remaining_length(buf, body.len());
    buf.put_slice(body);
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Variable-length remaining-length field: value plus the number of bytes
/// it occupied, or None if more bytes are needed.
fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(CodecError::BadRemainingLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_layout() {
        let mut buf = BytesMut::new();
        encode_connect(&mut buf, "user7", Some("user7"), 60);

        // type + remaining length
        assert_eq!(buf[0], 0x10);
        assert_eq!(buf[1] as usize, buf.len() - 2);
        // protocol name + level
        assert_eq!(&buf[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(buf[8], 4);
        // clean session + username flag, keepalive 60
        assert_eq!(buf[9], 0x82);
        assert_eq!(&buf[10..12], &[0x00, 60]);
        // client id then username payload fields
        assert_eq!(&buf[12..14], &[0x00, 5]);
        assert_eq!(&buf[14..19], b"user7");
        assert_eq!(&buf[19..21], &[0x00, 5]);
    }

    #[test]
    fn decodes_connack_codes() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x05][..]);
        match decode(&mut buf).unwrap() {
            Some(Packet::Connack {
                session_present,
                code,
            }) => {
                assert!(!session_present);
                assert_eq!(code, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_split_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x20]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0x02, 0x00]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0x00]);
        assert!(matches!(
            decode(&mut buf).unwrap(),
            Some(Packet::Connack { code: 0, .. })
        ));
    }

    #[test]
    fn decodes_qos0_publish() {
        let mut buf = BytesMut::new();
        let body = {
            let mut b = BytesMut::new();
            put_string(&mut b, b"clients/user1/alerts");
            b.put_slice(b"ALERT");
            b
        };
        put_frame(&mut buf, TYPE_PUBLISH, &body);

        match decode(&mut buf).unwrap() {
            Some(Packet::Publish {
                topic,
                packet_id,
                qos,
                payload,
            }) => {
                assert_eq!(topic, "clients/user1/alerts");
                assert_eq!(packet_id, None);
                assert_eq!(qos, 0);
                assert_eq!(&payload[..], b"ALERT");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_qos1_publish_with_packet_id() {
        let mut buf = BytesMut::new();
        let body = {
            let mut b = BytesMut::new();
            put_string(&mut b, b"t");
            b.put_u16(9);
            b.put_slice(b"X");
            b
        };
        // header with QoS 1 bit
        buf.put_u8(TYPE_PUBLISH | 0x02);
        put_remaining_length(&mut buf, body.len());
        buf.put_slice(&body);

        match decode(&mut buf).unwrap() {
            Some(Packet::Publish {
                packet_id, qos, ..
            }) => {
                assert_eq!(packet_id, Some(9));
                assert_eq!(qos, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn multi_byte_remaining_length_round_trips() {
        let mut buf = BytesMut::new();
        let body = vec![0u8; 321];
        let framed = {
            let mut b = BytesMut::new();
            let mut inner = BytesMut::new();
            put_string(&mut inner, b"t");
            inner.put_slice(&body);
            put_frame(&mut b, TYPE_PUBLISH, &inner);
            b
        };
        // 324 = 0xC4 0x02 in the varint encoding
        assert_eq!(&framed[1..3], &[0xC4, 0x02]);

        buf.extend_from_slice(&framed);
        match decode(&mut buf).unwrap() {
            Some(Packet::Publish { payload, .. }) => assert_eq!(payload.len(), 321),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn suback_carries_return_codes() {
        let mut buf = BytesMut::from(&[0x90, 0x03, 0x00, 0x01, 0x80][..]);
        match decode(&mut buf).unwrap() {
            Some(Packet::Suback { packet_id, codes }) => {
                assert_eq!(packet_id, 1);
                assert_eq!(codes, vec![SUBACK_FAILURE]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_packet_types() {
        // 0x60 is PUBREL territory, which a QoS 1 subscriber never sees.
        let mut buf = BytesMut::from(&[0x60, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            decode(&mut buf),
            Err(CodecError::UnsupportedPacket(0x60))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x00, 0xD0, 0x00][..]);
        assert!(matches!(
            decode(&mut buf).unwrap(),
            Some(Packet::Connack { .. })
        ));
        assert!(matches!(decode(&mut buf).unwrap(), Some(Packet::Pingresp)));
        assert!(decode(&mut buf).unwrap().is_none());
    }
}
