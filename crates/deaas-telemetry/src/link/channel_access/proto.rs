//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel Access message framing and value decoding."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Channel Access messages (protocol minor version 13).
//!
//! Every message is a big-endian header followed by a payload padded to a
//! multiple of eight bytes. Payloads of 64 KiB or more, or element counts of
//! 65535 or more, use the extended header.
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::model::MetricValue;

pub const DEFAULT_SERVER_PORT: u16 = 5064;
pub const MINOR_VERSION: u16 = 13;

const HEADER_LEN: usize = 16;
const EXTENDED_HEADER_LEN: usize = 24;
const EXTENDED_MARKER: u16 = 0xFFFF;
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;
const MAX_STRING: usize = 40;

/// Search requests that should not be answered with "not found".
const DONT_REPLY: u16 = 5;
/// `DBE_VALUE | DBE_ALARM`.
const MONITOR_MASK: u16 = 0x1 | 0x4;
/// `ECA_NORMAL` status carried by successful event reports.
pub const ECA_NORMAL: u32 = 1;

pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const SEARCH: u16 = 6;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const CREATE_CHAN: u16 = 18;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ACCESS_RIGHTS: u16 = 22;
    pub const ECHO: u16 = 23;
    pub const CREATE_CH_FAIL: u16 = 26;
    pub const SERVER_DISCONN: u16 = 27;
}

/// Plain DBR value types (no status or time metadata).
pub mod dbr {
    pub const STRING: u16 = 0;
    pub const SHORT: u16 = 1;
    pub const FLOAT: u16 = 2;
    pub const ENUM: u16 = 3;
    pub const CHAR: u16 = 4;
    pub const LONG: u16 = 5;
    pub const DOUBLE: u16 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub command: u16,
    pub payload_len: u32,
    pub data_type: u16,
    pub count: u32,
    pub param1: u32,
    pub param2: u32,
}

impl Header {
    fn new(command: u16) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Parse the header at the front of `buf`, returning it with its length.
    pub fn decode(buf: &[u8]) -> Option<(Header, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut cursor = buf;
        let command = cursor.get_u16();
        let short_len = cursor.get_u16();
        let data_type = cursor.get_u16();
        let short_count = cursor.get_u16();
        let param1 = cursor.get_u32();
        let param2 = cursor.get_u32();
        let mut header = Header {
            command,
            payload_len: u32::from(short_len),
            data_type,
            count: u32::from(short_count),
            param1,
            param2,
        };
        if short_len == EXTENDED_MARKER && short_count == 0 {
            if buf.len() < EXTENDED_HEADER_LEN {
                return None;
            }
            header.payload_len = cursor.get_u32();
            header.count = cursor.get_u32();
            return Some((header, EXTENDED_HEADER_LEN));
        }
        Some((header, HEADER_LEN))
    }

    fn put(mut self, buf: &mut BytesMut, payload: &[u8]) {
        let padded = padded_len(payload.len());
        self.payload_len = padded as u32;
        let extended =
            padded >= usize::from(EXTENDED_MARKER) || self.count >= u32::from(EXTENDED_MARKER);
        buf.reserve(EXTENDED_HEADER_LEN + padded);
        buf.put_u16(self.command);
        if extended {
            buf.put_u16(EXTENDED_MARKER);
            buf.put_u16(self.data_type);
            buf.put_u16(0);
        } else {
            buf.put_u16(self.payload_len as u16);
            buf.put_u16(self.data_type);
            buf.put_u16(self.count as u16);
        }
        buf.put_u32(self.param1);
        buf.put_u32(self.param2);
        if extended {
            buf.put_u32(self.payload_len);
            buf.put_u32(self.count);
        }
        buf.put_slice(payload);
        buf.put_bytes(0, padded - payload.len());
    }
}

/// A decoded message. The payload keeps the sender's padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

/// Split one complete message off the front of `buf`.
///
/// Returns `Ok(None)` until enough bytes have arrived.
pub fn take_message(buf: &mut BytesMut) -> io::Result<Option<Message>> {
    let Some((header, header_len)) = Header::decode(buf) else {
        return Ok(None);
    };
    let payload_len = header.payload_len as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("channel-access payload of {payload_len} bytes exceeds limit"),
        ));
    }
    if buf.len() < header_len + payload_len {
        return Ok(None);
    }
    buf.advance(header_len);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(Message { header, payload }))
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(8) * 8
}

fn name_payload(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

pub fn put_version(buf: &mut BytesMut) {
    let mut header = Header::new(command::VERSION);
    header.count = u32::from(MINOR_VERSION);
    header.put(buf, &[]);
}

pub fn put_search(buf: &mut BytesMut, cid: u32, pv: &str) {
    let mut header = Header::new(command::SEARCH);
    header.data_type = DONT_REPLY;
    header.count = u32::from(MINOR_VERSION);
    header.param1 = cid;
    header.param2 = cid;
    header.put(buf, &name_payload(pv));
}

pub fn put_client_name(buf: &mut BytesMut, user: &str) {
    Header::new(command::CLIENT_NAME).put(buf, &name_payload(user));
}

pub fn put_host_name(buf: &mut BytesMut, host: &str) {
    Header::new(command::HOST_NAME).put(buf, &name_payload(host));
}

pub fn put_create_channel(buf: &mut BytesMut, cid: u32, pv: &str) {
    let mut header = Header::new(command::CREATE_CHAN);
    header.param1 = cid;
    header.param2 = u32::from(MINOR_VERSION);
    header.put(buf, &name_payload(pv));
}

pub fn put_event_add(buf: &mut BytesMut, sid: u32, subscription: u32, dbr_type: u16) {
    let mut header = Header::new(command::EVENT_ADD);
    header.data_type = dbr_type;
    header.count = 1;
    header.param1 = sid;
    header.param2 = subscription;
    let mut payload = BytesMut::with_capacity(16);
    // Deadband low, high and timeout are unused by servers.
    payload.put_f32(0.0);
    payload.put_f32(0.0);
    payload.put_f32(0.0);
    payload.put_u16(MONITOR_MASK);
    payload.put_u16(0);
    header.put(buf, &payload);
}

pub fn put_event_cancel(buf: &mut BytesMut, sid: u32, subscription: u32, dbr_type: u16) {
    let mut header = Header::new(command::EVENT_CANCEL);
    header.data_type = dbr_type;
    header.count = 1;
    header.param1 = sid;
    header.param2 = subscription;
    header.put(buf, &[]);
}

pub fn put_clear_channel(buf: &mut BytesMut, sid: u32, cid: u32) {
    let mut header = Header::new(command::CLEAR_CHANNEL);
    header.param1 = sid;
    header.param2 = cid;
    header.put(buf, &[]);
}

pub fn put_echo(buf: &mut BytesMut) {
    Header::new(command::ECHO).put(buf, &[]);
}

/// Server circuit announced by a search reply received from `from`.
///
/// An address of all ones (or zero) means "the sender's address".
pub fn search_reply_server(header: &Header, from: SocketAddr) -> SocketAddr {
    let ip = match header.param1 {
        0 | u32::MAX => from.ip(),
        raw => IpAddr::V4(Ipv4Addr::from(raw)),
    };
    SocketAddr::new(ip, header.data_type)
}

/// DBR type requested for a channel whose native type is `native`.
pub fn monitor_type(native: u16) -> u16 {
    match native {
        dbr::STRING => dbr::STRING,
        dbr::SHORT | dbr::ENUM | dbr::CHAR | dbr::LONG => dbr::LONG,
        _ => dbr::DOUBLE,
    }
}

/// First element of a plain DBR payload.
pub fn decode_value(dbr_type: u16, count: u32, payload: &[u8]) -> Option<MetricValue> {
    if count == 0 {
        return None;
    }
    let mut cursor = payload;
    let value = match dbr_type {
        dbr::DOUBLE if cursor.remaining() >= 8 => MetricValue::Float(cursor.get_f64()),
        dbr::FLOAT if cursor.remaining() >= 4 => MetricValue::Float(f64::from(cursor.get_f32())),
        dbr::LONG if cursor.remaining() >= 4 => MetricValue::Int(i64::from(cursor.get_i32())),
        dbr::SHORT if cursor.remaining() >= 2 => MetricValue::Int(i64::from(cursor.get_i16())),
        dbr::ENUM if cursor.remaining() >= 2 => MetricValue::Int(i64::from(cursor.get_u16())),
        dbr::CHAR if cursor.remaining() >= 1 => MetricValue::Int(i64::from(cursor.get_u8())),
        dbr::STRING => {
            let raw = &payload[..payload.len().min(MAX_STRING)];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            MetricValue::Text(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_is_padded_and_tagged_with_cid() {
        let mut buf = BytesMut::new();
        put_search(&mut buf, 7, "PLANT1:BUS0:PANEL:001:VOLTAGE");
        // 29 name bytes + NUL round up to 32.
        assert_eq!(buf.len(), 16 + 32);
        assert_eq!(&buf[..2], &[0, 6]);
        assert_eq!(&buf[2..4], &[0, 32]);
        assert_eq!(&buf[4..6], &[0, 5]);
        assert_eq!(&buf[6..8], &[0, 13]);
        assert_eq!(&buf[8..16], &[0, 0, 0, 7, 0, 0, 0, 7]);
        assert_eq!(&buf[16..45], b"PLANT1:BUS0:PANEL:001:VOLTAGE");
        assert!(buf[45..].iter().all(|&b| b == 0));
    }

    #[test]
    fn take_message_waits_for_full_payload() {
        let mut encoded = BytesMut::new();
        put_create_channel(&mut encoded, 3, "PV");
        let mut inbound = BytesMut::from(&encoded[..20]);
        assert_eq!(take_message(&mut inbound).unwrap(), None);

        inbound.extend_from_slice(&encoded[20..]);
        put_echo(&mut inbound);
        let first = take_message(&mut inbound).unwrap().unwrap();
        assert_eq!(first.header.command, command::CREATE_CHAN);
        assert_eq!(first.header.param1, 3);
        assert_eq!(&first.payload[..3], b"PV\0");
        let second = take_message(&mut inbound).unwrap().unwrap();
        assert_eq!(second.header.command, command::ECHO);
        assert!(inbound.is_empty());
    }

    #[test]
    fn extended_header_carries_large_counts() {
        let mut raw = BytesMut::new();
        raw.put_u16(command::EVENT_ADD);
        raw.put_u16(EXTENDED_MARKER);
        raw.put_u16(dbr::DOUBLE);
        raw.put_u16(0);
        raw.put_u32(ECA_NORMAL);
        raw.put_u32(9);
        raw.put_u32(8);
        raw.put_u32(100_000);
        raw.put_f64(1.5);

        let message = take_message(&mut raw).unwrap().unwrap();
        assert_eq!(message.header.count, 100_000);
        assert_eq!(
            decode_value(message.header.data_type, message.header.count, &message.payload),
            Some(MetricValue::Float(1.5))
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u16(command::EVENT_ADD);
        raw.put_u16(EXTENDED_MARKER);
        raw.put_u16(dbr::DOUBLE);
        raw.put_u16(0);
        raw.put_u64(0);
        raw.put_u32(u32::MAX);
        raw.put_u32(1);
        assert!(take_message(&mut raw).is_err());
    }

    #[test]
    fn values_decode_per_dbr_type() {
        assert_eq!(
            decode_value(dbr::LONG, 1, &(-2i32).to_be_bytes()),
            Some(MetricValue::Int(-2))
        );
        assert_eq!(
            decode_value(dbr::FLOAT, 1, &0.5f32.to_be_bytes()),
            Some(MetricValue::Float(0.5))
        );
        let mut text = [0u8; 40];
        text[..5].copy_from_slice(b"FAULT");
        assert_eq!(
            decode_value(dbr::STRING, 1, &text),
            Some(MetricValue::Text("FAULT".into()))
        );
        assert_eq!(decode_value(dbr::DOUBLE, 1, &[0; 4]), None);
        assert_eq!(decode_value(dbr::DOUBLE, 0, &[0; 8]), None);
    }

    #[test]
    fn integer_channels_are_monitored_as_long() {
        assert_eq!(monitor_type(dbr::ENUM), dbr::LONG);
        assert_eq!(monitor_type(dbr::FLOAT), dbr::DOUBLE);
        assert_eq!(monitor_type(dbr::STRING), dbr::STRING);
    }

    #[test]
    fn search_reply_defaults_to_sender_address() {
        let from: SocketAddr = "10.0.0.5:5064".parse().unwrap();
        let mut header = Header::new(command::SEARCH);
        header.data_type = 5070;
        header.param1 = u32::MAX;
        assert_eq!(search_reply_server(&header, from), "10.0.0.5:5070".parse().unwrap());

        header.param1 = u32::from(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(search_reply_server(&header, from), "10.0.0.9:5070".parse().unwrap());
    }
}
