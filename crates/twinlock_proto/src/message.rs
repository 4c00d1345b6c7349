//! Message, handshake and snapshot codecs.
//!
//! A message body is
//! `[command:u8][sequence:i32][key:str][identity:str][timeout:i32]`, where a
//! string is `[len:i16][utf8]` and `len == -1` encodes an absent string. Any
//! bytes after the body are an opaque extra payload (lock table snapshots ride
//! there). All integers are big-endian.

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: i32 = -1;

/// Fixed size of a body with both strings absent.
const MIN_BODY_LEN: usize = 1 + 4 + 2 + 2 + 4;

/// Command byte carried by every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Enter = 0x00,
    Exit = 0x01,
    GetAllInfo = 0x02,
    ForceFree = 0xF0,
    Heartbeat = 0xFA,
    AckEnter = 0xFB,
    AckExit = 0xFC,
    Timeout = 0xFE,
    Error = 0xFF,
}

impl Command {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x00 => Command::Enter,
            0x01 => Command::Exit,
            0x02 => Command::GetAllInfo,
            0xF0 => Command::ForceFree,
            0xFA => Command::Heartbeat,
            0xFB => Command::AckEnter,
            0xFC => Command::AckExit,
            0xFE => Command::Timeout,
            0xFF => Command::Error,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub sequence: i32,
    pub key: Option<String>,
    pub identity: Option<String>,
    /// Milliseconds, or [`INFINITE_TIMEOUT`].
    pub timeout: i32,
}

impl Message {
    pub fn new(command: Command, sequence: i32) -> Self {
        Self {
            command,
            sequence,
            key: None,
            identity: None,
            timeout: INFINITE_TIMEOUT,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout = timeout_ms;
        self
    }

    /// Build the reply to this request, echoing sequence, key and identity.
    pub fn reply(&self, command: Command) -> Self {
        Self {
            command,
            sequence: self.sequence,
            key: self.key.clone(),
            identity: self.identity.clone(),
            timeout: self.timeout,
        }
    }

    pub fn key_str(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    pub fn identity_str(&self) -> &str {
        self.identity.as_deref().unwrap_or_default()
    }
}

/// Encode `message` followed by an optional extra payload.
pub fn encode_message(message: &Message, extra: Option<&[u8]>) -> Result<Bytes, WireError> {
    let key_len = message.key.as_ref().map_or(0, String::len);
    let identity_len = message.identity.as_ref().map_or(0, String::len);
    let extra_len = extra.map_or(0, <[u8]>::len);
    let mut out = BytesMut::with_capacity(MIN_BODY_LEN + key_len + identity_len + extra_len);
    out.put_u8(message.command.as_u8());
    out.put_i32(message.sequence);
    put_str(&mut out, message.key.as_deref())?;
    put_str(&mut out, message.identity.as_deref())?;
    out.put_i32(message.timeout);
    if let Some(extra) = extra {
        out.put_slice(extra);
    }
    Ok(out.freeze())
}

/// Decode one message body and return it together with the trailing payload.
pub fn decode_message(mut payload: Bytes) -> Result<(Message, Bytes), WireError> {
    ensure_remaining(&payload, 1 + 4, "message header")?;
    let command = Command::from_u8(payload.get_u8())?;
    let sequence = payload.get_i32();
    let key = get_str(&mut payload)?;
    let identity = get_str(&mut payload)?;
    ensure_remaining(&payload, 4, "message timeout")?;
    let timeout = payload.get_i32();
    Ok((
        Message {
            command,
            sequence,
            key,
            identity,
            timeout,
        },
        payload,
    ))
}

/// Kind of peer announced in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkMode {
    Client = 0,
    Server = 1,
}

impl LinkMode {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(LinkMode::Client),
            1 => Ok(LinkMode::Server),
            other => Err(WireError::UnknownLinkMode(other)),
        }
    }
}

/// First payload on every connection: `[linkMode:1][identity-utf8]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub mode: LinkMode,
    pub identity: String,
}

impl Handshake {
    pub fn new(mode: LinkMode, identity: impl Into<String>) -> Self {
        Self {
            mode,
            identity: identity.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.identity.len());
        out.put_u8(self.mode as u8);
        out.put_slice(self.identity.as_bytes());
        out.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        ensure_remaining(&payload, 1, "handshake")?;
        let mode = LinkMode::from_u8(payload.get_u8())?;
        let identity = String::from_utf8(payload.to_vec()).map_err(|_| WireError::InvalidUtf8)?;
        if identity.is_empty() {
            return Err(WireError::Malformed("handshake identity is empty"));
        }
        Ok(Self { mode, identity })
    }
}

/// One lock table row as carried by a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub identity: Option<String>,
    pub available: bool,
}

/// Encode a snapshot: `count:i32` then `{available:bool, key:str, identity:str}`.
pub fn encode_snapshot(rows: &[LockInfo]) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(4 + rows.len() * 16);
    let count = i32::try_from(rows.len()).map_err(|_| WireError::Malformed("snapshot too long"))?;
    out.put_i32(count);
    for row in rows {
        out.put_u8(row.available as u8);
        put_str(&mut out, Some(&row.key))?;
        put_str(&mut out, row.identity.as_deref())?;
    }
    Ok(out.freeze())
}

pub fn decode_snapshot(mut payload: Bytes) -> Result<Vec<LockInfo>, WireError> {
    ensure_remaining(&payload, 4, "snapshot count")?;
    let count = payload.get_i32();
    if count < 0 {
        return Err(WireError::Malformed("negative snapshot count"));
    }
    // Each row needs at least 5 bytes; cap the preallocation by what is buffered.
    let mut rows = Vec::with_capacity((count as usize).min(payload.remaining() / 5));
    for _ in 0..count {
        ensure_remaining(&payload, 1, "snapshot row")?;
        let available = payload.get_u8() != 0;
        let key = get_str(&mut payload)?.ok_or(WireError::Malformed("snapshot row without key"))?;
        let identity = get_str(&mut payload)?;
        rows.push(LockInfo {
            key,
            identity,
            available,
        });
    }
    Ok(rows)
}

/// Source of message sequence numbers, one per endpoint.
///
/// Values stay positive and wrap back to 1; uniqueness only has to hold among
/// calls outstanding at the same time.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI32,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> i32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let following = if current == i32::MAX { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange(current, following, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

fn put_str(out: &mut BytesMut, value: Option<&str>) -> Result<(), WireError> {
    match value {
        None => out.put_i16(-1),
        Some(s) => {
            let len = i16::try_from(s.len()).map_err(|_| WireError::StringTooLong(s.len()))?;
            out.put_i16(len);
            out.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn get_str(buf: &mut Bytes) -> Result<Option<String>, WireError> {
    ensure_remaining(buf, 2, "string length")?;
    let len = buf.get_i16();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(WireError::Malformed("negative string length"));
    }
    let len = len as usize;
    ensure_remaining(buf, len, "string bytes")?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| WireError::InvalidUtf8)
}

fn ensure_remaining(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated(what));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_with_absent_and_empty_strings() {
        let cases = [
            Message::new(Command::Enter, 1).with_key("L1").with_identity("A").with_timeout(1000),
            Message::new(Command::Exit, 2),
            Message::new(Command::AckExit, 3).with_key("").with_identity(""),
            Message::new(Command::Heartbeat, i32::MAX).with_identity("ünïcode"),
        ];
        for msg in cases {
            let bytes = encode_message(&msg, None).unwrap();
            let (decoded, rest) = decode_message(bytes).unwrap();
            assert_eq!(decoded, msg);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn absent_and_empty_strings_are_distinct_on_the_wire() {
        let absent = encode_message(&Message::new(Command::Enter, 1), None).unwrap();
        let empty = encode_message(&Message::new(Command::Enter, 1).with_key(""), None).unwrap();
        assert_eq!(&absent[5..7], &(-1i16).to_be_bytes());
        assert_eq!(&empty[5..7], &0i16.to_be_bytes());
    }

    #[test]
    fn extra_payload_is_returned_untouched() {
        let msg = Message::new(Command::GetAllInfo, 9);
        let bytes = encode_message(&msg, Some(b"tail")).unwrap();
        let (_, rest) = decode_message(bytes).unwrap();
        assert_eq!(rest, Bytes::from_static(b"tail"));
    }

    #[test]
    fn truncated_and_unknown_messages_fail() {
        let bytes = encode_message(&Message::new(Command::Enter, 1).with_key("abc"), None).unwrap();
        let short = bytes.slice(..bytes.len() - 2);
        assert!(matches!(decode_message(short), Err(WireError::Truncated(_))));

        let mut raw = BytesMut::from(&bytes[..]);
        raw[0] = 0x42;
        assert!(matches!(
            decode_message(raw.freeze()),
            Err(WireError::UnknownCommand(0x42))
        ));
    }

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake::new(LinkMode::Server, "node-b");
        let bytes = hs.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(Handshake::decode(bytes).unwrap(), hs);
        assert!(Handshake::decode(Bytes::from_static(&[7, b'x'])).is_err());
        assert!(Handshake::decode(Bytes::from_static(&[0])).is_err());
    }

    #[test]
    fn snapshot_round_trip_keeps_free_rows() {
        let rows = vec![
            LockInfo {
                key: "a".into(),
                identity: Some("client-1".into()),
                available: false,
            },
            LockInfo {
                key: "b".into(),
                identity: None,
                available: true,
            },
        ];
        let bytes = encode_snapshot(&rows).unwrap();
        assert_eq!(&bytes[..4], &2i32.to_be_bytes());
        assert_eq!(decode_snapshot(bytes).unwrap(), rows);
    }

    #[test]
    fn snapshot_with_short_body_fails() {
        let mut raw = BytesMut::new();
        raw.put_i32(3);
        raw.put_u8(1);
        assert!(decode_snapshot(raw.freeze()).is_err());
    }

    #[test]
    fn sequence_wraps_to_one() {
        let seq = SequenceGenerator::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        seq.next.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(seq.next(), i32::MAX);
        assert_eq!(seq.next(), 1);
    }
}
