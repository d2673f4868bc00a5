//! Wire protocol shared by the TCP chat streams and the UDP beacons.
//!
//! Both transports use the same well-known port and single-byte opcodes:
//!
//! | Opcode | Transport | Payload |
//! |---|---|---|
//! | `SERVER_INFO_REQUEST` (1) | UDP | none |
//! | `SERVER_INFO` (2) | UDP | `age:u32 ‖ uid:u64 ‖ crc32:u32` |
//! | `SAY` (3) | TCP | `len:u16 ‖ utf16le(msg)` |
//! | `SET_NAME` (4) | TCP | `len:u8 ‖ utf16le(name)` |
//! | `SAY_DISPATCH` (5) | TCP | `nameLen:u8 ‖ name ‖ msgLen:u16 ‖ msg` |
//!
//! All integers are little-endian and all strings are UTF-16LE without a
//! BOM. A beacon datagram is exactly 17 bytes; its CRC-32 (IEEE) covers the
//! 12 bytes of `age ‖ uid`. Anything with the wrong length, opcode, or CRC
//! is silently dropped by the receiving side.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ChatError;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Well-known port shared by the TCP server and the UDP discovery traffic.
pub const DEFAULT_PORT: u16 = 43993;

/// UDP: a client asking every server on the LAN to announce itself.
pub const OP_SERVER_INFO_REQUEST: u8 = 1;
/// UDP: a server announcing `(age, uid)` to the broadcast domain.
pub const OP_SERVER_INFO: u8 = 2;
/// TCP: a client submitting a chat message.
pub const OP_SAY: u8 = 3;
/// TCP: a client registering or changing its display name.
pub const OP_SET_NAME: u8 = 4;
/// TCP: the server fanning a named message out to a client.
pub const OP_SAY_DISPATCH: u8 = 5;

/// Total size of a `SERVER_INFO` datagram: opcode + age + uid + crc.
pub const BEACON_LEN: usize = 17;

/// A name must encode to at most this many UTF-16LE bytes (one length octet).
pub const MAX_NAME_BYTES: usize = 255;

/// A message must encode to at most this many UTF-16LE bytes (u16 length).
pub const MAX_MESSAGE_BYTES: usize = 65_535;

// ────────────────────────────────────────────────────────────────────────────
// UTF-16LE helpers
// ────────────────────────────────────────────────────────────────────────────

/// Encode `s` as UTF-16LE without a BOM.
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode UTF-16LE bytes, replacing broken surrogate pairs. A trailing odd
/// byte is ignored.
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Number of bytes `s` occupies once encoded as UTF-16LE.
pub fn utf16le_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

/// Trim and validate a chat message at the public API boundary.
///
/// Returns the trimmed owned string, or `InvalidArgument` when the result is
/// empty or its UTF-16LE encoding exceeds [`MAX_MESSAGE_BYTES`]. Performed
/// synchronously so no invalid bytes ever reach a socket.
pub fn validate_message(raw: &str) -> Result<String, ChatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidArgument("message is empty"));
    }
    if utf16le_len(trimmed) > MAX_MESSAGE_BYTES {
        return Err(ChatError::InvalidArgument(
            "message exceeds 65535 encoded bytes",
        ));
    }
    Ok(trimmed.to_owned())
}

/// Trim and validate a display name. Same contract as [`validate_message`]
/// with the [`MAX_NAME_BYTES`] limit.
pub fn validate_name(raw: &str) -> Result<String, ChatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidArgument("name is empty"));
    }
    if utf16le_len(trimmed) > MAX_NAME_BYTES {
        return Err(ChatError::InvalidArgument(
            "name exceeds 255 encoded bytes",
        ));
    }
    Ok(trimmed.to_owned())
}

// ────────────────────────────────────────────────────────────────────────────
// UDP beacon codec
// ────────────────────────────────────────────────────────────────────────────

/// The payload of a `SERVER_INFO` beacon: how long the sending server has
/// been alive (whole seconds) and its random 64-bit identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub age_secs: u32,
    pub uid: u64,
}

/// Encode a beacon into its fixed 17-byte datagram.
pub fn encode_beacon(beacon: &Beacon) -> [u8; BEACON_LEN] {
    let mut out = [0u8; BEACON_LEN];
    out[0] = OP_SERVER_INFO;
    out[1..5].copy_from_slice(&beacon.age_secs.to_le_bytes());
    out[5..13].copy_from_slice(&beacon.uid.to_le_bytes());
    let crc = crc32fast::hash(&out[1..13]);
    out[13..17].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Try to decode a beacon from a raw datagram.
///
/// Returns `None` when the length is not exactly [`BEACON_LEN`], the opcode
/// is not `SERVER_INFO`, or the CRC-32 over bytes 1..13 does not match bytes
/// 13..17. Dropping malformed datagrams here keeps the election workers free
/// of error handling for stray broadcast traffic.
pub fn decode_beacon(datagram: &[u8]) -> Option<Beacon> {
    if datagram.len() != BEACON_LEN || datagram[0] != OP_SERVER_INFO {
        return None;
    }
    let age_secs = u32::from_le_bytes(datagram[1..5].try_into().ok()?);
    let uid = u64::from_le_bytes(datagram[5..13].try_into().ok()?);
    let crc = u32::from_le_bytes(datagram[13..17].try_into().ok()?);
    if crc32fast::hash(&datagram[1..13]) != crc {
        return None;
    }
    Some(Beacon { age_secs, uid })
}

// ────────────────────────────────────────────────────────────────────────────
// TCP frame encoders
// ────────────────────────────────────────────────────────────────────────────

/// Encode a `SAY` frame. `msg` must already be validated.
pub fn encode_say(msg: &str) -> Vec<u8> {
    let payload = encode_utf16le(msg);
    debug_assert!(payload.len() <= MAX_MESSAGE_BYTES);
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(OP_SAY);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Encode a `SET_NAME` frame. `name` must already be validated.
pub fn encode_set_name(name: &str) -> Vec<u8> {
    let payload = encode_utf16le(name);
    debug_assert!(payload.len() <= MAX_NAME_BYTES);
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(OP_SET_NAME);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(&payload);
    frame
}

/// Encode a `SAY_DISPATCH` frame carrying a named message to a client.
pub fn encode_say_dispatch(name: &str, msg: &str) -> Vec<u8> {
    let name_bytes = encode_utf16le(name);
    let msg_bytes = encode_utf16le(msg);
    debug_assert!(name_bytes.len() <= MAX_NAME_BYTES);
    debug_assert!(msg_bytes.len() <= MAX_MESSAGE_BYTES);
    let mut frame = Vec::with_capacity(4 + name_bytes.len() + msg_bytes.len());
    frame.push(OP_SAY_DISPATCH);
    frame.push(name_bytes.len() as u8);
    frame.extend_from_slice(&name_bytes);
    frame.extend_from_slice(&(msg_bytes.len() as u16).to_le_bytes());
    frame.extend_from_slice(&msg_bytes);
    frame
}

// ────────────────────────────────────────────────────────────────────────────
// TCP frame readers
// ────────────────────────────────────────────────────────────────────────────
//
// Each reader picks up after the opcode byte has already been consumed.
// `read_exact` re-attempts partial reads of the fixed framing, so a frame is
// either fully read or fails with an I/O error.

/// Read the payload of a `SAY` frame: `len:u16 ‖ utf16le(msg)`.
pub async fn read_say_payload<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let len = reader.read_u16_le().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(decode_utf16le(&buf))
}

/// Read the payload of a `SET_NAME` frame: `len:u8 ‖ utf16le(name)`.
pub async fn read_name_payload<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let len = reader.read_u8().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(decode_utf16le(&buf))
}

/// Read the payload of a `SAY_DISPATCH` frame: name then message.
pub async fn read_say_dispatch<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<(String, String)> {
    let name = read_name_payload(reader).await?;
    let msg = read_say_payload(reader).await?;
    Ok((name, msg))
}
