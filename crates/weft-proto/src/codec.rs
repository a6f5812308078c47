use std::io::Cursor;

use rmpv::Value;

use crate::errors::ProtoError;
use crate::rpc::RpcMessage;

/// Hard cap on a single encoded frame. Frames larger than this are rejected
/// on encode, and an inbound accumulator that grows past it without yielding
/// a complete frame is a protocol error.
pub const MESSAGE_SIZE_MAX: usize = 16 * 1024 * 1024;

/// Encode one RPC frame to bytes.
///
/// Encoding is deterministic: the same message always produces the same
/// bytes. Frames larger than `MESSAGE_SIZE_MAX` are rejected.
pub fn encode_frame(msg: &RpcMessage) -> Result<Vec<u8>, ProtoError> {
    let value = msg.to_value();
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value)
        .map_err(|e| ProtoError::InvalidFormat(e.to_string()))?;
    if buf.len() > MESSAGE_SIZE_MAX {
        return Err(ProtoError::MessageTooLarge(buf.len()));
    }
    Ok(buf)
}

/// Decode one RPC frame from the front of `buf`.
///
/// Returns `Ok(Some((message, consumed)))` when a complete frame is present,
/// `Ok(None)` when more input is needed (no state is consumed), and
/// `Err(InvalidFormat)` on malformed input. Callers bound `buf` against
/// `MESSAGE_SIZE_MAX` before retrying a `None`, so a declared length can
/// never force an allocation beyond the frame cap.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(RpcMessage, usize)>, ProtoError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let consumed = cursor.position() as usize;
            let msg = RpcMessage::from_value(value)?;
            Ok(Some((msg, consumed)))
        }
        Err(e) if is_truncated(&e) => Ok(None),
        Err(e) => Err(ProtoError::InvalidFormat(e.to_string())),
    }
}

/// Decode a bare value (used by tests and tools that inspect params).
pub fn decode_value(buf: &[u8]) -> Result<Option<(Value, usize)>, ProtoError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(e) if is_truncated(&e) => Ok(None),
        Err(e) => Err(ProtoError::InvalidFormat(e.to_string())),
    }
}

/// A decode error caused by the buffer ending mid-value, as opposed to
/// genuinely malformed bytes.
fn is_truncated(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
