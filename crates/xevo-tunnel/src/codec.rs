//! Binary session configuration codec
//!
//! The configuration request travels as a single length-prefixed binary
//! frame: client version string, then a channel descriptor list, each entry
//! carrying the reverse flag and both endpoint descriptors. All lengths are
//! u32 big-endian. Decoding tolerates unknown trailing bytes so that newer
//! peers can append fields without breaking older ones.

use crate::descriptor::{ChannelDescriptor, EndpointDescriptor, EndpointRole, EndpointType};
use crate::error::{Result, TunnelError};

/// Upper bound on any single encoded string, to reject absurd allocations
const MAX_STRING_LEN: usize = 1 << 20;
/// Upper bound on the number of routes in one configuration
const MAX_CHANNELS: usize = 1024;

/// A session configuration request: client version plus the full route list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfigRequest {
    /// Version string of the requesting client
    pub version: String,
    /// Ordered route list; the index is used in logs only
    pub channels: Vec<ChannelDescriptor>,
}

impl SessionConfigRequest {
    /// Encode to the binary wire form
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        put_string(&mut buf, &self.version);
        put_u32(&mut buf, self.channels.len() as u32);
        for chd in &self.channels {
            buf.push(u8::from(chd.reverse));
            put_descriptor(&mut buf, &chd.stub);
            put_descriptor(&mut buf, &chd.skeleton);
        }
        buf
    }

    /// Decode from the binary wire form
    ///
    /// Unknown bytes after the declared channel list are ignored.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on truncation, oversized fields, or
    /// unrecognized role/type tokens.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor.take_string()?;
        let count = cursor.take_u32()? as usize;
        if count > MAX_CHANNELS {
            return Err(TunnelError::protocol(format!(
                "too many channel descriptors: {count}"
            )));
        }
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            let reverse = cursor.take_u8()? != 0;
            let stub = take_descriptor(&mut cursor)?;
            let skeleton = take_descriptor(&mut cursor)?;
            channels.push(ChannelDescriptor {
                reverse,
                stub,
                skeleton,
            });
        }
        Ok(Self { version, channels })
    }
}

/// Wrap an encoded payload in the outer stream frame (u32 length prefix)
#[must_use]
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    put_u32(&mut buf, payload.len() as u32);
    buf.extend_from_slice(payload);
    buf
}

/// Try to extract one complete frame from an accumulation buffer.
///
/// Returns `Ok(None)` while more bytes are needed, or the payload slice
/// bounds once the frame is complete.
///
/// # Errors
///
/// Returns a protocol error if the declared length is implausibly large.
pub fn try_deframe(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_STRING_LEN * 4 {
        return Err(TunnelError::protocol(format!("frame too large: {len}")));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((4, 4 + len)))
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn put_descriptor(buf: &mut Vec<u8>, descriptor: &EndpointDescriptor) {
    buf.push(descriptor.role.to_byte());
    put_string(buf, descriptor.kind.token());
    put_string(buf, &descriptor.path);
}

fn take_descriptor(cursor: &mut Cursor<'_>) -> Result<EndpointDescriptor> {
    let role = EndpointRole::from_byte(cursor.take_u8()?)?;
    let kind = EndpointType::from_token(&cursor.take_string()?)?;
    let path = cursor.take_string()?;
    Ok(EndpointDescriptor { role, kind, path })
}

/// Bounds-checked reader over the wire buffer
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| TunnelError::protocol("truncated configuration payload"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_string(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(TunnelError::protocol(format!("string too long: {len}")));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TunnelError::protocol(format!("invalid UTF-8 in payload: {e}")))
    }
}
