//! The plaintext envelope used during key exchange, before any auth key
//! exists.

use tangram_tl::deserialize::Error as TlError;

/// An unencrypted protocol message.
///
/// Wire layout:
///
/// ```text
/// auth_key_id: i64   (always 0 — marks the frame as plaintext)
/// msg_id:      i64
/// length:      u32
/// body:        [u8; length]
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct PlainMessage {
    /// Identifier assigned to this message.
    pub msg_id: i64,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

impl PlainMessage {
    /// Frame `body` under `msg_id`.
    pub fn new(msg_id: i64, body: Vec<u8>) -> Self {
        Self { msg_id, body }
    }

    /// Serialize into the plaintext wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.msg_id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a plaintext frame. Fails if the zero key id is missing or the
    /// declared length overruns the frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, TlError> {
        if frame.len() < 20 {
            return Err(TlError::UnexpectedEof);
        }
        let key_id = i64::from_le_bytes(frame[..8].try_into().unwrap());
        if key_id != 0 {
            return Err(TlError::UnexpectedConstructor { id: key_id as u32 });
        }
        let msg_id = i64::from_le_bytes(frame[8..16].try_into().unwrap());
        let len = u32::from_le_bytes(frame[16..20].try_into().unwrap()) as usize;
        if frame.len() < 20 + len {
            return Err(TlError::UnexpectedEof);
        }
        Ok(Self { msg_id, body: frame[20..20 + len].to_vec() })
    }
}
