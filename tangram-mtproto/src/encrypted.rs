//! The secure channel: everything after the key exchange travels through it.

use tangram_crypto::{decrypt_packet, encrypt_packet, AuthKey, DequeBuffer, Side};

/// Errors that can occur while decoding a server frame.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeError {
    /// The crypto layer rejected the frame.
    Crypto(tangram_crypto::DecryptError),
    /// The decrypted plaintext is too short to contain the fixed header.
    Truncated,
    /// The frame belongs to a different session.
    SessionMismatch,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::Truncated => write!(f, "inner plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<tangram_crypto::DecryptError> for DecodeError {
    fn from(e: tangram_crypto::DecryptError) -> Self {
        Self::Crypto(e)
    }
}

/// The payload recovered from a decrypted server frame.
#[derive(Clone, Debug)]
pub struct DecryptedMessage {
    /// Salt the server stamped on the frame.
    pub salt: i64,
    /// Message identifier of the inner message.
    pub msg_id: i64,
    /// Sequence number of the inner message.
    pub seq_no: i32,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

/// Encodes and decodes encrypted frames for one session.
///
/// The channel owns the auth key and the client-chosen session id. The
/// server salt is deliberately *not* stored here: the caller passes it per
/// message, which keeps the receive loop the one place that ever changes it.
#[derive(Clone)]
pub struct SecureChannel {
    auth_key: AuthKey,
    session_id: i64,
}

impl SecureChannel {
    /// Create a channel with a freshly generated session id.
    pub fn new(auth_key: AuthKey) -> Self {
        let mut random = [0u8; 8];
        getrandom::getrandom(&mut random).expect("os rng unavailable");
        Self {
            auth_key,
            session_id: i64::from_le_bytes(random),
        }
    }

    /// Create a channel with an explicit session id.
    pub fn with_session_id(auth_key: AuthKey, session_id: i64) -> Self {
        Self { auth_key, session_id }
    }

    /// The client-chosen session id.
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// The auth key bound to this channel.
    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// Encrypt one outbound message into a wire-ready frame.
    ///
    /// Plaintext layout before encryption:
    ///
    /// ```text
    /// salt:       i64
    /// session_id: i64
    /// msg_id:     i64
    /// seq_no:     i32
    /// length:     u32
    /// body:       [u8; length]
    /// padding
    /// ```
    pub fn encode(&self, salt: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let inner_len = 8 + 8 + 8 + 4 + 4 + body.len();
        // Headroom for key hash + msg key.
        let mut buf = DequeBuffer::with_capacity(inner_len, 32);
        buf.extend(salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());

        encrypt_packet(&mut buf, &self.auth_key, Side::Client);
        buf.into_vec()
    }

    /// Decrypt and validate one inbound frame.
    pub fn decode(&self, frame: &mut [u8]) -> Result<DecryptedMessage, DecodeError> {
        let plaintext = decrypt_packet(frame, &self.auth_key, Side::Server)?;
        if plaintext.len() < 32 {
            return Err(DecodeError::Truncated);
        }

        let salt = i64::from_le_bytes(plaintext[..8].try_into().unwrap());
        let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

        if session_id != self.session_id {
            return Err(DecodeError::SessionMismatch);
        }
        if plaintext.len() < 32 + body_len {
            return Err(DecodeError::Truncated);
        }

        Ok(DecryptedMessage {
            salt,
            msg_id,
            seq_no,
            body: plaintext[32..32 + body_len].to_vec(),
        })
    }
}
