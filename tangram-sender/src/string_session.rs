//! Compact textual session encoding for cross-process transfer.
//!
//! The record is the same one [`crate::storage`] persists, laid out as a
//! fixed binary block with a leading version byte and wrapped in URL-safe
//! base64 without padding. Encoding is deterministic; decoding failures are
//! explicit.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::storage::SessionData;

const VERSION: u8 = 1;

/// Errors from [`decode`].
#[derive(Clone, Debug, PartialEq)]
pub enum StringSessionError {
    /// The text is not valid base64.
    NotBase64,
    /// The payload is shorter than the fixed layout requires.
    Truncated,
    /// The leading version byte is unknown.
    UnsupportedVersion(u8),
    /// The endpoint field is not valid UTF-8.
    BadEndpoint,
}

impl std::fmt::Display for StringSessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotBase64 => write!(f, "string session is not valid base64"),
            Self::Truncated => write!(f, "string session payload truncated"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported string session version {v}"),
            Self::BadEndpoint => write!(f, "string session endpoint is not utf-8"),
        }
    }
}

impl std::error::Error for StringSessionError {}

/// Encode a session record.
pub fn encode(data: &SessionData) -> String {
    let endpoint = data.endpoint.as_bytes();
    let mut payload = Vec::with_capacity(1 + 256 + 8 + 8 + 4 + 2 + endpoint.len());
    payload.push(VERSION);
    payload.extend_from_slice(&data.auth_key);
    payload.extend_from_slice(&data.auth_key_hash);
    payload.extend_from_slice(&data.salt.to_le_bytes());
    payload.extend_from_slice(&data.app_id.to_le_bytes());
    payload.extend_from_slice(&(endpoint.len() as u16).to_le_bytes());
    payload.extend_from_slice(endpoint);
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decode a session record produced by [`encode`].
pub fn decode(text: &str) -> Result<SessionData, StringSessionError> {
    let payload = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|_| StringSessionError::NotBase64)?;

    if payload.is_empty() {
        return Err(StringSessionError::Truncated);
    }
    if payload[0] != VERSION {
        return Err(StringSessionError::UnsupportedVersion(payload[0]));
    }
    if payload.len() < 1 + 256 + 8 + 8 + 4 + 2 {
        return Err(StringSessionError::Truncated);
    }

    let mut pos = 1usize;
    let mut auth_key = [0u8; 256];
    auth_key.copy_from_slice(&payload[pos..pos + 256]);
    pos += 256;
    let mut auth_key_hash = [0u8; 8];
    auth_key_hash.copy_from_slice(&payload[pos..pos + 8]);
    pos += 8;
    let salt = i64::from_le_bytes(payload[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let app_id = i32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let endpoint_len = u16::from_le_bytes(payload[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    if payload.len() < pos + endpoint_len {
        return Err(StringSessionError::Truncated);
    }
    let endpoint = String::from_utf8(payload[pos..pos + endpoint_len].to_vec())
        .map_err(|_| StringSessionError::BadEndpoint)?;

    Ok(SessionData { auth_key, auth_key_hash, salt, endpoint, app_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionData {
        SessionData {
            auth_key: [0x5c; 256],
            auth_key_hash: [8, 7, 6, 5, 4, 3, 2, 1],
            salt: 0x0102_0304_0506_0708,
            endpoint: "91.108.56.130:443".into(),
            app_id: 17349,
        }
    }

    #[test]
    fn round_trip() {
        let text = encode(&sample());
        assert_eq!(decode(&text).unwrap(), sample());
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode(&sample()), encode(&sample()));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode("!!!not base64!!!"), Err(StringSessionError::NotBase64));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut payload = URL_SAFE_NO_PAD.decode(encode(&sample())).unwrap();
        payload[0] = 99;
        let text = URL_SAFE_NO_PAD.encode(payload);
        assert_eq!(decode(&text), Err(StringSessionError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let payload = URL_SAFE_NO_PAD.decode(encode(&sample())).unwrap();
        let text = URL_SAFE_NO_PAD.encode(&payload[..40]);
        assert_eq!(decode(&text), Err(StringSessionError::Truncated));
    }
}
