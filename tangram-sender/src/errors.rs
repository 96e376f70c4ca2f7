//! Error types for tangram-sender.

use std::{fmt, io};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error the server attached to a specific request.
///
/// Wire names often carry a trailing argument (`FLOOD_WAIT_30`,
/// `USER_MIGRATE_2`); parsing splits that off so callers can match on the
/// stable part and read the number separately.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// The wire name with any trailing `_<number>` argument removed.
    pub message: String,
    /// The trailing numeric argument, when the wire name carried one.
    pub extra: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reassemble the wire name the server actually sent.
        match self.extra {
            Some(extra) => write!(f, "rpc error {}: {}_{extra}", self.code, self.message),
            None => write!(f, "rpc error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Split a raw wire name like `"FLOOD_WAIT_30"` into message and
    /// argument.
    pub fn parse(code: i32, raw: &str) -> Self {
        let stem = raw.trim_end_matches(|c: char| c.is_ascii_digit());
        let argument = raw[stem.len()..].parse::<u32>().ok();
        match (stem.strip_suffix('_'), argument) {
            (Some(message), Some(extra)) => Self {
                code,
                message: message.to_string(),
                extra: Some(extra),
            },
            _ => Self { code, message: raw.to_string(), extra: None },
        }
    }

    /// Match the message against a pattern that may contain one `'*'`
    /// standing for any run of characters.
    ///
    /// - `err.is("FLOOD_WAIT")` — exact match
    /// - `err.is("PHONE_CODE_*")` — starts-with match
    /// - `err.is("*_INVALID")` — ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        match pattern.split_once('*') {
            None => self.message == pattern,
            Some((head, tail)) => {
                self.message.len() >= head.len() + tail.len()
                    && self.message.starts_with(head)
                    && self.message.ends_with(tail)
            }
        }
    }

    /// The advertised wait in seconds, if this is a flood-wait error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self.message.as_str() {
            "FLOOD_WAIT" => self.extra.map(u64::from),
            _ => None,
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from anything that talks to the server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// A short-packet error code arrived at the transport layer.
    Transport {
        /// The negative error code carried in the short packet.
        code: i32,
    },
    /// The byte stream produced a malformed or implausible frame.
    Framing(String),
    /// A frame failed decryption or validation.
    Crypto(tangram_mtproto::DecodeError),
    /// The server flagged the request itself as malformed.
    BadMessage {
        /// The code from the bad-msg notification.
        code: i32,
    },
    /// Network / I/O failure.
    Io(io::Error),
    /// Response deserialization failed.
    Deserialize(String),
    /// The request was abandoned (connection torn down, mailbox dropped).
    Dropped,
    /// The session was terminated while the request was pending.
    Terminated,
    /// The key exchange failed; the session cannot be established.
    Handshake(tangram_mtproto::authentication::Error),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Transport { code } => write!(f, "transport error {code}"),
            Self::Framing(s) => write!(f, "framing error: {s}"),
            Self::Crypto(e) => write!(f, "crypto error: {e}"),
            Self::BadMessage { code } => write!(f, "bad message notification {code}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::Dropped => write!(f, "request dropped"),
            Self::Terminated => write!(f, "session terminated"),
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tangram_tl::deserialize::Error> for InvocationError {
    fn from(e: tangram_tl::deserialize::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

impl From<tangram_mtproto::DecodeError> for InvocationError {
    fn from(e: tangram_mtproto::DecodeError) -> Self {
        Self::Crypto(e)
    }
}

impl From<tangram_mtproto::authentication::Error> for InvocationError {
    fn from(e: tangram_mtproto::authentication::Error) -> Self {
        Self::Handshake(e)
    }
}

impl InvocationError {
    /// `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }

    /// If this is a flood-wait error, how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _ => None,
        }
    }

    /// `true` for write failures that mean the connection is gone and the
    /// request can safely be replayed on a fresh one.
    pub fn is_closed_pipe(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::Dropped => true,
            _ => false,
        }
    }

    /// `true` for the federation error that warrants one transparent retry.
    pub fn is_authorization_invalid(&self) -> bool {
        match self {
            Self::Rpc(e) => {
                e.is("AUTH_BYTES_INVALID") || e.is("AUTH_KEY_UNREGISTERED") || e.code == 401
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_the_trailing_argument() {
        let e = RpcError::parse(420, "FLOOD_WAIT_30");
        assert_eq!(e.message, "FLOOD_WAIT");
        assert_eq!(e.extra, Some(30));
        assert_eq!(e.flood_wait_seconds(), Some(30));
        assert_eq!(e.to_string(), "rpc error 420: FLOOD_WAIT_30");
    }

    #[test]
    fn keeps_names_without_an_argument() {
        let e = RpcError::parse(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(e.message, "AUTH_KEY_UNREGISTERED");
        assert_eq!(e.extra, None);
        assert_eq!(e.flood_wait_seconds(), None);
    }

    #[test]
    fn digits_without_a_separator_stay_in_the_message() {
        let e = RpcError::parse(400, "ERROR42");
        assert_eq!(e.message, "ERROR42");
        assert_eq!(e.extra, None);
    }

    #[test]
    fn wildcard_matching() {
        let e = RpcError::parse(400, "PHONE_CODE_EXPIRED");
        assert!(e.is("PHONE_CODE_EXPIRED"));
        assert!(e.is("PHONE_CODE_*"));
        assert!(e.is("*_EXPIRED"));
        assert!(e.is("PHONE_*_EXPIRED"));
        assert!(!e.is("FLOOD_WAIT"));
        assert!(!e.is("PHONE_CODE_EXPIRED_*_LONGER"));
    }

    #[test]
    fn closed_pipe_classification() {
        let broken = InvocationError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x"));
        assert!(broken.is_closed_pipe());
        let other = InvocationError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "x"));
        assert!(!other.is_closed_pipe());
    }
}
