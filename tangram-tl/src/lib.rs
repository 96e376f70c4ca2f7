//! Type-length-value object layer for the tangram session engine.
//!
//! The engine does not ship the full generated API schema; it only needs to
//! read and write the handful of service objects that drive a session
//! (containers, acknowledgements, salts, RPC results, the key-exchange
//! messages). Those live in [`service`], hand-written against the schema.
//! Everything the engine does not recognize stays an opaque byte payload and
//! is handed through untouched.

#![deny(unsafe_code)]

pub mod deserialize;
pub mod serialize;
pub mod service;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Opaque blob of bytes passed through without interpretation.
///
/// Used as the return type of calls whose response the engine does not
/// decode itself (e.g. `auth.importAuthorization`).
#[derive(Clone, Debug, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl Deserializable for Blob {
    fn deserialize(buf: deserialize::Buffer) -> deserialize::Result<Self> {
        let mut out = Vec::new();
        buf.read_to_end(&mut out);
        Ok(Self(out))
    }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every concrete wire type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent to the server as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
