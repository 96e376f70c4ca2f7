//! Protocol state for the tangram session engine.
//!
//! This crate handles:
//! * Message identifiers and sequence numbers
//! * The plaintext envelope used before a key exists
//! * The encrypted channel used after
//! * The key-exchange state machine (sans-io)
//!
//! It performs no I/O: the sender crate owns the transport and feeds bytes
//! through these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod encrypted;
pub mod message;
pub mod session;

pub use encrypted::{DecodeError, DecryptedMessage, SecureChannel};
pub use message::PlainMessage;
pub use session::{MsgIdGen, SeqNoGen};
