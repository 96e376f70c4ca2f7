//! Cryptographic layer for the tangram session engine.
//!
//! Provides:
//! - `AuthKey` — the long-lived 256-byte authorization key
//! - MTProto 2.0 packet encryption / decryption
//! - AES-256-IGE
//! - RSA-PAD for the key exchange
//! - Pollard-rho PQ factorization
//! - nonce → AES key/IV derivation
//! - `sha1!` / `sha256!` hash macros
//!
//! Packet encryption is parameterized by [`Side`]: a real client always
//! encrypts as [`Side::Client`] and decrypts as [`Side::Server`], while a
//! test harness standing in for a datacenter does the reverse.

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod deque_buffer;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use deque_buffer::DequeBuffer;
pub use factorize::factorize;

// ─── Packet encryption ───────────────────────────────────────────────────────

/// Errors from [`decrypt_packet`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext shorter than the fixed header or not block-aligned.
    Truncated,
    /// The key hash in the frame does not match our key.
    AuthKeyMismatch,
    /// The message key does not match the decrypted body.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "ciphertext truncated or misaligned"),
            Self::AuthKeyMismatch => write!(f, "auth_key hash mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// Which peer produced a packet. Key derivation differs per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Packets written by the client.
    Client,
    /// Packets written by the server.
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt `buffer` in place as a message written by `side`.
///
/// On return the buffer holds `key_hash ‖ msg_key ‖ ciphertext`.
pub fn encrypt_packet(buffer: &mut DequeBuffer, auth_key: &AuthKey, side: Side) {
    let mut random = [0u8; 32];
    getrandom::getrandom(&mut random).expect("os rng unavailable");

    let pad = padding_len(buffer.len());
    buffer.extend(random.iter().take(pad).copied());

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], buffer.as_ref());
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.extend_front(&msg_key);
    buffer.extend_front(&auth_key.hash());
}

/// Decrypt a packet that was written by `side`.
///
/// `buffer` must hold `key_hash ‖ msg_key ‖ ciphertext`; on success the
/// returned slice is the plaintext (header plus padding still included).
pub fn decrypt_packet<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    side: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::Truncated);
    }
    if auth_key.hash() != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = side.x();
    let expected = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != expected[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Derive the AES key/IV that protects `server_DH_params_ok.encrypted_answer`.
pub fn generate_key_data_from_nonce(
    server_nonce: &[u8; 16],
    new_nonce: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: &[u8]) -> DequeBuffer {
        let mut buf = DequeBuffer::with_capacity(payload.len() + 32, 32);
        buf.extend(payload.iter().copied());
        buf
    }

    #[test]
    fn client_to_server_round_trip() {
        let key = AuthKey::from_bytes([0x42; 256]);
        let payload = b"the quick brown fox".to_vec();

        let mut buf = packet(&payload);
        encrypt_packet(&mut buf, &key, Side::Client);
        let mut wire = buf.into_vec();

        assert_eq!(&wire[..8], &key.hash());
        let plain = decrypt_packet(&mut wire, &key, Side::Client).unwrap();
        assert_eq!(&plain[..payload.len()], payload.as_slice());
    }

    #[test]
    fn directions_derive_different_keys() {
        let key = AuthKey::from_bytes([0x42; 256]);
        let mut buf = packet(b"hello");
        encrypt_packet(&mut buf, &key, Side::Server);
        let mut wire = buf.into_vec();
        // Decrypting with the wrong side must fail the msg_key check.
        assert_eq!(
            decrypt_packet(&mut wire.clone(), &key, Side::Client),
            Err(DecryptError::MessageKeyMismatch)
        );
        assert!(decrypt_packet(&mut wire, &key, Side::Server).is_ok());
    }

    #[test]
    fn wrong_key_is_rejected_by_hash() {
        let key = AuthKey::from_bytes([0x42; 256]);
        let other = AuthKey::from_bytes([0x43; 256]);
        let mut buf = packet(b"hello");
        encrypt_packet(&mut buf, &key, Side::Client);
        let mut wire = buf.into_vec();
        assert_eq!(
            decrypt_packet(&mut wire, &other, Side::Client),
            Err(DecryptError::AuthKeyMismatch)
        );
    }

    #[test]
    fn tampering_trips_the_message_key() {
        let key = AuthKey::from_bytes([0x42; 256]);
        let mut buf = packet(b"hello");
        encrypt_packet(&mut buf, &key, Side::Client);
        let mut wire = buf.into_vec();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert_eq!(
            decrypt_packet(&mut wire, &key, Side::Client),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn short_frames_are_truncated() {
        let key = AuthKey::from_bytes([0x42; 256]);
        assert_eq!(
            decrypt_packet(&mut [0u8; 20], &key, Side::Server),
            Err(DecryptError::Truncated)
        );
    }
}
