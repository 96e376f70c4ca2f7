//! The long-lived authorization key shared with one datacenter.

use crate::sha1;

/// A 256-byte authorization key plus its precomputed identifiers.
///
/// `hash` is the stable 8-byte key identifier sent in the clear at the head
/// of every encrypted frame; `aux_hash` is only used while verifying the key
/// exchange.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    hash: [u8; 8],
}

impl AuthKey {
    /// Construct from the raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let digest = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&digest[..8]);
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&digest[12..20]);
        Self { data, aux_hash, hash }
    }

    /// The raw 256-byte key, for persistence.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier (`SHA-1(key)[12..20]`).
    pub fn hash(&self) -> [u8; 8] {
        self.hash
    }

    /// The hash the server echoes in `dh_gen_ok`/`retry`/`fail` to prove it
    /// derived the same key. `number` is 1, 2 or 3 matching the variant.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let digest = sha1!(new_nonce, [number], self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey({:016x})", u64::from_le_bytes(self.hash))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
