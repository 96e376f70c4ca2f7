//! AES-256 in IGE mode, the block mode the protocol encrypts every frame
//! with. IGE chains both the previous ciphertext and the previous plaintext
//! block into each step, so a flipped bit garbles everything that follows.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

const BLOCK: usize = 16;

fn xor_into(out: &mut [u8; BLOCK], a: &[u8], b: &[u8]) {
    for i in 0..BLOCK {
        out[i] = a[i] ^ b[i];
    }
}

/// Encrypt `data` in place. `data.len()` must be a multiple of 16.
///
/// The 32-byte `iv` is split into the initial ciphertext chain (first half)
/// and the initial plaintext chain (second half).
pub fn ige_encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut cipher_chain: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut plain_chain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in data.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = (&*block).try_into().unwrap();

        let mut work = [0u8; BLOCK];
        xor_into(&mut work, &plain, &cipher_chain);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut work));
        xor_into(&mut cipher_chain, &work, &plain_chain);

        block.copy_from_slice(&cipher_chain);
        plain_chain = plain;
    }
}

/// Decrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn ige_decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut cipher_chain: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut plain_chain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in data.chunks_exact_mut(BLOCK) {
        let encrypted: [u8; BLOCK] = (&*block).try_into().unwrap();

        let mut work = [0u8; BLOCK];
        xor_into(&mut work, &encrypted, &plain_chain);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut work));
        xor_into(&mut plain_chain, &work, &cipher_chain);

        block.copy_from_slice(&plain_chain);
        cipher_chain = encrypted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let iv = [3u8; 32];
        let original: Vec<u8> = (0..64u8).collect();
        let mut data = original.clone();

        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, original);
        ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, original);
    }

    #[test]
    fn chained_blocks_differ_for_equal_plaintext() {
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut data = [0u8; 32]; // two identical blocks
        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data[..16], data[16..]);
    }
}
