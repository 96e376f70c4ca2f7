//! RSA encryption of the key-exchange proof, using the protocol's RSA-PAD
//! scheme (data interleaved with an AES-IGE pass so the padding cannot be
//! stripped).

use num_bigint::BigUint;

use crate::{aes, sha1, sha256};

/// An RSA public key `(n, e)` pinned for handshake verification.
#[derive(Clone)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// The 64-bit fingerprint the server advertises for this key:
    /// `SHA-1(n:bytes e:bytes)[12..20]` as a little-endian integer.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::new();
        tl_bytes(&self.n.to_bytes_be(), &mut buf);
        tl_bytes(&self.e.to_bytes_be(), &mut buf);
        let digest = sha1!(&buf);
        i64::from_le_bytes(digest[12..20].try_into().unwrap())
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({:#018x})", self.fingerprint())
    }
}

/// TL string framing: length prefix, data, zero padding to 4 bytes.
fn tl_bytes(data: &[u8], out: &mut Vec<u8>) {
    let len = data.len();
    let header = if len <= 253 {
        out.push(len as u8);
        1
    } else {
        out.extend_from_slice(&[0xfe, len as u8, (len >> 8) as u8, (len >> 16) as u8]);
        4
    };
    out.extend_from_slice(data);
    out.resize(out.len() + (4 - (header + len) % 4) % 4, 0);
}

fn increment(data: &mut [u8]) {
    let mut i = data.len() - 1;
    loop {
        let (n, overflow) = data[i].overflowing_add(1);
        data[i] = n;
        if overflow {
            i = i.checked_sub(1).unwrap_or(data.len() - 1);
        } else {
            break;
        }
    }
}

/// RSA-encrypt `data` with the RSA-PAD scheme.
///
/// `random_bytes` must be exactly 224 bytes of secure random data; `data`
/// must be at most 144 bytes.
pub fn encrypt_hashed(data: &[u8], key: &Key, random_bytes: &[u8; 224]) -> Vec<u8> {
    assert!(data.len() <= 144, "data too large for RSA-PAD");

    let mut data_with_padding = Vec::with_capacity(192);
    data_with_padding.extend_from_slice(data);
    data_with_padding.extend_from_slice(&random_bytes[..192 - data.len()]);

    let data_pad_reversed: Vec<u8> = data_with_padding.iter().copied().rev().collect();

    let mut temp_key: [u8; 32] = random_bytes[192..].try_into().unwrap();

    let key_aes_encrypted = loop {
        let mut data_with_hash = Vec::with_capacity(224);
        data_with_hash.extend_from_slice(&data_pad_reversed);
        data_with_hash.extend_from_slice(&sha256!(&temp_key, &data_with_padding));

        aes::ige_encrypt(&mut data_with_hash, &temp_key, &[0u8; 32]);

        let hash = sha256!(&data_with_hash);
        let mut xored = temp_key;
        for (a, b) in xored.iter_mut().zip(hash.iter()) {
            *a ^= b;
        }

        let mut candidate = Vec::with_capacity(256);
        candidate.extend_from_slice(&xored);
        candidate.extend_from_slice(&data_with_hash);

        // The candidate must be numerically below the modulus; otherwise
        // bump the temp key and try again.
        if BigUint::from_bytes_be(&candidate) < key.n {
            break candidate;
        }
        increment(&mut temp_key);
    };

    let payload = BigUint::from_bytes_be(&key_aes_encrypted);
    let encrypted = payload.modpow(&key.e, &key.n);
    let mut block = encrypted.to_bytes_be();
    while block.len() < 256 {
        block.insert(0, 0);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        Key::new(
            "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323",
            "65537",
        )
        .unwrap()
    }

    #[test]
    fn fingerprint_matches_known_value() {
        assert_eq!(test_key().fingerprint(), -3414540481677951611);
    }

    #[test]
    fn ciphertext_is_one_block_and_deterministic() {
        let rnd = [0x5au8; 224];
        let a = encrypt_hashed(b"payload", &test_key(), &rnd);
        let b = encrypt_hashed(b"payload", &test_key(), &rnd);
        assert_eq!(a.len(), 256);
        assert_eq!(a, b);
    }
}
