//! Sans-io auth key generation.
//!
//! The exchange is three request/response round trips followed by a local
//! verification step. Each function consumes the previous opaque state and
//! returns the next request to put on the wire:
//!
//! ```text
//! let (req, s1) = authentication::step1()?;
//! // send req, receive resp
//! let (req, s2) = authentication::step2(s1, resp, &pinned_key)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(s2, resp)?;
//! // send req, receive resp
//! let done = authentication::finish(s3, resp)?;
//! // done.auth_key is ready
//! ```
//!
//! The caller drives the wire; nothing here performs I/O.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::{BigUint, ToBigUint};
use tangram_crypto::{aes, factorize, generate_key_data_from_nonce, rsa, AuthKey};
use tangram_tl::service as tl;
use tangram_tl::{Cursor, Deserializable, Serializable};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Reasons the key exchange can fail.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize { size: usize },
    UnknownFingerprints { fingerprints: Vec<i64>, ours: i64 },
    DhParamsFail,
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData { error: tangram_tl::deserialize::Error },
    GParameterOutOfRange { low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidAnswerHash,
    InvalidNewNonceHash,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected } => {
                write!(f, "nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidServerNonce { got, expected } => {
                write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::UnknownFingerprints { fingerprints, ours } => write!(
                f,
                "pinned key fingerprint {ours} not offered by server ({fingerprints:?})"
            ),
            Self::DhParamsFail => write!(f, "server rejected the DH parameters request"),
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer length {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => {
                write!(f, "bad server DH inner data: {error}")
            }
            Self::GParameterOutOfRange { low, high } => {
                write!(f, "DH parameter out of range ({low}, {high})")
            }
            Self::DhGenRetry => write!(f, "server requested a DH generation retry"),
            Self::DhGenFail => write!(f, "server reported DH generation failure"),
            Self::InvalidAnswerHash => write!(f, "DH answer hash mismatch"),
            Self::InvalidNewNonceHash => write!(f, "new nonce hash mismatch"),
        }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// Opaque state after step 1.
pub struct Step1 {
    nonce: [u8; 16],
}

/// Opaque state after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// Opaque state after step 3.
#[derive(Debug)]
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    gab: BigUint,
    time_offset: i32,
}

/// The product of a successful exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// The first server salt, derived from the exchanged nonces.
    pub first_salt: i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Open the exchange with a fresh client nonce.
pub fn step1() -> Result<(tl::ReqPqMulti, Step1), Error> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).expect("os rng unavailable");
    Ok((tl::ReqPqMulti { nonce }, Step1 { nonce }))
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process the server's PQ challenge and produce the RSA-encrypted answer.
///
/// The server advertises a list of key fingerprints; the exchange proceeds
/// only if the pinned `key` is among them.
pub fn step2(
    state: Step1,
    response: tl::ResPq,
    key: &rsa::Key,
) -> Result<(tl::ReqDhParams, Step2), Error> {
    let mut random = [0u8; 256];
    getrandom::getrandom(&mut random).expect("os rng unavailable");
    do_step2(state, response, key, &random)
}

fn do_step2(
    state: Step1,
    response: tl::ResPq,
    key: &rsa::Key,
    random: &[u8; 256],
) -> Result<(tl::ReqDhParams, Step2), Error> {
    let Step1 { nonce } = state;
    check_nonce(&response.nonce, &nonce)?;

    if response.pq.len() != 8 {
        return Err(Error::InvalidPqSize { size: response.pq.len() });
    }

    let fingerprint = key.fingerprint();
    if !response
        .server_public_key_fingerprints
        .contains(&fingerprint)
    {
        return Err(Error::UnknownFingerprints {
            fingerprints: response.server_public_key_fingerprints,
            ours: fingerprint,
        });
    }

    let pq = u64::from_be_bytes(response.pq.as_slice().try_into().unwrap());
    let (p, q) = factorize(pq);

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let rsa_random: &[u8; 224] = random[32..].try_into().unwrap();

    fn trim_be(value: u64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        bytes[skip..].to_vec()
    }

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let inner = tl::PqInnerData {
        pq: pq.to_be_bytes().to_vec(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: response.server_nonce,
        new_nonce,
    }
    .to_bytes();

    let encrypted_data = rsa::encrypt_hashed(&inner, key, rsa_random);

    Ok((
        tl::ReqDhParams {
            nonce,
            server_nonce: response.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data,
        },
        Step2 {
            nonce,
            server_nonce: response.server_nonce,
            new_nonce,
        },
    ))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process the server's DH parameters and produce the client's share.
pub fn step3(
    state: Step2,
    response: tl::ServerDhParams,
) -> Result<(tl::SetClientDhParams, Step3), Error> {
    // 256 bytes for the DH exponent, 16 for padding.
    let mut random = [0u8; 272];
    getrandom::getrandom(&mut random).expect("os rng unavailable");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i32;
    do_step3(state, response, &random, now)
}

fn do_step3(
    state: Step2,
    response: tl::ServerDhParams,
    random: &[u8; 272],
    now: i32,
) -> Result<(tl::SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = state;

    let mut ok = match response {
        tl::ServerDhParams::Fail(fail) => {
            check_nonce(&fail.nonce, &nonce)?;
            check_server_nonce(&fail.server_nonce, &server_nonce)?;
            // The failure message must still prove knowledge of new_nonce.
            let digest = tangram_crypto::sha1!(new_nonce);
            let mut expected = [0u8; 16];
            expected.copy_from_slice(&digest[4..]);
            if fail.new_nonce_hash != expected {
                return Err(Error::InvalidNewNonceHash);
            }
            return Err(Error::DhParamsFail);
        }
        tl::ServerDhParams::Ok(ok) => ok,
    };

    check_nonce(&ok.nonce, &nonce)?;
    check_server_nonce(&ok.server_nonce, &server_nonce)?;

    if ok.encrypted_answer.len() % 16 != 0 {
        return Err(Error::EncryptedResponseNotPadded { len: ok.encrypted_answer.len() });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut ok.encrypted_answer, &key, &iv);
    let plain = ok.encrypted_answer;
    if plain.len() < 20 {
        return Err(Error::InvalidDhInnerData {
            error: tangram_tl::deserialize::Error::UnexpectedEof,
        });
    }

    let answer_hash: [u8; 20] = plain[..20].try_into().unwrap();
    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = tl::ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = tangram_crypto::sha1!(&plain[20..20 + cursor.pos()]);
    if answer_hash != expected_hash {
        return Err(Error::InvalidAnswerHash);
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    let g = inner.g.to_biguint().ok_or(Error::DhGenFail)?;
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let time_offset = inner.server_time - now;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);
    let gab = g_a.modpow(&b, &dh_prime);

    // Range checks: all shares must lie strictly inside (1, p-1), and both
    // public shares must keep 2^{2048-64} distance from the edges.
    let one = BigUint::from(1u32);
    check_in_range(&g, &one, &(&dh_prime - &one))?;
    check_in_range(&g_a, &one, &(&dh_prime - &one))?;
    check_in_range(&g_b, &one, &(&dh_prime - &one))?;
    let safety = one << (2048 - 64);
    check_in_range(&g_a, &safety, &(&dh_prime - &safety))?;
    check_in_range(&g_b, &safety, &(&dh_prime - &safety))?;

    let client_inner = tl::ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let digest = tangram_crypto::sha1!(&client_inner);
    let pad_len = (16 - (20 + client_inner.len()) % 16) % 16;

    let mut encrypted_data = Vec::with_capacity(20 + client_inner.len() + pad_len);
    encrypted_data.extend_from_slice(&digest);
    encrypted_data.extend_from_slice(&client_inner);
    encrypted_data.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut encrypted_data, &key, &iv);

    Ok((
        tl::SetClientDhParams { nonce, server_nonce, encrypted_data },
        Step3 { nonce, server_nonce, new_nonce, gab, time_offset },
    ))
}

// ─── Finish ──────────────────────────────────────────────────────────────────

/// Verify the server's verdict and derive the final key.
pub fn finish(state: Step3, response: tl::DhGenAnswer) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset } = state;

    let (got_nonce, got_server_nonce, got_hash, number) = match response {
        tl::DhGenAnswer::Ok(x) => (x.nonce, x.server_nonce, x.new_nonce_hash1, 1u8),
        tl::DhGenAnswer::Retry(x) => (x.nonce, x.server_nonce, x.new_nonce_hash2, 2),
        tl::DhGenAnswer::Fail(x) => (x.nonce, x.server_nonce, x.new_nonce_hash3, 3),
    };

    check_nonce(&got_nonce, &nonce)?;
    check_server_nonce(&got_server_nonce, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);

    let auth_key = AuthKey::from_bytes(key_bytes);
    if got_hash != auth_key.calc_new_nonce_hash(&new_nonce, number) {
        return Err(Error::InvalidNewNonceHash);
    }

    let first_salt = {
        let mut salt = [0u8; 8];
        for ((dst, a), b) in salt.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        i64::from_le_bytes(salt)
    };

    match number {
        1 => Ok(Finished { auth_key: auth_key.to_bytes(), time_offset, first_salt }),
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}

fn check_in_range(value: &BigUint, low: &BigUint, high: &BigUint) -> Result<(), Error> {
    if low < value && value < high {
        Ok(())
    } else {
        Err(Error::GParameterOutOfRange { low: low.clone(), high: high.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned_key() -> rsa::Key {
        rsa::Key::new(
            "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949",
            "65537",
        )
        .unwrap()
    }

    #[test]
    fn step2_rejects_echoed_nonce_mismatch() {
        let (req, state) = step1().unwrap();
        let response = tl::ResPq {
            nonce: [0xff; 16],
            server_nonce: [1; 16],
            pq: vec![0, 0, 0, 0, 0, 0, 0, 2],
            server_public_key_fingerprints: vec![pinned_key().fingerprint()],
        };
        let err = step2(state, response, &pinned_key()).unwrap_err();
        assert!(matches!(err, Error::InvalidNonce { expected, .. } if expected == req.nonce));
    }

    #[test]
    fn step2_requires_the_pinned_fingerprint() {
        let (_, state) = step1().unwrap();
        let response = tl::ResPq {
            nonce: state.nonce,
            server_nonce: [1; 16],
            pq: 1470626929934143021u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![42],
        };
        let err = step2(state, response, &pinned_key()).unwrap_err();
        assert!(matches!(err, Error::UnknownFingerprints { .. }));
    }

    #[test]
    fn step2_rejects_bad_pq_size() {
        let (_, state) = step1().unwrap();
        let response = tl::ResPq {
            nonce: state.nonce,
            server_nonce: [1; 16],
            pq: vec![1, 2, 3],
            server_public_key_fingerprints: vec![pinned_key().fingerprint()],
        };
        let err = step2(state, response, &pinned_key()).unwrap_err();
        assert_eq!(err, Error::InvalidPqSize { size: 3 });
    }

    #[test]
    fn step3_rejects_misaligned_answer() {
        let state = Step2 { nonce: [1; 16], server_nonce: [2; 16], new_nonce: [3; 32] };
        let response = tl::ServerDhParams::Ok(tl::ServerDhParamsOk {
            nonce: [1; 16],
            server_nonce: [2; 16],
            encrypted_answer: vec![0u8; 17],
        });
        let err = step3(state, response).unwrap_err();
        assert_eq!(err, Error::EncryptedResponseNotPadded { len: 17 });
    }

    #[test]
    fn finish_rejects_forged_nonce_hash() {
        let state = Step3 {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce: [3; 32],
            gab: BigUint::from(12345u32),
            time_offset: 0,
        };
        let response = tl::DhGenAnswer::Ok(tl::DhGenOk {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash1: [0; 16],
        });
        assert_eq!(finish(state, response).unwrap_err(), Error::InvalidNewNonceHash);
    }
}
