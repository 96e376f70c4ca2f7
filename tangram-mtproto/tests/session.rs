use std::sync::{Arc, Mutex};

use tangram_crypto::AuthKey;
use tangram_mtproto::{MsgIdGen, PlainMessage, SecureChannel, SeqNoGen};

// ── Message identifiers ──────────────────────────────────────────────────────

#[test]
fn msg_ids_are_strictly_increasing_and_divisible_by_four() {
    let mut gen = MsgIdGen::new();
    let mut prev = 0i64;
    for _ in 0..10_000 {
        let id = gen.next();
        assert!(id > prev, "ids must strictly increase");
        assert_eq!(id % 4, 0, "ids must be divisible by 4");
        prev = id;
    }
}

#[test]
fn msg_ids_survive_a_backwards_clock() {
    // Dropping the time offset makes the next reading land in the past; the
    // generator must hand out previous + 4 instead.
    let mut gen = MsgIdGen::new();
    gen.set_time_offset(100);
    let ahead = gen.next();
    gen.set_time_offset(0);
    let next = gen.next();
    assert_eq!(next, ahead + 4);
}

#[test]
fn msg_ids_are_monotonic_across_threads() {
    let gen = Arc::new(Mutex::new(MsgIdGen::new()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let gen = Arc::clone(&gen);
        handles.push(std::thread::spawn(move || {
            (0..500).map(|_| gen.lock().unwrap().next()).collect::<Vec<_>>()
        }));
    }

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total, "no id may be handed out twice");
    assert!(all.iter().all(|id| id % 4 == 0));
}

#[test]
fn time_offset_shifts_the_clock_half() {
    let mut plain = MsgIdGen::new();
    let mut shifted = MsgIdGen::new();
    shifted.set_time_offset(100);
    let a = plain.next() >> 32;
    let b = shifted.next() >> 32;
    assert!((b - a - 100).abs() <= 1, "upper half must move with the offset");
}

// ── Sequence numbers ─────────────────────────────────────────────────────────

#[test]
fn seq_no_advances_by_two_for_content() {
    let mut gen = SeqNoGen::new();
    assert_eq!(gen.next(true), 0);
    assert_eq!(gen.next(true), 2);
    assert_eq!(gen.next(true), 4);
}

#[test]
fn seq_no_advances_by_one_for_service() {
    let mut gen = SeqNoGen::new();
    assert_eq!(gen.next(true), 0);
    assert_eq!(gen.next(false), 2);
    assert_eq!(gen.next(true), 3);
    assert_eq!(gen.next(false), 5);
}

// ── Plaintext envelope ───────────────────────────────────────────────────────

#[test]
fn plaintext_wire_layout() {
    let msg = PlainMessage::new(0x1122334455667788, vec![0xaa, 0xbb]);
    let wire = msg.to_bytes();

    assert_eq!(wire.len(), 8 + 8 + 4 + 2);
    assert_eq!(&wire[..8], &[0u8; 8], "auth_key_id must be zero");
    assert_eq!(u32::from_le_bytes(wire[16..20].try_into().unwrap()), 2);
    assert_eq!(&wire[20..], &[0xaa, 0xbb]);

    assert_eq!(PlainMessage::from_bytes(&wire).unwrap(), msg);
}

#[test]
fn plaintext_rejects_nonzero_key_id() {
    let mut wire = PlainMessage::new(1, vec![0; 4]).to_bytes();
    wire[0] = 1;
    assert!(PlainMessage::from_bytes(&wire).is_err());
}

// ── Secure channel ───────────────────────────────────────────────────────────

fn server_frame(
    channel: &SecureChannel,
    salt: i64,
    msg_id: i64,
    seq_no: i32,
    body: &[u8],
) -> Vec<u8> {
    // Build the frame the way the server would: same inner layout, server
    // direction keys.
    let mut buf = tangram_crypto::DequeBuffer::with_capacity(32 + body.len(), 32);
    buf.extend(salt.to_le_bytes());
    buf.extend(channel.session_id().to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend(seq_no.to_le_bytes());
    buf.extend((body.len() as u32).to_le_bytes());
    buf.extend(body.iter().copied());
    tangram_crypto::encrypt_packet(&mut buf, channel.auth_key(), tangram_crypto::Side::Server);
    buf.into_vec()
}

#[test]
fn secure_channel_round_trip() {
    let channel = SecureChannel::with_session_id(AuthKey::from_bytes([0x42; 256]), 77);

    let mut frame = server_frame(&channel, 0x5a17, 8000, 3, b"response body");
    let msg = channel.decode(&mut frame).unwrap();
    assert_eq!(msg.salt, 0x5a17);
    assert_eq!(msg.msg_id, 8000);
    assert_eq!(msg.seq_no, 3);
    assert_eq!(msg.body, b"response body");
}

#[test]
fn secure_channel_rejects_foreign_session() {
    let ours = SecureChannel::with_session_id(AuthKey::from_bytes([0x42; 256]), 77);
    let theirs = SecureChannel::with_session_id(AuthKey::from_bytes([0x42; 256]), 78);

    let mut frame = server_frame(&theirs, 1, 4, 0, b"x");
    assert!(matches!(
        ours.decode(&mut frame),
        Err(tangram_mtproto::DecodeError::SessionMismatch)
    ));
}

#[test]
fn encode_embeds_the_callers_ids() {
    let key = AuthKey::from_bytes([0x42; 256]);
    let channel = SecureChannel::with_session_id(key.clone(), 5);

    let mut wire = channel.encode(0xbeef, 1234, 7, b"ping");
    // Peel it the way the server would.
    let plain = tangram_crypto::decrypt_packet(&mut wire, &key, tangram_crypto::Side::Client)
        .unwrap();
    assert_eq!(i64::from_le_bytes(plain[..8].try_into().unwrap()), 0xbeef);
    assert_eq!(i64::from_le_bytes(plain[8..16].try_into().unwrap()), 5);
    assert_eq!(i64::from_le_bytes(plain[16..24].try_into().unwrap()), 1234);
    assert_eq!(i32::from_le_bytes(plain[24..28].try_into().unwrap()), 7);
    let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
    assert_eq!(&plain[32..32 + len], b"ping");
}
