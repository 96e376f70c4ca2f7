//! Hand-written service-schema objects.
//!
//! These are the wire objects the session engine itself has to understand:
//! the envelope messages every connection produces (containers, salts,
//! acknowledgements, RPC results), the key-exchange messages, and the few
//! service RPCs the engine issues on its own behalf (ping, acks,
//! authorization export/import). Application-level schema types never appear
//! here — they pass through as opaque payloads.

use crate::deserialize::{Buffer, Cursor, Error, Result};
use crate::{Blob, Deserializable, Identifiable, RemoteCall, Serializable};

// ─── Constructor IDs the engine recognizes ───────────────────────────────────

pub const ID_MSG_CONTAINER: u32 = 0x73f1f8dc;
pub const ID_RPC_RESULT: u32 = 0xf35c6d01;
pub const ID_RPC_ERROR: u32 = 0x2144ca19;
pub const ID_GZIP_PACKED: u32 = 0x3072cfa1;
pub const ID_PONG: u32 = 0x347773c5;
pub const ID_MSGS_ACK: u32 = 0x62d6b459;
pub const ID_BAD_SERVER_SALT: u32 = 0xedab447b;
pub const ID_NEW_SESSION_CREATED: u32 = 0x9ec20908;
pub const ID_BAD_MSG_NOTIFICATION: u32 = 0xa7eff811;

// ─── Object definition helper ────────────────────────────────────────────────

/// Defines a schema object: a plain struct plus `Identifiable`,
/// `Serializable` and `Deserializable` impls, and a `deserialize_fields`
/// helper for reading it bare (constructor ID already consumed).
macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( pub $field: $ty, )*
        }

        impl Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                Self::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )*
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                if id != Self::CONSTRUCTOR_ID {
                    return Err(Error::UnexpectedConstructor { id });
                }
                Self::deserialize_fields(buf)
            }
        }

        impl $name {
            /// Read the fields only; the constructor ID was already consumed.
            pub fn deserialize_fields(buf: Buffer) -> Result<Self> {
                Ok(Self { $( $field: <$ty>::deserialize(buf)?, )* })
            }
        }
    };
}

// ─── Session service objects ─────────────────────────────────────────────────

tl_object! {
    /// `pong#347773c5` — reply to a `ping`; `msg_id` echoes the ping's.
    Pong = 0x347773c5 { msg_id: i64, ping_id: i64 }
}

tl_object! {
    /// `msgs_ack#62d6b459` — acknowledges receipt of the listed messages.
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
}

tl_object! {
    /// `bad_server_salt#edab447b` — the request was sent with a stale salt;
    /// `new_server_salt` is the one to use from now on.
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_object! {
    /// `bad_msg_notification#a7eff811` — the request itself was malformed.
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

tl_object! {
    /// `new_session_created#9ec20908` — the server opened a fresh session and
    /// announces its salt.
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

tl_object! {
    /// `rpc_error#2144ca19` — an RPC-level failure wrapped in an rpc_result.
    RpcError = 0x2144ca19 { error_code: i32, error_message: String }
}

tl_object! {
    /// `ping#7abe77ec` — liveness probe; answered with [`Pong`].
    Ping = 0x7abe77ec { ping_id: i64 }
}

impl RemoteCall for Ping {
    type Return = Pong;
}

// ─── Authorization transfer (DC federation) ──────────────────────────────────

tl_object! {
    /// `auth.exportAuthorization#e5bfffcd` — ask the home DC for a portable
    /// authorization targeted at `dc_id`.
    ExportAuthorization = 0xe5bfffcd { dc_id: i32 }
}

tl_object! {
    /// `auth.exportedAuthorization#b434e2b8` — the portable authorization.
    ExportedAuthorization = 0xb434e2b8 { id: i64, bytes: Vec<u8> }
}

tl_object! {
    /// `auth.importAuthorization#a57a7dad` — redeem an exported authorization
    /// on the target DC.
    ImportAuthorization = 0xa57a7dad { id: i64, bytes: Vec<u8> }
}

impl RemoteCall for ExportAuthorization {
    type Return = ExportedAuthorization;
}

impl RemoteCall for ImportAuthorization {
    // The full auth.Authorization payload is application-schema territory;
    // the engine only needs the call to succeed.
    type Return = Blob;
}

// ─── Key exchange ────────────────────────────────────────────────────────────

tl_object! {
    /// `req_pq_multi#be7e8ef1` — opens the key exchange.
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] }
}

tl_object! {
    /// `resPQ#05162463` — the server's challenge.
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_object! {
    /// `p_q_inner_data#83c95aec` — the RSA-encrypted proof of work.
    PqInnerData = 0x83c95aec {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
    }
}

tl_object! {
    /// `req_DH_params#d712e4be`
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
}

tl_object! {
    /// `server_DH_params_ok#d0e8075c`
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_object! {
    /// `server_DH_params_fail#79cb045d`
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

/// `Server_DH_Params` — either constructor of the DH parameter answer.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerDhParams {
    Ok(ServerDhParamsOk),
    Fail(ServerDhParamsFail),
}

impl Deserializable for ServerDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            ServerDhParamsOk::CONSTRUCTOR_ID => {
                Ok(Self::Ok(ServerDhParamsOk::deserialize_fields(buf)?))
            }
            ServerDhParamsFail::CONSTRUCTOR_ID => {
                Ok(Self::Fail(ServerDhParamsFail::deserialize_fields(buf)?))
            }
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

tl_object! {
    /// `server_DH_inner_data#b5890dba` — decrypted DH parameters.
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_object! {
    /// `client_DH_inner_data#6643b654`
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_object! {
    /// `set_client_DH_params#f5045f1f`
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
}

tl_object! {
    /// `dh_gen_ok#3bcbf734`
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

tl_object! {
    /// `dh_gen_retry#46dc1fb9`
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

tl_object! {
    /// `dh_gen_fail#a69dae02`
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

/// `Set_client_DH_params_answer` — the handshake verdict.
#[derive(Clone, Debug, PartialEq)]
pub enum DhGenAnswer {
    Ok(DhGenOk),
    Retry(DhGenRetry),
    Fail(DhGenFail),
}

impl Deserializable for DhGenAnswer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            DhGenOk::CONSTRUCTOR_ID => Ok(Self::Ok(DhGenOk::deserialize_fields(buf)?)),
            DhGenRetry::CONSTRUCTOR_ID => Ok(Self::Retry(DhGenRetry::deserialize_fields(buf)?)),
            DhGenFail::CONSTRUCTOR_ID => Ok(Self::Fail(DhGenFail::deserialize_fields(buf)?)),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

impl RemoteCall for ReqPqMulti {
    type Return = ResPq;
}

impl RemoteCall for ReqDhParams {
    type Return = ServerDhParams;
}

impl RemoteCall for SetClientDhParams {
    type Return = DhGenAnswer;
}

// ─── The dispatch sum type ───────────────────────────────────────────────────

/// One message carried inside a container.
#[derive(Clone, Debug, PartialEq)]
pub struct InnerMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub bytes: Vec<u8>,
}

/// Every inbound wire object, classified for dispatch.
///
/// The engine switches exhaustively over the variants it acts on; anything
/// it does not recognize lands in [`ServiceMessage::Opaque`] with the full
/// original payload (constructor ID included) so that higher layers can
/// decode it themselves.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    Container(Vec<InnerMessage>),
    BadServerSalt(BadServerSalt),
    NewSessionCreated(NewSessionCreated),
    Pong(Pong),
    MsgsAck(MsgsAck),
    BadMsgNotification(BadMsgNotification),
    RpcResult { req_msg_id: i64, body: Vec<u8> },
    GzipPacked(Vec<u8>),
    Opaque(u32, Vec<u8>),
}

impl ServiceMessage {
    /// Classify a decrypted message body.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let mut buf = Cursor::from_slice(body);
        let id = u32::deserialize(&mut buf)?;
        match id {
            ID_MSG_CONTAINER => {
                // msg_container carries a bare vector: count, then messages.
                let count = i32::deserialize(&mut buf)?;
                let mut items = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let msg_id = i64::deserialize(&mut buf)?;
                    let seq_no = i32::deserialize(&mut buf)?;
                    let len = i32::deserialize(&mut buf)?;
                    if len < 0 {
                        return Err(Error::UnexpectedEof);
                    }
                    let mut bytes = vec![0u8; len as usize];
                    buf.read_exact(&mut bytes)?;
                    items.push(InnerMessage { msg_id, seq_no, bytes });
                }
                Ok(Self::Container(items))
            }
            ID_RPC_RESULT => {
                let req_msg_id = i64::deserialize(&mut buf)?;
                let mut inner = Vec::new();
                buf.read_to_end(&mut inner);
                Ok(Self::RpcResult { req_msg_id, body: inner })
            }
            ID_GZIP_PACKED => Ok(Self::GzipPacked(Vec::<u8>::deserialize(&mut buf)?)),
            ID_BAD_SERVER_SALT => Ok(Self::BadServerSalt(BadServerSalt::deserialize_fields(
                &mut buf,
            )?)),
            ID_NEW_SESSION_CREATED => Ok(Self::NewSessionCreated(
                NewSessionCreated::deserialize_fields(&mut buf)?,
            )),
            ID_PONG => Ok(Self::Pong(Pong::deserialize_fields(&mut buf)?)),
            ID_MSGS_ACK => Ok(Self::MsgsAck(MsgsAck::deserialize_fields(&mut buf)?)),
            ID_BAD_MSG_NOTIFICATION => Ok(Self::BadMsgNotification(
                BadMsgNotification::deserialize_fields(&mut buf)?,
            )),
            other => Ok(Self::Opaque(other, body.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trip() {
        let ping = Ping { ping_id: 0x0123_4567_89ab_cdef };
        let bytes = ping.to_bytes();
        assert_eq!(&bytes[..4], &0x7abe77ecu32.to_le_bytes());
        assert_eq!(Ping::from_bytes(&bytes).unwrap(), ping);
    }

    #[test]
    fn msgs_ack_uses_boxed_vector() {
        let ack = MsgsAck { msg_ids: vec![1, 2, 3] };
        let bytes = ack.to_bytes();
        // ctor, vector ctor, count, 3 longs
        assert_eq!(bytes.len(), 4 + 4 + 4 + 3 * 8);
        assert_eq!(&bytes[4..8], &0x1cb5c415u32.to_le_bytes());
        assert_eq!(MsgsAck::from_bytes(&bytes).unwrap(), ack);
    }

    #[test]
    fn classify_bad_server_salt() {
        let salt = BadServerSalt {
            bad_msg_id: 7,
            bad_msg_seqno: 3,
            error_code: 48,
            new_server_salt: 0x00c0_ffee,
        };
        match ServiceMessage::from_bytes(&salt.to_bytes()).unwrap() {
            ServiceMessage::BadServerSalt(got) => assert_eq!(got, salt),
            other => panic!("misclassified: {other:?}"),
        }
    }

    #[test]
    fn classify_container() {
        let pong = Pong { msg_id: 11, ping_id: 22 }.to_bytes();
        let mut body = Vec::new();
        ID_MSG_CONTAINER.serialize(&mut body);
        1i32.serialize(&mut body);
        99i64.serialize(&mut body);
        2i32.serialize(&mut body);
        (pong.len() as i32).serialize(&mut body);
        body.extend_from_slice(&pong);

        match ServiceMessage::from_bytes(&body).unwrap() {
            ServiceMessage::Container(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].msg_id, 99);
                assert_eq!(items[0].seq_no, 2);
                assert_eq!(items[0].bytes, pong);
            }
            other => panic!("misclassified: {other:?}"),
        }
    }

    #[test]
    fn unknown_constructor_is_opaque() {
        let mut body = Vec::new();
        0xdeadbeefu32.serialize(&mut body);
        body.extend_from_slice(&[1, 2, 3, 4]);
        match ServiceMessage::from_bytes(&body).unwrap() {
            ServiceMessage::Opaque(id, bytes) => {
                assert_eq!(id, 0xdeadbeef);
                assert_eq!(bytes, body);
            }
            other => panic!("misclassified: {other:?}"),
        }
    }
}
