//! # tangram-sender
//!
//! The transport and session engine of the tangram client stack. One
//! [`Sender`] owns an encrypted connection to a single datacenter and
//! provides:
//!
//! - typed and raw request sending with response correlation by message id
//! - a background receive loop that dispatches results, salt changes and
//!   service notices
//! - automatic recovery: reconnects, salt rotation, flood-wait retries,
//!   re-keying when the server forgets the auth key
//! - session persistence and portable string sessions
//! - auxiliary senders on other datacenters sharing the same authorization
//!
//! The wire codec for application schema types is *not* here: requests and
//! responses cross this crate as TL-serialized byte payloads, with the
//! [`tangram_tl::RemoteCall`] trait providing the typed convenience layer.

#![deny(unsafe_code)]

mod errors;
pub mod endpoints;
mod pool;
mod storage;
pub mod string_session;
mod transport;

pub use errors::{InvocationError, RpcError};
pub use storage::{FileStorage, MemoryStorage, SessionData, SessionStorage};
pub use transport::Proxy;
pub use tangram_crypto::rsa;
pub use tangram_tl as tl;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tangram_crypto::AuthKey;
use tangram_mtproto::authentication;
use tangram_mtproto::{MsgIdGen, PlainMessage, SecureChannel, SeqNoGen};
use tangram_tl::service;
use tangram_tl::{Cursor, Deserializable, RemoteCall, Serializable};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Transport error code meaning the auth key is unknown or expired and a new
/// one must be negotiated.
const AUTH_KEY_EXPIRED: i32 = -404;

/// The one-way ping issued after every reconnect; it both probes liveness
/// and forces the server to allocate session resources.
const WARMUP_PING_ID: i64 = 123456789;

/// Upper bound on the whole key exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest single flood wait honored transparently.
const MAX_FLOOD_WAIT: Duration = Duration::from_secs(60);

/// Total sleep budget across all transparent retries of one request.
const MAX_TOTAL_WAIT: Duration = Duration::from_secs(300);

/// How many broken-pipe reconnect-and-resend cycles one request gets.
const MAX_PIPE_RETRIES: u32 = 1;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Sender::connect`].
pub struct Config {
    /// File used to load and persist the session. Ignored when `storage` is
    /// set or `memory_only` is on.
    pub session_file: Option<PathBuf>,
    /// Custom persistence backend; overrides `session_file`.
    pub storage: Option<Arc<dyn SessionStorage>>,
    /// Never write the session anywhere.
    pub memory_only: bool,
    /// Decode initial credentials from a portable string session.
    pub string_session: Option<String>,
    /// Initial datacenter address. A stored session's address wins over it.
    pub endpoint: Option<String>,
    /// Logical datacenter (1..=5), resolved against the endpoint table when
    /// no explicit `endpoint` is given.
    pub datacenter_id: Option<i32>,
    /// RSA public key pinned for handshake verification.
    pub public_key: rsa::Key,
    /// The caller's registered application id.
    pub app_id: i32,
    /// When set, applied process-wide with `log::set_max_level`.
    pub log_level: Option<log::LevelFilter>,
    /// Optional SOCKS5 proxy for every connection this sender opens.
    pub socks_proxy: Option<Proxy>,
}

impl Config {
    /// A configuration with only the two mandatory pieces filled in.
    pub fn new(public_key: rsa::Key, app_id: i32) -> Self {
        Self {
            session_file: None,
            storage: None,
            memory_only: false,
            string_session: None,
            endpoint: None,
            datacenter_id: None,
            public_key,
            app_id,
            log_level: None,
            socks_proxy: None,
        }
    }
}

// ─── Internal state ──────────────────────────────────────────────────────────

/// What a caller ultimately receives through its mailbox.
enum Delivery {
    /// The TL-serialized RPC result.
    Response(Vec<u8>),
    /// A definitive failure for this request.
    Failure(InvocationError),
    /// Session parameters changed under the request; re-enqueue it.
    ConfigsChanged,
}

struct Mailbox {
    tx: oneshot::Sender<Delivery>,
    expected_types: Vec<u32>,
}

/// Handler for inbound objects the engine itself does not understand.
/// Receives the constructor id and the full payload; returns `true` to
/// claim the object.
pub type ServerRequestHandler = Arc<dyn Fn(u32, &[u8]) -> bool + Send + Sync>;

struct SessionState {
    /// Present once an auth key exists; carries key and session id.
    channel: Option<SecureChannel>,
    salt: i64,
    endpoint: String,
}

struct ConnState {
    writer: Option<transport::FrameWriter>,
    loop_handle: Option<JoinHandle<()>>,
    /// Bumped on every successful rebuild; concurrent reconnect triggers
    /// that saw an older value collapse into no-ops.
    generation: u64,
}

struct SenderInner {
    app_id: i32,
    public_key: rsa::Key,
    proxy: Option<Proxy>,
    storage: Arc<dyn SessionStorage>,
    memory_only: bool,

    // Lock order: session < msg_id < seq_no < mailboxes. The connection
    // mutex is only ever taken with all of these released.
    session: Mutex<SessionState>,
    msg_id: Mutex<MsgIdGen>,
    seq_no: Mutex<SeqNoGen>,
    mailboxes: StdMutex<HashMap<i64, Mailbox>>,
    conn: Mutex<ConnState>,

    /// While the key exchange runs, every decoded object goes here instead
    /// of the regular dispatch path.
    service: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    handlers: StdMutex<Vec<ServerRequestHandler>>,
    exported: Mutex<HashMap<i32, Vec<Sender>>>,
    connected: AtomicBool,
}

/// A connection to one datacenter. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

fn session_data(state: &SessionState, app_id: i32) -> Option<SessionData> {
    let channel = state.channel.as_ref()?;
    let key = channel.auth_key();
    Some(SessionData {
        auth_key: key.to_bytes(),
        auth_key_hash: key.hash(),
        salt: state.salt,
        endpoint: state.endpoint.clone(),
        app_id,
    })
}

fn not_connected(message: &str) -> InvocationError {
    InvocationError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        message.to_string(),
    ))
}

// ─── Construction ────────────────────────────────────────────────────────────

impl Sender {
    /// Establish a session: load or import credentials, connect the
    /// transport, start the receive loop, and run the key exchange if no
    /// auth key is available yet.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        if let Some(level) = config.log_level {
            log::set_max_level(level);
        }

        let storage: Arc<dyn SessionStorage> = match (config.storage, &config.session_file) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FileStorage::new(path.clone())),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let imported = config.string_session.is_some();
        let loaded = match &config.string_session {
            Some(text) => Some(
                string_session::decode(text)
                    .map_err(|e| InvocationError::Deserialize(e.to_string()))?,
            ),
            None => storage.load()?,
        };
        if loaded.is_some() {
            log::info!("[sender] loaded session ({})", storage.name());
        }

        let endpoint = loaded
            .as_ref()
            .map(|data| data.endpoint.clone())
            .or(config.endpoint)
            .or_else(|| config.datacenter_id.and_then(endpoints::lookup))
            .or_else(|| endpoints::lookup(endpoints::DEFAULT_DC))
            .ok_or_else(|| InvocationError::Deserialize("no endpoint to connect to".into()))?;

        let app_id = match (config.app_id, &loaded) {
            (0, Some(data)) => data.app_id,
            (id, _) => id,
        };

        let sender = Sender {
            inner: Arc::new(SenderInner {
                app_id,
                public_key: config.public_key,
                proxy: config.socks_proxy,
                storage,
                memory_only: config.memory_only,
                session: Mutex::new(SessionState {
                    channel: loaded
                        .as_ref()
                        .map(|data| SecureChannel::new(AuthKey::from_bytes(data.auth_key))),
                    salt: loaded.as_ref().map(|data| data.salt).unwrap_or(0),
                    endpoint,
                }),
                msg_id: Mutex::new(MsgIdGen::new()),
                seq_no: Mutex::new(SeqNoGen::new()),
                mailboxes: StdMutex::new(HashMap::new()),
                conn: Mutex::new(ConnState {
                    writer: None,
                    loop_handle: None,
                    generation: 0,
                }),
                service: StdMutex::new(None),
                handlers: StdMutex::new(Vec::new()),
                exported: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
            }),
        };

        if imported {
            sender.persist().await?;
        }

        sender.connect_transport().await?;
        Ok(sender)
    }

    async fn connect_transport(&self) -> Result<(), InvocationError> {
        let endpoint = self.inner.session.lock().await.endpoint.clone();
        log::info!("[sender] connecting to {endpoint}");
        let (reader, writer) = transport::connect(
            &endpoint,
            self.inner.proxy.as_ref(),
            transport::CONNECT_TIMEOUT,
        )
        .await?;

        {
            let mut conn = self.inner.conn.lock().await;
            if let Some(handle) = conn.loop_handle.take() {
                handle.abort();
            }
            conn.generation += 1;
            conn.writer = Some(writer);
            let generation = conn.generation;
            conn.loop_handle = Some(tokio::spawn(self.clone().run_receive_loop(reader, generation)));
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        let needs_handshake = self.inner.session.lock().await.channel.is_none();
        if needs_handshake {
            if let Err(e) = self.run_handshake().await {
                self.disconnect().await;
                return Err(e);
            }
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    /// Whether a transport is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The datacenter address this sender talks to.
    pub async fn endpoint(&self) -> String {
        self.inner.session.lock().await.endpoint.clone()
    }

    /// The logical datacenter id, resolved via the endpoint table.
    pub async fn dc_id(&self) -> i32 {
        endpoints::dc_for_endpoint(&self.endpoint().await)
    }

    /// The application id this session runs under.
    pub fn app_id(&self) -> i32 {
        self.inner.app_id
    }

    /// Register a handler for inbound objects the engine does not consume
    /// itself (updates and other server-initiated payloads). Handlers are
    /// offered objects in registration order; the first to return `true`
    /// claims the object.
    pub fn add_server_request_handler(
        &self,
        handler: impl Fn(u32, &[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.inner.handlers.lock().unwrap().push(Arc::new(handler));
    }

    // ── Session export / import ────────────────────────────────────────────

    /// Snapshot the current credentials.
    pub async fn export_session(&self) -> Option<SessionData> {
        let session = self.inner.session.lock().await;
        session_data(&session, self.inner.app_id)
    }

    /// The portable string form of the current credentials.
    pub async fn export_string(&self) -> Result<String, InvocationError> {
        self.export_session()
            .await
            .map(|data| string_session::encode(&data))
            .ok_or_else(|| not_connected("no auth key to export"))
    }

    /// Replace this sender's credentials and reconnect under them.
    pub async fn import_session(&self, data: SessionData) -> Result<(), InvocationError> {
        {
            let mut session = self.inner.session.lock().await;
            session.channel = Some(SecureChannel::new(AuthKey::from_bytes(data.auth_key)));
            session.salt = data.salt;
            session.endpoint = data.endpoint;
        }
        self.persist().await?;
        self.reconnect().await
    }

    async fn persist(&self) -> Result<(), InvocationError> {
        if self.inner.memory_only {
            return Ok(());
        }
        let data = {
            let session = self.inner.session.lock().await;
            session_data(&session, self.inner.app_id)
        };
        if let Some(data) = data {
            self.inner.storage.save(&data)?;
        }
        Ok(())
    }

    /// Best-effort persist used from the receive loop, where a failed write
    /// must not kill the connection.
    fn persist_data(&self, data: Option<SessionData>) {
        if self.inner.memory_only {
            return;
        }
        if let Some(data) = data {
            if let Err(e) = self.inner.storage.save(&data) {
                log::warn!("[sender] saving session failed: {e}");
            }
        }
    }

    // ── Sending ────────────────────────────────────────────────────────────

    /// Send a typed request and await its typed response.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.send(&request.to_bytes(), &[]).await?;
        R::Return::from_bytes(&body).map_err(Into::into)
    }

    /// Send a TL-serialized request and await the raw result payload.
    ///
    /// `expected_types` optionally lists constructor ids the response may
    /// start with; a matching payload is delivered verbatim instead of being
    /// interpreted as a service wrapper.
    ///
    /// Recoverable faults are absorbed here: flood waits sleep and retry,
    /// salt changes and reconnects replay the request with a fresh message
    /// id, and a broken write gets one reconnect-and-resend. Everything else
    /// surfaces as an error.
    pub async fn send(
        &self,
        body: &[u8],
        expected_types: &[u32],
    ) -> Result<Vec<u8>, InvocationError> {
        let mut pipe_retries = 0u32;
        let mut total_wait = Duration::ZERO;

        loop {
            let (msg_id, rx) = match self.post(body, expected_types).await {
                Ok(posted) => posted,
                Err(e) if e.is_closed_pipe() && pipe_retries < MAX_PIPE_RETRIES => {
                    pipe_retries += 1;
                    log::info!("[sender] connection pipe broken, reconnecting");
                    self.reconnect().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Abandoning the future must unregister the mailbox; the server
            // may still process the request, but correlation is dropped.
            let guard = MailboxGuard { sender: self, msg_id };
            let delivered = rx.await;
            drop(guard);

            match delivered {
                Err(_) => return Err(InvocationError::Dropped),
                Ok(Delivery::ConfigsChanged) => continue,
                Ok(Delivery::Response(bytes)) => return Ok(bytes),
                Ok(Delivery::Failure(e)) => {
                    if let Some(seconds) = e.flood_wait_seconds() {
                        let wait = Duration::from_secs(seconds);
                        if wait <= MAX_FLOOD_WAIT && total_wait + wait <= MAX_TOTAL_WAIT {
                            log::info!("[sender] FLOOD_WAIT_{seconds}, sleeping before retry");
                            tokio::time::sleep(wait).await;
                            total_wait += wait;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Send without registering for a response; used for pings and acks.
    pub async fn send_oneway(&self, body: &[u8]) -> Result<(), InvocationError> {
        let (salt, channel) = self.encryption_state().await?;
        let msg_id = self.inner.msg_id.lock().await.next();
        let seq_no = self.inner.seq_no.lock().await.next(false);
        let packet = channel.encode(salt, msg_id, seq_no, body);
        self.write_packet(&packet).await
    }

    /// Round-trip a ping and report the elapsed time.
    pub async fn ping(&self) -> Result<Duration, InvocationError> {
        let mut random = [0u8; 8];
        getrandom::getrandom(&mut random).expect("os rng unavailable");
        let ping_id = i64::from_le_bytes(random);
        let start = std::time::Instant::now();
        let pong = self.invoke(&service::Ping { ping_id }).await?;
        if pong.ping_id != ping_id {
            return Err(InvocationError::Deserialize("pong answered a different ping".into()));
        }
        Ok(start.elapsed())
    }

    /// Register a mailbox, encrypt, and put the request on the wire.
    ///
    /// The session mutex is released before any I/O happens.
    async fn post(
        &self,
        body: &[u8],
        expected_types: &[u32],
    ) -> Result<(i64, oneshot::Receiver<Delivery>), InvocationError> {
        let (salt, channel) = self.encryption_state().await?;
        let msg_id = self.inner.msg_id.lock().await.next();
        let seq_no = self.inner.seq_no.lock().await.next(true);

        let (tx, rx) = oneshot::channel();
        self.inner.mailboxes.lock().unwrap().insert(
            msg_id,
            Mailbox { tx, expected_types: expected_types.to_vec() },
        );

        let packet = channel.encode(salt, msg_id, seq_no, body);
        if let Err(e) = self.write_packet(&packet).await {
            self.inner.mailboxes.lock().unwrap().remove(&msg_id);
            return Err(e);
        }
        Ok((msg_id, rx))
    }

    async fn encryption_state(&self) -> Result<(i64, SecureChannel), InvocationError> {
        let session = self.inner.session.lock().await;
        let channel = session
            .channel
            .clone()
            .ok_or_else(|| not_connected("no auth key established"))?;
        Ok((session.salt, channel))
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InvocationError> {
        let mut conn = self.inner.conn.lock().await;
        match conn.writer.as_mut() {
            Some(writer) => writer.write_packet(packet).await,
            None => Err(not_connected("transport is closed")),
        }
    }

    // ── Receive loop ───────────────────────────────────────────────────────

    async fn run_receive_loop(self, mut reader: transport::FrameReader, generation: u64) {
        loop {
            let mut frame = match reader.read_packet().await {
                Ok(frame) => frame,
                Err(InvocationError::Transport { code }) => {
                    if code == AUTH_KEY_EXPIRED {
                        log::warn!("[sender] auth key unknown or expired, renegotiating");
                        self.inner.session.lock().await.channel = None;
                        self.spawn_rehandshake();
                        continue;
                    }
                    log::error!("[sender] unhandled transport error code {code}");
                    self.spawn_reconnect(generation);
                    continue;
                }
                Err(e) => {
                    log::info!("[sender] connection lost ({e}), reconnecting");
                    self.spawn_reconnect(generation);
                    return;
                }
            };

            // A zero key id marks a plaintext frame; those only exist around
            // the key exchange.
            if frame.len() >= 8 && frame[..8] == [0u8; 8] {
                match PlainMessage::from_bytes(&frame) {
                    Ok(message) => {
                        if !self.route_service(message.body) {
                            log::warn!("[sender] plaintext frame outside key exchange");
                        }
                    }
                    Err(e) => log::warn!("[sender] bad plaintext frame: {e}"),
                }
                continue;
            }

            let channel = match self.inner.session.lock().await.channel.clone() {
                Some(channel) => channel,
                None => {
                    log::warn!("[sender] dropping encrypted frame: no auth key");
                    continue;
                }
            };
            let message = match channel.decode(&mut frame) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("[sender] failed to decode frame: {e}");
                    self.spawn_reconnect(generation);
                    return;
                }
            };

            // While the key exchange runs, the driver owns every object.
            if self.route_service(message.body.clone()) {
                continue;
            }

            let mut acks = Vec::new();
            if let Err(e) = self
                .dispatch(message.msg_id, message.seq_no, message.body, &mut acks, generation)
                .await
            {
                log::error!("[sender] dispatch failed: {e}");
                self.spawn_reconnect(generation);
                return;
            }

            if !acks.is_empty() {
                let ack = service::MsgsAck { msg_ids: acks }.to_bytes();
                if let Err(e) = self.send_oneway(&ack).await {
                    log::debug!("[sender] ack send failed: {e}");
                }
            }
        }
    }

    /// Route a decoded body to the key-exchange driver if one is active.
    fn route_service(&self, body: Vec<u8>) -> bool {
        let service = self.inner.service.lock().unwrap();
        match service.as_ref() {
            Some(tx) => {
                let _ = tx.send(body);
                true
            }
            None => false,
        }
    }

    async fn dispatch(
        &self,
        msg_id: i64,
        seq_no: i32,
        body: Vec<u8>,
        acks: &mut Vec<i64>,
        generation: u64,
    ) -> Result<(), InvocationError> {
        let mut queue: VecDeque<(i64, i32, Vec<u8>)> = VecDeque::new();
        queue.push_back((msg_id, seq_no, body));

        while let Some((msg_id, seq_no, body)) = queue.pop_front() {
            if seq_no & 1 != 0 {
                acks.push(msg_id);
            }

            match service::ServiceMessage::from_bytes(&body)? {
                service::ServiceMessage::Container(items) => {
                    for item in items {
                        queue.push_back((item.msg_id, item.seq_no, item.bytes));
                    }
                }
                service::ServiceMessage::GzipPacked(packed) => {
                    // Re-dispatch the inflated object; seq 0 so the original
                    // message is not acknowledged twice.
                    queue.push_back((msg_id, 0, gz_unpack(&packed)?));
                }
                service::ServiceMessage::BadServerSalt(notice) => {
                    log::info!("[sender] server salt rotated");
                    let data = {
                        let mut session = self.inner.session.lock().await;
                        session.salt = notice.new_server_salt;
                        session_data(&session, self.inner.app_id)
                    };
                    self.persist_data(data);
                    // The supervisor re-enqueues every pending request.
                    self.spawn_reconnect(generation);
                }
                service::ServiceMessage::NewSessionCreated(notice) => {
                    let data = {
                        let mut session = self.inner.session.lock().await;
                        session.salt = notice.server_salt;
                        session_data(&session, self.inner.app_id)
                    };
                    self.persist_data(data);
                }
                service::ServiceMessage::Pong(pong) => {
                    // A pong answers the ping's own msg_id; unsolicited ones
                    // need no action.
                    if let Some(mailbox) = self.take_mailbox(pong.msg_id) {
                        let _ = mailbox.tx.send(Delivery::Response(body));
                    }
                }
                service::ServiceMessage::MsgsAck(_) => {}
                service::ServiceMessage::BadMsgNotification(notice) => {
                    match self.take_mailbox(notice.bad_msg_id) {
                        Some(mailbox) => {
                            let _ = mailbox.tx.send(Delivery::Failure(
                                InvocationError::BadMessage { code: notice.error_code },
                            ));
                        }
                        None => {
                            return Err(InvocationError::BadMessage { code: notice.error_code })
                        }
                    }
                }
                service::ServiceMessage::RpcResult { req_msg_id, body: result } => {
                    match self.take_mailbox(req_msg_id) {
                        Some(mailbox) => {
                            let delivery = resolve_result(result, &mailbox.expected_types);
                            let _ = mailbox.tx.send(delivery);
                        }
                        None => {
                            log::debug!(
                                "[sender] result for unknown msg_id {req_msg_id}, offering as update"
                            );
                            if !self.offer_to_handlers(&result) {
                                log::warn!("[sender] unhandled orphan result");
                            }
                        }
                    }
                }
                service::ServiceMessage::Opaque(constructor_id, bytes) => {
                    if !self.offer_to_handlers(&bytes) {
                        log::warn!("[sender] unhandled incoming object {constructor_id:#010x}");
                    }
                }
            }
        }
        Ok(())
    }

    fn take_mailbox(&self, msg_id: i64) -> Option<Mailbox> {
        self.inner.mailboxes.lock().unwrap().remove(&msg_id)
    }

    /// Offer an unsolicited object to the registered handlers, outside any
    /// lock, in registration order.
    fn offer_to_handlers(&self, bytes: &[u8]) -> bool {
        let handlers: Vec<ServerRequestHandler> =
            self.inner.handlers.lock().unwrap().clone();
        let constructor_id = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(0);
        handlers.iter().any(|handler| handler(constructor_id, bytes))
    }

    // ── Reconnection supervisor ────────────────────────────────────────────

    /// Tear down and rebuild the connection. Safe to call from anywhere;
    /// concurrent calls collapse into a single rebuild.
    pub async fn reconnect(&self) -> Result<(), InvocationError> {
        let generation = self.inner.conn.lock().await.generation;
        self.reconnect_from(generation).await
    }

    async fn reconnect_from(&self, seen_generation: u64) -> Result<(), InvocationError> {
        let endpoint = self.inner.session.lock().await.endpoint.clone();
        {
            let mut conn = self.inner.conn.lock().await;
            if conn.generation != seen_generation {
                // Somebody else already rebuilt this connection.
                return Ok(());
            }
            if let Some(handle) = conn.loop_handle.take() {
                handle.abort();
            }
            conn.writer = None;

            log::info!("[sender] reconnecting to {endpoint}");
            let (reader, writer) = transport::connect(
                &endpoint,
                self.inner.proxy.as_ref(),
                transport::CONNECT_TIMEOUT,
            )
            .await?;
            conn.generation += 1;
            conn.writer = Some(writer);
            let generation = conn.generation;
            conn.loop_handle =
                Some(tokio::spawn(self.clone().run_receive_loop(reader, generation)));
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        if self.inner.session.lock().await.channel.is_none() {
            self.run_handshake().await?;
        }

        // Reissue in-flight requests: every pending mailbox learns the
        // session configs changed and re-enqueues under a fresh msg id.
        self.broadcast_configs_changed();

        if let Err(e) = self
            .send_oneway(&service::Ping { ping_id: WARMUP_PING_ID }.to_bytes())
            .await
        {
            log::warn!("[sender] warm-up ping failed: {e}");
        }
        Ok(())
    }

    fn spawn_reconnect(&self, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reconnect_from(generation).await {
                log::error!("[sender] reconnect failed: {e}");
                this.inner.connected.store(false, Ordering::SeqCst);
            }
        });
    }

    fn spawn_rehandshake(&self) {
        if self.inner.service.lock().unwrap().is_some() {
            return; // exchange already in flight
        }
        let this = self.clone();
        tokio::spawn(async move {
            match this.run_handshake().await {
                Ok(()) => this.broadcast_configs_changed(),
                Err(e) => log::error!("[sender] re-keying failed: {e}"),
            }
        });
    }

    fn broadcast_configs_changed(&self) {
        let drained: Vec<Mailbox> = {
            let mut mailboxes = self.inner.mailboxes.lock().unwrap();
            mailboxes.drain().map(|(_, mailbox)| mailbox).collect()
        };
        for mailbox in drained {
            let _ = mailbox.tx.send(Delivery::ConfigsChanged);
        }
    }

    /// Stop the background tasks and drop the transport. Pending mailboxes
    /// stay registered so a later [`Sender::reconnect`] can replay them.
    pub async fn disconnect(&self) {
        let mut conn = self.inner.conn.lock().await;
        if let Some(handle) = conn.loop_handle.take() {
            handle.abort();
        }
        conn.writer = None;
        // Invalidate reconnect triggers still in flight from the dead loop.
        conn.generation += 1;
        drop(conn);
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        self.disconnect().await;
        let drained: Vec<Mailbox> = {
            let mut mailboxes = self.inner.mailboxes.lock().unwrap();
            mailboxes.drain().map(|(_, mailbox)| mailbox).collect()
        };
        for mailbox in drained {
            let _ = mailbox.tx.send(Delivery::Failure(InvocationError::Terminated));
        }
    }

    /// Permanently stop this sender: every pending request fails with
    /// [`InvocationError::Terminated`], and all exported senders are
    /// terminated too.
    pub async fn terminate(&self) {
        self.cleanup_exported().await;
        self.shutdown().await;
        log::info!("[sender] terminated");
    }

    // ── Key exchange driver ────────────────────────────────────────────────

    /// Negotiate a fresh auth key over the live transport.
    ///
    /// Activates service mode: the receive loop feeds every decoded object
    /// into a sequential channel this driver consumes, bypassing mailbox
    /// correlation entirely.
    async fn run_handshake(&self) -> Result<(), InvocationError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut service = self.inner.service.lock().unwrap();
            if service.is_some() {
                log::debug!("[sender] key exchange already running");
                return Ok(());
            }
            *service = Some(tx);
        }

        log::info!("[sender] generating a new auth key");
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.drive_handshake(&mut rx)).await;
        *self.inner.service.lock().unwrap() = None;

        match result {
            Ok(Ok(())) => {
                log::info!("[sender] auth key ready");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(InvocationError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "key exchange timed out",
            ))),
        }
    }

    async fn drive_handshake(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(), InvocationError> {
        let (request, state) = authentication::step1()?;
        let res_pq: service::ResPq = self.service_invoke(&request, rx).await?;

        let (request, state) = authentication::step2(state, res_pq, &self.inner.public_key)?;
        let dh_params: service::ServerDhParams = self.service_invoke(&request, rx).await?;

        let (request, state) = authentication::step3(state, dh_params)?;
        let answer: service::DhGenAnswer = self.service_invoke(&request, rx).await?;

        let finished = authentication::finish(state, answer)?;

        {
            let mut session = self.inner.session.lock().await;
            session.channel =
                Some(SecureChannel::new(AuthKey::from_bytes(finished.auth_key)));
            session.salt = finished.first_salt;
        }
        self.inner.msg_id.lock().await.set_time_offset(finished.time_offset);
        self.persist().await
    }

    /// One plaintext round trip through the service channel.
    async fn service_invoke<R: RemoteCall>(
        &self,
        request: &R,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<R::Return, InvocationError> {
        let msg_id = self.inner.msg_id.lock().await.next();
        let frame = PlainMessage::new(msg_id, request.to_bytes()).to_bytes();
        self.write_packet(&frame).await?;

        loop {
            let body = rx.recv().await.ok_or(InvocationError::Dropped)?;
            match R::Return::from_bytes(&body) {
                Ok(value) => return Ok(value),
                Err(_) => log::debug!("[sender] skipping stray object during key exchange"),
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Removes the mailbox when the awaiting future goes away.
struct MailboxGuard<'a> {
    sender: &'a Sender,
    msg_id: i64,
}

impl Drop for MailboxGuard<'_> {
    fn drop(&mut self) {
        self.sender
            .inner
            .mailboxes
            .lock()
            .unwrap()
            .remove(&self.msg_id);
    }
}

/// Unwrap the payload inside an `rpc_result`: peel gzip and error wrappers,
/// but deliver verbatim as soon as a hinted constructor shows up.
fn resolve_result(mut body: Vec<u8>, expected_types: &[u32]) -> Delivery {
    loop {
        if body.len() < 4 {
            return Delivery::Response(body);
        }
        let constructor_id = u32::from_le_bytes(body[..4].try_into().unwrap());
        if expected_types.contains(&constructor_id) {
            return Delivery::Response(body);
        }
        match constructor_id {
            service::ID_GZIP_PACKED => {
                let mut cursor = Cursor::from_slice(&body[4..]);
                let packed = match Vec::<u8>::deserialize(&mut cursor) {
                    Ok(packed) => packed,
                    Err(e) => return Delivery::Failure(e.into()),
                };
                match gz_unpack(&packed) {
                    Ok(inflated) => body = inflated,
                    Err(e) => return Delivery::Failure(e),
                }
            }
            service::ID_RPC_ERROR => {
                let mut cursor = Cursor::from_slice(&body[4..]);
                return match service::RpcError::deserialize_fields(&mut cursor) {
                    Ok(error) => Delivery::Failure(InvocationError::Rpc(RpcError::parse(
                        error.error_code,
                        &error.error_message,
                    ))),
                    Err(e) => Delivery::Failure(e.into()),
                };
            }
            _ => return Delivery::Response(body),
        }
    }
}

fn gz_unpack(data: &[u8]) -> Result<Vec<u8>, InvocationError> {
    use std::io::Read;
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| InvocationError::Deserialize("decompression failed".into()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_sender() -> Sender {
        Sender {
            inner: Arc::new(SenderInner {
                app_id: 1,
                public_key: rsa::Key::new("65537", "65537").unwrap(),
                proxy: None,
                storage: Arc::new(MemoryStorage::new()),
                memory_only: true,
                session: Mutex::new(SessionState {
                    channel: None,
                    salt: 0,
                    endpoint: "203.0.113.1:443".into(),
                }),
                msg_id: Mutex::new(MsgIdGen::new()),
                seq_no: Mutex::new(SeqNoGen::new()),
                mailboxes: StdMutex::new(HashMap::new()),
                conn: Mutex::new(ConnState { writer: None, loop_handle: None, generation: 0 }),
                service: StdMutex::new(None),
                handlers: StdMutex::new(Vec::new()),
                exported: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
            }),
        }
    }

    #[test]
    fn service_mode_diverts_every_object_from_mailboxes() {
        let sender = bare_sender();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *sender.inner.service.lock().unwrap() = Some(tx);

        // Even a pong that has a matching mailbox must go to the driver.
        let (mailbox_tx, mut mailbox_rx) = oneshot::channel();
        sender.inner.mailboxes.lock().unwrap().insert(
            42,
            Mailbox { tx: mailbox_tx, expected_types: Vec::new() },
        );

        let pong = service::Pong { msg_id: 42, ping_id: 7 }.to_bytes();
        assert!(sender.route_service(pong.clone()));
        assert_eq!(rx.try_recv().unwrap(), pong);
        assert!(mailbox_rx.try_recv().is_err(), "mailbox must stay empty");
        assert_eq!(sender.inner.mailboxes.lock().unwrap().len(), 1);

        // With service mode off, routing declines.
        *sender.inner.service.lock().unwrap() = None;
        assert!(!sender.route_service(pong));
    }

    #[test]
    fn resolve_result_peels_error_wrappers() {
        let error = service::RpcError {
            error_code: 420,
            error_message: "FLOOD_WAIT_3".into(),
        }
        .to_bytes();
        match resolve_result(error, &[]) {
            Delivery::Failure(InvocationError::Rpc(e)) => {
                assert_eq!(e.message, "FLOOD_WAIT");
                assert_eq!(e.extra, Some(3));
            }
            _ => panic!("expected an rpc error"),
        }
    }

    #[test]
    fn resolve_result_honors_expected_type_hints() {
        // A payload that *looks* like a gzip wrapper must be delivered
        // verbatim when the caller declared its constructor id.
        let mut fake = Vec::new();
        service::ID_GZIP_PACKED.serialize(&mut fake);
        fake.extend_from_slice(&[1, 2, 3, 4]);

        match resolve_result(fake.clone(), &[service::ID_GZIP_PACKED]) {
            Delivery::Response(bytes) => assert_eq!(bytes, fake),
            _ => panic!("hinted payload must come back verbatim"),
        }
        // Without the hint it is treated as compression and fails to inflate.
        assert!(matches!(resolve_result(fake, &[]), Delivery::Failure(_)));
    }

    #[test]
    fn resolve_result_inflates_gzip() {
        use std::io::Write;
        let inner = service::Pong { msg_id: 1, ping_id: 2 }.to_bytes();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&inner).unwrap();
        let packed = encoder.finish().unwrap();

        let mut body = Vec::new();
        service::ID_GZIP_PACKED.serialize(&mut body);
        packed.serialize(&mut body);

        match resolve_result(body, &[]) {
            Delivery::Response(bytes) => assert_eq!(bytes, inner),
            _ => panic!("expected inflated payload"),
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_results_and_collects_acks() {
        let sender = bare_sender();
        let (tx, rx) = oneshot::channel();
        sender.inner.mailboxes.lock().unwrap().insert(
            900,
            Mailbox { tx, expected_types: Vec::new() },
        );

        let mut body = Vec::new();
        service::ID_RPC_RESULT.serialize(&mut body);
        900i64.serialize(&mut body);
        body.extend_from_slice(&[9, 9, 9, 9]);

        let mut acks = Vec::new();
        sender.dispatch(5000, 1, body, &mut acks, 0).await.unwrap();

        assert_eq!(acks, vec![5000], "odd seq_no must be acknowledged");
        match rx.await.unwrap() {
            Delivery::Response(bytes) => assert_eq!(bytes, vec![9, 9, 9, 9]),
            _ => panic!("expected a response"),
        }
        assert!(sender.inner.mailboxes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_routes_unknown_results_to_handlers() {
        let sender = bare_sender();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        sender.add_server_request_handler(move |id, _| {
            seen_clone.lock().unwrap().push(id);
            true
        });

        let mut update = Vec::new();
        0x11223344u32.serialize(&mut update);
        update.extend_from_slice(&[0; 8]);

        let mut acks = Vec::new();
        sender.dispatch(6000, 0, update, &mut acks, 0).await.unwrap();
        assert!(acks.is_empty(), "even seq_no needs no ack");
        assert_eq!(*seen.lock().unwrap(), vec![0x11223344]);
    }
}
