//! Session persistence.
//!
//! The [`SessionStorage`] trait abstracts over where credentials live so
//! callers can swap in their own store; two built-ins are provided. File
//! writes go through a temp-file-and-rename so a crash can never leave a
//! half-written key/salt pair behind.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// The persisted credential record for one datacenter binding.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionData {
    /// The 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// The key's stable 8-byte identifier.
    pub auth_key_hash: [u8; 8],
    /// Last known server salt.
    pub salt: i64,
    /// `host:port` of the datacenter the key is bound to.
    pub endpoint: String,
    /// The application id the session was created under.
    pub app_id: i32,
}

/// An abstraction over where and how session data is persisted.
pub trait SessionStorage: Send + Sync {
    /// Persist the record. Must be atomic: a reader may never observe a
    /// partially written record.
    fn save(&self, data: &SessionData) -> io::Result<()>;

    /// Load the previously persisted record, or `None` if there is none.
    fn load(&self) -> io::Result<Option<SessionData>>;

    /// Remove the stored record (e.g. on migration or sign-out).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend, for log messages.
    fn name(&self) -> &str;
}

// ─── FileStorage ──────────────────────────────────────────────────────────────

const MAGIC: [u8; 4] = *b"TGSF";
const VERSION: u8 = 1;

/// The default backend: a compact binary file.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Store the session at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this backend writes to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn encode(data: &SessionData) -> Vec<u8> {
        let endpoint = data.endpoint.as_bytes();
        let mut buf = Vec::with_capacity(4 + 1 + 256 + 8 + 8 + 4 + 2 + endpoint.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&data.auth_key);
        buf.extend_from_slice(&data.auth_key_hash);
        buf.extend_from_slice(&data.salt.to_le_bytes());
        buf.extend_from_slice(&data.app_id.to_le_bytes());
        buf.extend_from_slice(&(endpoint.len() as u16).to_le_bytes());
        buf.extend_from_slice(endpoint);
        buf
    }

    fn decode(buf: &[u8]) -> io::Result<SessionData> {
        let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

        if buf.len() < 4 + 1 + 256 + 8 + 8 + 4 + 2 {
            return Err(bad("session file truncated"));
        }
        if buf[..4] != MAGIC {
            return Err(bad("not a session file"));
        }
        if buf[4] != VERSION {
            return Err(bad("unsupported session file version"));
        }

        let mut pos = 5usize;
        let mut auth_key = [0u8; 256];
        auth_key.copy_from_slice(&buf[pos..pos + 256]);
        pos += 256;
        let mut auth_key_hash = [0u8; 8];
        auth_key_hash.copy_from_slice(&buf[pos..pos + 8]);
        pos += 8;
        let salt = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let app_id = i32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let endpoint_len = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if buf.len() < pos + endpoint_len {
            return Err(bad("session file truncated"));
        }
        let endpoint = String::from_utf8(buf[pos..pos + endpoint_len].to_vec())
            .map_err(|_| bad("endpoint is not valid utf-8"))?;

        Ok(SessionData { auth_key, auth_key_hash, salt, endpoint, app_id })
    }
}

impl SessionStorage for FileStorage {
    fn save(&self, data: &SessionData) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&Self::encode(data))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<SessionData>> {
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Self::decode(&buf).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}

// ─── MemoryStorage ────────────────────────────────────────────────────────────

/// An ephemeral backend that never touches the disk.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<Option<SessionData>>,
}

impl MemoryStorage {
    /// An empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// An in-memory store seeded with a record.
    pub fn with_data(data: SessionData) -> Self {
        Self { data: Mutex::new(Some(data)) }
    }
}

impl SessionStorage for MemoryStorage {
    fn save(&self, data: &SessionData) -> io::Result<()> {
        *self.data.lock().unwrap() = Some(data.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<SessionData>> {
        Ok(self.data.lock().unwrap().clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.data.lock().unwrap() = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionData {
        SessionData {
            auth_key: [0xab; 256],
            auth_key_hash: [1, 2, 3, 4, 5, 6, 7, 8],
            salt: -12345,
            endpoint: "149.154.167.91:443".into(),
            app_id: 6,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tangram-storage-{name}-{}", std::process::id()));
        p
    }

    #[test]
    fn file_round_trip_is_byte_identical() {
        let path = temp_path("roundtrip");
        let storage = FileStorage::new(&path);
        storage.save(&sample()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample()));
        storage.delete().unwrap();
        assert_eq!(storage.load().unwrap(), None);
    }

    #[test]
    fn save_overwrites_whole_record() {
        let path = temp_path("overwrite");
        let storage = FileStorage::new(&path);
        storage.save(&sample()).unwrap();

        let mut second = sample();
        second.salt = 777;
        second.endpoint = "x:1".into();
        storage.save(&second).unwrap();
        assert_eq!(storage.load().unwrap(), Some(second));
        storage.delete().unwrap();
    }

    #[test]
    fn rejects_foreign_files() {
        let path = temp_path("foreign");
        std::fs::write(&path, b"definitely not a session").unwrap();
        let storage = FileStorage::new(&path);
        assert!(storage.load().is_err());
        storage.delete().unwrap();
    }

    #[test]
    fn delete_is_idempotent() {
        let storage = FileStorage::new(temp_path("missing"));
        storage.delete().unwrap();
        storage.delete().unwrap();
    }

    #[test]
    fn memory_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load().unwrap(), None);
        storage.save(&sample()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample()));
        storage.delete().unwrap();
        assert_eq!(storage.load().unwrap(), None);
    }
}
