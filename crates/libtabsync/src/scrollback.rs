use anyhow::{Context, Result, bail};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use tabsync_protocol::TerminalId;

pub const DEFAULT_MAX_BYTES: usize = 1_000_000;
const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

/// On-disk format. `content` is base64 so escape and non-UTF-8 bytes survive.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    content: String,
}

/// Raw output history of one terminal, capped by total byte size.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<Chunk>,
    total_bytes: usize,
    max_bytes: usize,
    path: PathBuf,
}

impl ScrollbackBuffer {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a chunk, evicting the oldest ones while over the cap.
    /// The newest chunk is always kept even if it alone exceeds the cap.
    pub fn append(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.total_bytes = self.total_bytes.saturating_add(data.len());
        self.chunks.push_back(Chunk {
            data,
            timestamp: SystemTime::now(),
        });
        while self.total_bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.total_bytes -= evicted.data.len();
            }
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn save_to_disk(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            content: base64::engine::general_purpose::STANDARD.encode(self.contents()),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&envelope)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Replace the in-memory contents with the persisted file.
    /// Returns `false` when no file exists. A file that is not an envelope
    /// is legacy plain output and becomes a single chunk.
    pub fn load_from_disk(&mut self) -> Result<bool> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        let content = match serde_json::from_slice::<Envelope>(&raw) {
            Ok(envelope) => {
                if envelope.version != ENVELOPE_VERSION {
                    bail!(
                        "unsupported scrollback version {} in {}",
                        envelope.version,
                        self.path.display()
                    );
                }
                base64::engine::general_purpose::STANDARD
                    .decode(envelope.content)
                    .with_context(|| format!("corrupt scrollback in {}", self.path.display()))?
            }
            Err(_) => raw,
        };

        self.clear();
        self.append(content);
        Ok(true)
    }

    pub fn delete_from_disk(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", self.path.display())),
        }
    }
}

/// All scrollback buffers of this client, one per terminal id.
///
/// Disk failures stop here: loads degrade to an empty buffer and saves
/// are logged without affecting the in-memory copy.
#[derive(Debug)]
pub struct ScrollbackStore {
    dir: PathBuf,
    max_bytes: usize,
    buffers: HashMap<TerminalId, ScrollbackBuffer>,
}

impl ScrollbackStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            buffers: HashMap::new(),
        }
    }

    /// File holding a terminal's scrollback. Bytes outside `[A-Za-z0-9-]`
    /// are written as `_xx`, so distinct ids never share a file.
    pub fn path_for(&self, terminal_id: &str) -> PathBuf {
        let mut file = String::with_capacity(terminal_id.len() + 5);
        for byte in terminal_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("_{byte:02x}"));
            }
        }
        file.push_str(".json");
        self.dir.join(file)
    }

    pub fn get(&self, terminal_id: &str) -> Option<&ScrollbackBuffer> {
        self.buffers.get(terminal_id)
    }

    fn buffer_mut(&mut self, terminal_id: &str) -> &mut ScrollbackBuffer {
        let path = self.path_for(terminal_id);
        let max_bytes = self.max_bytes;
        self.buffers
            .entry(terminal_id.to_string())
            .or_insert_with(|| ScrollbackBuffer::new(path, max_bytes))
    }

    pub fn append(&mut self, terminal_id: &str, data: Vec<u8>) {
        self.buffer_mut(terminal_id).append(data);
    }

    pub fn contents(&self, terminal_id: &str) -> Vec<u8> {
        self.buffers
            .get(terminal_id)
            .map(ScrollbackBuffer::contents)
            .unwrap_or_default()
    }

    /// Replace a buffer with the server's copy.
    pub fn replace(&mut self, terminal_id: &str, data: Vec<u8>) {
        let buffer = self.buffer_mut(terminal_id);
        buffer.clear();
        buffer.append(data);
    }

    pub fn clear(&mut self, terminal_id: &str) {
        let buffer = self.buffer_mut(terminal_id);
        buffer.clear();
        if let Err(err) = buffer.delete_from_disk() {
            warn!(terminal_id = %terminal_id, "failed to delete scrollback: {err:#}");
        }
    }

    /// Load the persisted buffer for a terminal the first time it is seen.
    pub fn restore(&mut self, terminal_id: &str) {
        if self.buffers.contains_key(terminal_id) {
            return;
        }
        let buffer = self.buffer_mut(terminal_id);
        match buffer.load_from_disk() {
            Ok(true) => {
                debug!(terminal_id = %terminal_id, bytes = buffer.total_bytes(), "scrollback restored");
            }
            Ok(false) => {}
            Err(err) => {
                warn!(terminal_id = %terminal_id, "discarding unreadable scrollback: {err:#}");
                buffer.clear();
            }
        }
    }

    pub fn persist(&self, terminal_id: &str) {
        if let Some(buffer) = self.buffers.get(terminal_id)
            && let Err(err) = buffer.save_to_disk()
        {
            warn!(terminal_id = %terminal_id, "failed to save scrollback: {err:#}");
        }
    }

    pub fn persist_all(&self) {
        for terminal_id in self.buffers.keys() {
            self.persist(terminal_id);
        }
    }

    /// Drop a buffer from memory and disk.
    pub fn forget(&mut self, terminal_id: &str) {
        let path = self.path_for(terminal_id);
        let buffer = self
            .buffers
            .remove(terminal_id)
            .unwrap_or_else(|| ScrollbackBuffer::new(path, self.max_bytes));
        if let Err(err) = buffer.delete_from_disk() {
            warn!(terminal_id = %terminal_id, "failed to delete scrollback: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_in(dir: &Path, max_bytes: usize) -> ScrollbackBuffer {
        ScrollbackBuffer::new(dir.join("t1.json"), max_bytes)
    }

    #[test]
    fn evicts_oldest_chunk_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer_in(dir.path(), DEFAULT_MAX_BYTES);
        buf.append(vec![b'a'; 400_000]);
        buf.append(vec![b'b'; 400_000]);
        buf.append(vec![b'c'; 400_000]);

        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.total_bytes(), 800_000);
        let contents = buf.contents();
        assert_eq!(contents[0], b'b');
        assert_eq!(contents[799_999], b'c');
    }

    #[test]
    fn single_oversized_chunk_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer_in(dir.path(), 10);
        buf.append(b"12345".to_vec());
        buf.append(vec![b'x'; 25]);

        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(buf.total_bytes(), 25);
    }

    #[test]
    fn total_stays_within_cap_after_many_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer_in(dir.path(), 100);
        for i in 0..200usize {
            buf.append(vec![b'z'; 1 + (i * 7) % 40]);
            assert!(buf.total_bytes() <= 100 || buf.chunk_count() == 1);
        }
        assert_eq!(buf.contents().len(), buf.total_bytes());
    }

    #[test]
    fn save_then_load_preserves_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = b"\x1b[?1049h\x1b[1;1H\x00\x07\xff\xfe plain \r\n".to_vec();

        let mut buf = buffer_in(dir.path(), DEFAULT_MAX_BYTES);
        buf.append(raw[..5].to_vec());
        buf.append(raw[5..].to_vec());
        buf.save_to_disk().unwrap();

        let mut loaded = buffer_in(dir.path(), DEFAULT_MAX_BYTES);
        assert!(loaded.load_from_disk().unwrap());
        assert_eq!(loaded.contents(), raw);
    }

    #[test]
    fn legacy_plain_file_loads_as_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.json");
        fs::write(&path, "$ ls\r\nCargo.toml  src\r\n").unwrap();

        let mut buf = buffer_in(dir.path(), DEFAULT_MAX_BYTES);
        assert!(buf.load_from_disk().unwrap());
        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(buf.contents(), b"$ ls\r\nCargo.toml  src\r\n");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = buffer_in(dir.path(), DEFAULT_MAX_BYTES);
        assert!(!buf.load_from_disk().unwrap());
        buf.delete_from_disk().unwrap();
        buf.delete_from_disk().unwrap();
    }

    #[test]
    fn store_degrades_corrupt_file_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ScrollbackStore::new(dir.path(), DEFAULT_MAX_BYTES);
        let path = store.path_for("t9");
        fs::write(&path, r#"{"version":1,"content":"%%%not-base64"}"#).unwrap();

        store.restore("t9");
        assert!(store.contents("t9").is_empty());
        store.append("t9", b"fresh".to_vec());
        assert_eq!(store.contents("t9"), b"fresh");
    }

    #[test]
    fn store_forget_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ScrollbackStore::new(dir.path(), DEFAULT_MAX_BYTES);
        store.append("t1", b"hello".to_vec());
        store.persist("t1");
        let path = store.path_for("t1");
        assert!(path.exists());

        store.forget("t1");
        assert!(!path.exists());
        assert!(store.get("t1").is_none());
        store.forget("t1");
    }

    #[test]
    fn path_for_sanitizes_ids() {
        let store = ScrollbackStore::new("/data", DEFAULT_MAX_BYTES);
        assert_eq!(store.path_for("t1"), PathBuf::from("/data/t1.json"));
        assert_eq!(
            store.path_for("../etc/x"),
            PathBuf::from("/data/_2e_2e_2fetc_2fx.json")
        );
    }

    #[test]
    fn similar_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ScrollbackStore::new(dir.path(), DEFAULT_MAX_BYTES);
        assert_ne!(store.path_for("a.b"), store.path_for("a_b"));
        assert_ne!(store.path_for("a_2eb"), store.path_for("a.b"));

        store.append("a.b", b"dot".to_vec());
        store.append("a_b", b"underscore".to_vec());
        store.persist_all();

        let mut fresh = ScrollbackStore::new(dir.path(), DEFAULT_MAX_BYTES);
        fresh.restore("a.b");
        fresh.restore("a_b");
        assert_eq!(fresh.contents("a.b"), b"dot");
        assert_eq!(fresh.contents("a_b"), b"underscore");
    }
}
