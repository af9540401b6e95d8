//! On-disk state: retained messages and sessions.
//!
//! Two standalone files, each a 4-byte magic, a little-endian `u32`
//! format version, and a bincode body. Both round-trip losslessly:
//! every retained `(topic, payload, qos)` and every session's client
//! id, expiry, queued QoS>0 messages and subscription list survive a
//! save/load cycle. Unknown magics or versions fail the load; the
//! broker then starts empty rather than guessing.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const RETAINED_FILE: &str = "retained.db";
pub const SESSIONS_FILE: &str = "sessions.db";

const RETAINED_MAGIC: &[u8; 4] = b"EMBR";
const SESSIONS_MAGIC: &[u8; 4] = b"EMBS";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPacketRecord {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    pub session_expiry_interval: u32,
    pub queued: Vec<QueuedPacketRecord>,
    /// `(filter, qos)` pairs.
    pub subscriptions: Vec<(String, u8)>,
}

fn write_file<T: Serialize>(path: &Path, magic: &[u8; 4], body: &T) -> io::Result<()> {
    let encoded = bincode::serialize(body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    // Write to a sibling temp file first so a crash mid-save never
    // truncates the previous state.
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(magic)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_file<T: for<'de> Deserialize<'de>>(path: &Path, magic: &[u8; 4]) -> io::Result<Option<T>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    if &header[..4] != magic {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: bad magic", path.display()),
        ));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: unsupported format version {}", path.display(), version),
        ));
    }

    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    let decoded = bincode::deserialize(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(Some(decoded))
}

pub fn save_retained(records: &[RetainedRecord], dir: &Path) -> io::Result<()> {
    write_file(&dir.join(RETAINED_FILE), RETAINED_MAGIC, &records.to_vec())
}

pub fn load_retained(dir: &Path) -> io::Result<Vec<RetainedRecord>> {
    Ok(read_file(&dir.join(RETAINED_FILE), RETAINED_MAGIC)?.unwrap_or_default())
}

pub fn save_sessions(records: &[SessionRecord], dir: &Path) -> io::Result<()> {
    write_file(&dir.join(SESSIONS_FILE), SESSIONS_MAGIC, &records.to_vec())
}

pub fn load_sessions(dir: &Path) -> io::Result<Vec<SessionRecord>> {
    Ok(read_file(&dir.join(SESSIONS_FILE), SESSIONS_MAGIC)?.unwrap_or_default())
}
