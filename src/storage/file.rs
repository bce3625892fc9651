//! File-backed storage drive.
//!
//! Layout under the drive root:
//!
//! ```text
//! root/
//!   .lock                          exclusive process lock
//!   securities/<security>/<kind>.bin   append-only range storage
//!   common/<kind>.bin                  news, board state
//!   snapshots/<kind>/<key>.bin         one write-replaced file per key
//! ```
//!
//! Every record is framed as magic + version + format byte + payload length
//! + payload + crc32 of the payload. Payloads are whole messages encoded per
//! the drive's [`StorageFormat`].

use super::{
    snapshot_record_key, MessageStorage, SnapshotStorage, StorageDrive, StorageFormat,
};
use crate::error::{AdapterError, Result};
use crate::message::Message;
use crate::types::{CandleKind, DataKind, SecurityId, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for a storage record.
const RECORD_MAGIC: &[u8; 4] = b"TPL\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

/// File-backed [`StorageDrive`].
pub struct FileDrive {
    root: PathBuf,
    format: StorageFormat,
    /// Exclusive drive lock, held for the drive's lifetime.
    _lock: File,
    storages: Mutex<HashMap<(Option<SecurityId>, DataKind), Arc<FileStorage>>>,
    snapshots: Mutex<HashMap<DataKind, Arc<FileSnapshots>>>,
}

impl FileDrive {
    /// Open or create a drive rooted at `root`.
    pub fn open(root: impl AsRef<Path>, format: StorageFormat) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join(".lock"))?;
        lock.try_lock_exclusive()
            .map_err(|_| AdapterError::Locked)?;

        Ok(Self {
            root,
            format,
            _lock: lock,
            storages: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        })
    }

    fn storage_path(&self, security: Option<&SecurityId>, kind: &DataKind) -> PathBuf {
        match security {
            Some(security) => self
                .root
                .join("securities")
                .join(sanitize(security.as_str()))
                .join(format!("{}.bin", kind_token(kind))),
            None => self.root.join("common").join(format!("{}.bin", kind_token(kind))),
        }
    }
}

impl StorageDrive for FileDrive {
    fn storage(&self, security: Option<&SecurityId>, kind: &DataKind) -> Arc<dyn MessageStorage> {
        let key = (security.cloned(), *kind);
        self.storages
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FileStorage::new(
                    self.storage_path(security, kind),
                    self.format,
                ))
            })
            .clone()
    }

    fn snapshot(&self, kind: &DataKind) -> Arc<dyn SnapshotStorage> {
        self.snapshots
            .lock()
            .entry(*kind)
            .or_insert_with(|| {
                Arc::new(FileSnapshots {
                    dir: self.root.join("snapshots").join(kind_token(kind)),
                    format: self.format,
                })
            })
            .clone()
    }

    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        let dir = self.root.join("securities").join(sanitize(security.as_str()));
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter(|entry| entry.metadata().map(|m| m.len() > 0).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                parse_candle_token(name.strip_suffix(".bin")?)
            })
            .collect()
    }
}

/// Append-only range storage over one file.
struct FileStorage {
    path: PathBuf,
    format: StorageFormat,
    file: Mutex<Option<File>>,
    /// Stored `(first, last)` server times; scanned lazily, kept current on save.
    bounds: RwLock<Option<Option<(Timestamp, Timestamp)>>>,
}

impl FileStorage {
    fn new(path: PathBuf, format: StorageFormat) -> Self {
        Self {
            path,
            format,
            file: Mutex::new(None),
            bounds: RwLock::new(None),
        }
    }

    /// Open the backing file, creating parent directories on first write.
    fn open_file(&self, create: bool) -> Result<Option<File>> {
        if create {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
        } else if !self.path.exists() {
            return Ok(None);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&self.path)?;
        Ok(Some(file))
    }

    fn read_all(&self) -> Result<Vec<Message>> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            match self.open_file(false)? {
                Some(file) => *guard = Some(file),
                None => return Ok(Vec::new()),
            }
        }
        let Some(file) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(0))?;
        let mut messages = Vec::new();
        loop {
            match read_record(file) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(err) => {
                    // A torn tail must not make the whole series unreadable.
                    tracing::warn!(path = %self.path.display(), error = %err,
                        "stopping at corrupt storage record");
                    break;
                }
            }
        }
        Ok(messages)
    }
}

impl MessageStorage for FileStorage {
    fn save(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut guard = self.file.lock();
        if guard.is_none() {
            match self.open_file(true)? {
                Some(file) => *guard = Some(file),
                None => return Ok(()),
            }
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };

        file.seek(SeekFrom::End(0))?;
        for message in messages {
            write_record(file, message, self.format)?;
        }
        file.sync_all()?;
        drop(guard);

        // Merge into known bounds; an unscanned file stays unscanned and
        // the next `dates` call picks the new records up from disk.
        let mut bounds = self.bounds.write();
        if let Some(current) = *bounds {
            let mut first = current.map(|(first, _)| first);
            let mut last = current.map(|(_, last)| last);
            for message in messages {
                let time = message.server_time().unwrap_or_default();
                first = Some(first.map_or(time, |f| f.min(time)));
                last = Some(last.map_or(time, |l| l.max(time)));
            }
            *bounds = Some(first.zip(last));
        }

        Ok(())
    }

    fn load(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut messages: Vec<Message> = self
            .read_all()?
            .into_iter()
            .filter(|message| {
                message
                    .server_time()
                    .map(|time| from <= time && time < to)
                    .unwrap_or(false)
            })
            .collect();
        messages.sort_by_key(|message| message.server_time().unwrap_or_default());
        Ok(messages)
    }

    fn dates(&self) -> Result<Option<(Timestamp, Timestamp)>> {
        if let Some(bounds) = *self.bounds.read() {
            return Ok(bounds);
        }

        let mut first: Option<Timestamp> = None;
        let mut last: Option<Timestamp> = None;
        for message in self.read_all()? {
            let time = message.server_time().unwrap_or_default();
            first = Some(first.map_or(time, |f| f.min(time)));
            last = Some(last.map_or(time, |l| l.max(time)));
        }

        let bounds = first.zip(last);
        *self.bounds.write() = Some(bounds);
        Ok(bounds)
    }
}

/// One write-replaced file per snapshot key.
struct FileSnapshots {
    dir: PathBuf,
    format: StorageFormat,
}

impl FileSnapshots {
    fn read_file(&self, path: &Path) -> Result<Option<Message>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        read_record(&mut file)
    }
}

impl SnapshotStorage for FileSnapshots {
    fn get(&self, security: &SecurityId) -> Result<Option<Message>> {
        self.read_file(&self.dir.join(format!("{}.bin", sanitize(security.as_str()))))
    }

    fn update(&self, message: &Message) -> Result<()> {
        let Some(key) = snapshot_record_key(message) else {
            return Ok(());
        };

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.bin", sanitize(&key)));
        let tmp = self.dir.join(format!("{}.tmp", sanitize(&key)));

        let mut file = File::create(&tmp)?;
        write_record(&mut file, message, self.format)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn all(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut messages = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            if let Some(message) = self.read_file(&path)? {
                let in_range = message
                    .server_time()
                    .map(|time| from <= time && time < to)
                    .unwrap_or(false);
                if in_range {
                    messages.push(message);
                }
            }
        }
        messages.sort_by_key(|message| message.server_time().unwrap_or_default());
        Ok(messages)
    }
}

fn write_record(file: &mut File, message: &Message, format: StorageFormat) -> Result<()> {
    let (format_byte, payload) = match format {
        StorageFormat::MessagePack => (0u8, rmp_serde::to_vec(message)?),
        StorageFormat::Json => (1u8, serde_json::to_vec(message)?),
    };

    file.write_all(RECORD_MAGIC)?;
    file.write_all(&[RECORD_VERSION])?;
    file.write_all(&[format_byte])?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(&payload)?;
    file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one record; `Ok(None)` on clean end of file.
fn read_record(file: &mut File) -> Result<Option<Message>> {
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if &magic != RECORD_MAGIC {
        return Err(AdapterError::InvalidFormat("bad record magic".into()));
    }

    let mut header = [0u8; 2];
    file.read_exact(&mut header)?;
    if header[0] != RECORD_VERSION {
        return Err(AdapterError::InvalidFormat(format!(
            "unsupported record version: {}",
            header[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(AdapterError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let message = match header[1] {
        0 => rmp_serde::from_slice(&payload)?,
        1 => serde_json::from_slice(&payload)?,
        other => {
            return Err(AdapterError::InvalidFormat(format!(
                "unknown payload format: {other}"
            )))
        }
    };
    Ok(Some(message))
}

/// Directory/file token for a data kind.
fn kind_token(kind: &DataKind) -> String {
    match kind {
        DataKind::Ticks => "ticks".into(),
        DataKind::OrderLog => "orderlog".into(),
        DataKind::Level1 => "level1".into(),
        DataKind::MarketDepth => "depth".into(),
        DataKind::News => "news".into(),
        DataKind::BoardState => "board".into(),
        DataKind::Transactions => "transactions".into(),
        DataKind::Positions => "positions".into(),
        DataKind::Candles(kind) => format!("candles_{}", candle_token(kind)),
    }
}

fn candle_token(kind: &CandleKind) -> String {
    match kind {
        CandleKind::TimeFrame(micros) => format!("tf{micros}"),
        CandleKind::Tick(count) => format!("tick{count}"),
        CandleKind::Volume(volume) => format!("vol{volume}"),
        CandleKind::Range(range) => format!("range{range}"),
        CandleKind::Renko(size) => format!("renko{size}"),
        CandleKind::PointAndFigure(size) => format!("pnf{size}"),
    }
}

fn parse_candle_token(name: &str) -> Option<CandleKind> {
    let token = name.strip_prefix("candles_")?;
    let split = token.find(|c: char| c.is_ascii_digit())?;
    let (prefix, arg) = token.split_at(split);
    match prefix {
        "tf" => Some(CandleKind::TimeFrame(arg.parse().ok()?)),
        "tick" => Some(CandleKind::Tick(arg.parse().ok()?)),
        "vol" => Some(CandleKind::Volume(arg.parse().ok()?)),
        "range" => Some(CandleKind::Range(arg.parse().ok()?)),
        "renko" => Some(CandleKind::Renko(arg.parse().ok()?)),
        "pnf" => Some(CandleKind::PointAndFigure(arg.parse().ok()?)),
        _ => None,
    }
}

/// Keep file names portable: alphanumerics, dash and dot pass through.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
