//! The consensus write-ahead log.
//!
//! Every input the state machine consumes is appended here before it takes
//! effect, so that after a crash the current height can be replayed exactly.
//! Entries are framed as
//!
//! ```text
//! | crc32 (4 bytes, BE) | length (4 bytes, BE) | TimedWalMessage (protobuf) |
//! ```
//!
//! The log is split into segment files `wal.000000`, `wal.000001`, ... in one
//! directory. The newest segment is the head, which is rotated once it grows
//! beyond a size limit; the oldest segments are removed once the whole log
//! grows beyond a total limit. `EndHeight(h)` entries mark that height `h`
//! was fully committed, and are what replay seeks to.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message as _;

use crate::messages::{TimedWalMessage, WalMessage};

/// Largest encoded message the log accepts.
pub const MAX_MSG_SIZE_BYTES: usize = 4 * 1024 * 1024;
/// Largest frame: the message plus framing and timestamp overhead.
pub const MAX_ENTRY_SIZE_BYTES: usize = MAX_MSG_SIZE_BYTES + 24;

const DEFAULT_HEAD_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
const DEFAULT_TOTAL_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;
const SEGMENT_PREFIX: &str = "wal.";

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL entry of {size} bytes exceeds the maximum of {max} bytes")]
    BadSize { size: usize, max: usize },
    #[error("WAL data corruption: {0}")]
    DataCorruption(String),
    #[error("WAL I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl WalError {
    pub fn is_data_corruption(&self) -> bool {
        matches!(self, WalError::DataCorruption(_))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SearchOptions {
    /// Skip the rest of a segment at a corrupted entry instead of failing.
    pub ignore_data_corruption: bool,
}

/// Durable, ordered storage of [`WalMessage`]s.
pub trait Wal: Send + Sync {
    /// Appends a message. It may sit in a buffer until the next sync.
    fn write(&mut self, msg: WalMessage) -> Result<(), WalError>;

    /// Appends a message and makes it durable before returning.
    fn write_sync(&mut self, msg: WalMessage) -> Result<(), WalError> {
        self.write(msg)?;
        self.flush_and_sync()
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError>;

    /// All entries after the `EndHeight(height)` marker, or `None` if there is
    /// no such marker.
    fn search_for_end_height(
        &mut self,
        height: i64,
        options: &SearchOptions,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError>;

    /// The height of the last `EndHeight` marker and every entry after it.
    /// A log without markers yields height 0 and no entries.
    fn read_last_height_msgs(&mut self) -> Result<(i64, Vec<TimedWalMessage>), WalError>;
}

/// Frames one entry.
pub fn encode(msg: &TimedWalMessage) -> Result<Vec<u8>, WalError> {
    let data = msg.to_proto().encode_to_vec();
    if data.len() > MAX_MSG_SIZE_BYTES {
        return Err(WalError::BadSize {
            size: data.len(),
            max: MAX_MSG_SIZE_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&crc32fast::hash(&data).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Reads framed entries one by one.
pub struct WalDecoder<R> {
    reader: R,
    /// Bytes of complete entries consumed so far.
    offset: u64,
}

impl<R: Read> WalDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Offset of the end of the last successfully decoded entry.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The next entry, or `None` at a clean end of the input.
    pub fn decode(&mut self) -> Result<Option<TimedWalMessage>, WalError> {
        let mut header = [0u8; 8];
        let read = read_full(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < header.len() {
            return Err(WalError::DataCorruption(format!(
                "truncated entry header at offset {}",
                self.offset
            )));
        }
        let crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length > MAX_MSG_SIZE_BYTES {
            return Err(WalError::DataCorruption(format!(
                "entry length {length} at offset {} exceeds the maximum of {MAX_MSG_SIZE_BYTES} bytes",
                self.offset
            )));
        }

        let mut data = vec![0u8; length];
        if read_full(&mut self.reader, &mut data)? < length {
            return Err(WalError::DataCorruption(format!(
                "truncated entry data at offset {}",
                self.offset
            )));
        }
        let actual = crc32fast::hash(&data);
        if actual != crc {
            return Err(WalError::DataCorruption(format!(
                "checksum mismatch at offset {}: expected {crc:#010x}, got {actual:#010x}",
                self.offset
            )));
        }
        let proto = p2p_proto::consensus::TimedWalMessage::decode(data.as_slice())
            .map_err(|e| WalError::DataCorruption(format!("undecodable entry at offset {}: {e}", self.offset)))?;
        let msg = TimedWalMessage::from_proto(proto)
            .map_err(|e| WalError::DataCorruption(format!("invalid entry at offset {}: {e}", self.offset)))?;

        self.offset += (header.len() + length) as u64;
        Ok(Some(msg))
    }
}

/// Like `read_exact`, but reports how much was read before the end.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A segmented write-ahead log on disk.
pub struct FileWal {
    dir: PathBuf,
    head: BufWriter<File>,
    head_index: u64,
    /// Size of every segment, head included, by index.
    segments: BTreeMap<u64, u64>,
    head_size_limit: u64,
    total_size_limit: u64,
}

impl FileWal {
    /// Opens the log in `dir`, creating it if needed. A torn entry at the end
    /// of the head segment, left by a crash mid-write, is cut off. A new log
    /// starts with an `EndHeight(0)` marker.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, WalError> {
        Self::open_with_limits(dir, DEFAULT_HEAD_SIZE_LIMIT, DEFAULT_TOTAL_SIZE_LIMIT)
    }

    pub fn open_with_limits(
        dir: impl AsRef<Path>,
        head_size_limit: u64,
        total_size_limit: u64,
    ) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        let head_index = segments.keys().next_back().copied().unwrap_or(0);
        let head_path = segment_path(&dir, head_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&head_path)?;
        segments.insert(head_index, file.metadata()?.len());

        let mut wal = Self {
            dir,
            head: BufWriter::new(file),
            head_index,
            segments,
            head_size_limit,
            total_size_limit,
        };
        wal.repair()?;

        if wal.segments.values().all(|&size| size == 0) {
            wal.write_sync(WalMessage::EndHeight(0))?;
        }
        tracing::debug!(dir = %wal.dir.display(), head = wal.head_index, "Opened WAL");
        Ok(wal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Truncates the head segment after its last valid entry. Returns whether
    /// anything was cut off.
    pub fn repair(&mut self) -> Result<bool, WalError> {
        self.head.flush()?;
        let path = segment_path(&self.dir, self.head_index);
        let mut decoder = WalDecoder::new(BufReader::new(File::open(&path)?));
        let error = loop {
            match decoder.decode() {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(false),
                Err(WalError::DataCorruption(reason)) => break reason,
                Err(e) => return Err(e),
            }
        };

        let valid = decoder.offset();
        let size = self.segments.get(&self.head_index).copied().unwrap_or_default();
        tracing::warn!(
            path = %path.display(),
            %valid,
            %size,
            %error,
            "Truncating corrupted tail of the WAL"
        );
        let file = self.head.get_ref();
        file.set_len(valid)?;
        file.sync_all()?;
        self.segments.insert(self.head_index, valid);
        Ok(true)
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.flush_and_sync()?;
        let index = self.head_index + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, index))?;
        self.head = BufWriter::new(file);
        self.head_index = index;
        self.segments.insert(index, 0);
        tracing::debug!(dir = %self.dir.display(), head = index, "Rotated WAL segment");
        self.enforce_total_size_limit()
    }

    fn enforce_total_size_limit(&mut self) -> Result<(), WalError> {
        while self.segments.values().sum::<u64>() > self.total_size_limit && self.segments.len() > 1 {
            let Some((&oldest, _)) = self.segments.iter().next() else {
                break;
            };
            let path = segment_path(&self.dir, oldest);
            fs::remove_file(&path)?;
            self.segments.remove(&oldest);
            tracing::info!(path = %path.display(), "Removed oldest WAL segment");
        }
        Ok(())
    }

    /// Every entry of one segment. With `ignore_data_corruption` the entries
    /// before a corrupted one are returned.
    fn read_segment(&self, index: u64, options: &SearchOptions) -> Result<Vec<TimedWalMessage>, WalError> {
        let path = segment_path(&self.dir, index);
        let mut decoder = WalDecoder::new(BufReader::new(File::open(&path)?));
        let mut entries = Vec::new();
        loop {
            match decoder.decode() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => return Ok(entries),
                Err(e) if e.is_data_corruption() && options.ignore_data_corruption => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupted WAL data");
                    return Ok(entries);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scans segments from the newest back for the last entry matching
    /// `is_marker`, returning it and everything after it.
    fn search_back(
        &mut self,
        options: &SearchOptions,
        is_marker: impl Fn(&WalMessage) -> bool,
    ) -> Result<Option<(TimedWalMessage, Vec<TimedWalMessage>)>, WalError> {
        self.head.flush()?;
        let mut newer: Vec<TimedWalMessage> = Vec::new();
        let indexes: Vec<u64> = self.segments.keys().rev().copied().collect();
        for index in indexes {
            let mut entries = self.read_segment(index, options)?;
            if let Some(position) = entries.iter().rposition(|entry| is_marker(&entry.msg)) {
                let mut after = entries.split_off(position + 1);
                let marker = entries.pop().expect("marker position is within the segment");
                after.append(&mut newer);
                return Ok(Some((marker, after)));
            }
            entries.append(&mut newer);
            newer = entries;
        }
        Ok(None)
    }
}

impl FileWal {
    /// Every entry in the log, oldest first, read lazily across segments.
    pub fn iter(&mut self) -> Result<WalIter, WalError> {
        self.head.flush()?;
        Ok(WalIter::new(self.dir.clone(), self.segments.keys().copied().collect()))
    }

    /// The entries after the `EndHeight(height)` marker, oldest first. Empty
    /// when the log holds no such marker.
    pub fn iter_from(&mut self, height: i64) -> Result<impl Iterator<Item = Result<TimedWalMessage, WalError>>, WalError> {
        let mut found = false;
        Ok(self.iter()?.skip_while(move |entry| {
            if found {
                return false;
            }
            if let Ok(TimedWalMessage {
                msg: WalMessage::EndHeight(h),
                ..
            }) = entry
            {
                found = *h == height;
                return true;
            }
            entry.is_ok()
        }))
    }
}

/// Forward iterator over the entries of a [`FileWal`]. Yields an error once,
/// at the first corrupted entry, and then ends.
pub struct WalIter {
    dir: PathBuf,
    segments: std::vec::IntoIter<u64>,
    decoder: Option<WalDecoder<BufReader<File>>>,
    done: bool,
}

impl WalIter {
    fn new(dir: PathBuf, segments: Vec<u64>) -> Self {
        Self {
            dir,
            segments: segments.into_iter(),
            decoder: None,
            done: false,
        }
    }
}

impl Iterator for WalIter {
    type Item = Result<TimedWalMessage, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.decoder.is_none() {
                let index = self.segments.next()?;
                match File::open(segment_path(&self.dir, index)) {
                    Ok(file) => self.decoder = Some(WalDecoder::new(BufReader::new(file))),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
            }
            let Some(decoder) = self.decoder.as_mut() else {
                continue;
            };
            match decoder.decode() {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => self.decoder = None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl Wal for FileWal {
    fn write(&mut self, msg: WalMessage) -> Result<(), WalError> {
        let frame = encode(&TimedWalMessage {
            time: meridian_common::time::now(),
            msg,
        })?;
        if frame.len() > MAX_ENTRY_SIZE_BYTES {
            return Err(WalError::BadSize {
                size: frame.len(),
                max: MAX_ENTRY_SIZE_BYTES,
            });
        }
        self.head.write_all(&frame)?;
        let head_size = self.segments.entry(self.head_index).or_default();
        *head_size += frame.len() as u64;
        if *head_size >= self.head_size_limit {
            self.rotate()?;
        }
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        self.head.flush()?;
        self.head.get_ref().sync_data()?;
        Ok(())
    }

    fn search_for_end_height(
        &mut self,
        height: i64,
        options: &SearchOptions,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError> {
        let found = self.search_back(options, |msg| matches!(msg, WalMessage::EndHeight(h) if *h == height))?;
        Ok(found.map(|(_, after)| after))
    }

    fn read_last_height_msgs(&mut self) -> Result<(i64, Vec<TimedWalMessage>), WalError> {
        let found = self.search_back(&SearchOptions::default(), |msg| matches!(msg, WalMessage::EndHeight(_)))?;
        Ok(match found {
            Some((
                TimedWalMessage {
                    msg: WalMessage::EndHeight(height),
                    ..
                },
                after,
            )) => (height, after),
            _ => (0, Vec::new()),
        })
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        if let Err(error) = self.flush_and_sync() {
            tracing::error!(dir = %self.dir.display(), %error, "Failed to flush WAL on close");
        }
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index:06}"))
}

fn list_segments(dir: &Path) -> Result<BTreeMap<u64, u64>, WalError> {
    let mut segments = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|name| name.strip_prefix(SEGMENT_PREFIX))
            .and_then(|index| index.parse::<u64>().ok())
        else {
            continue;
        };
        segments.insert(index, entry.metadata()?.len());
    }
    Ok(segments)
}

/// A log that forgets everything, for nodes running without one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NilWal;

impl Wal for NilWal {
    fn write(&mut self, _msg: WalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn search_for_end_height(
        &mut self,
        _height: i64,
        _options: &SearchOptions,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError> {
        Ok(None)
    }

    fn read_last_height_msgs(&mut self) -> Result<(i64, Vec<TimedWalMessage>), WalError> {
        Ok((0, Vec::new()))
    }
}
