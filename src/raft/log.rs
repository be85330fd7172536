use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ::log::{debug, error, warn};
use sha2::{Digest, Sha256};

use super::RaftError;

const LOG_FILE: &str = "log.bin";
// u32 body length, then u32 body checksum
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            term,
            command: command.into(),
        }
    }
}

/// Durable, contiguous sequence of log entries.
///
/// Entries are kept in memory and mirrored to a single file of checksummed,
/// length-prefixed bincode frames. Appends are written at the end of the file
/// and synced before returning; truncation rewrites the file and swaps it in
/// atomically.
pub struct Log {
    entries: Vec<LogEntry>,
    // Index of the first retained entry. Only moves once compaction exists.
    start_index: u64,
    log_file: PathBuf,
    // Bytes of whole, synced frames. Anything past this is left over from a
    // failed write and is cut off before the next append.
    durable_len: u64,
}

impl Log {
    /// Opens the log stored under `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RaftError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut log = Self {
            entries: Vec::new(),
            start_index: 1,
            log_file: dir.join(LOG_FILE),
            durable_len: 0,
        };

        if log.log_file.exists() {
            log.load_from_disk()?;
        }

        Ok(log)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn last_index(&self) -> u64 {
        self.start_index + self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`. Index 0 is the empty prefix and has term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).ok().map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Result<&LogEntry, RaftError> {
        let offset = self.offset(index)?;
        Ok(&self.entries[offset])
    }

    /// Entries in `[start, end]`. A range with `start == end + 1` is empty.
    pub fn get_range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, RaftError> {
        if start > end {
            if start == end + 1 && start >= self.start_index && start <= self.last_index() + 1 {
                return Ok(Vec::new());
            }
            return Err(self.out_of_range(start));
        }

        let first = self.offset(start)?;
        let last = self.offset(end)?;
        Ok(self.entries[first..=last].to_vec())
    }

    /// Every entry from `start` through the last index.
    pub fn entries_from(&self, start: u64) -> Result<Vec<LogEntry>, RaftError> {
        self.get_range(start, self.last_index())
    }

    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(RaftError::IndexConflict {
                    expected,
                    actual: entry.index,
                });
            }
            expected += 1;
        }

        self.append_to_disk(&entries)?;
        self.entries.extend(entries);

        Ok(())
    }

    /// Removes every entry with an index greater than `index`.
    pub fn truncate(&mut self, index: u64) -> Result<(), RaftError> {
        if index >= self.last_index() {
            return Ok(());
        }

        if index + 1 < self.start_index {
            return Err(RaftError::OutOfRange {
                index,
                first: self.start_index - 1,
                last: self.last_index(),
            });
        }

        let removed = self.last_index() - index;
        self.entries.truncate((index + 1 - self.start_index) as usize);
        self.save_to_disk()?;

        debug!("Truncated {removed} log entries, last index is now {index}");

        Ok(())
    }

    /// First index of the run of entries sharing the term found at `index`.
    pub fn first_index_of_term(&self, index: u64) -> Result<u64, RaftError> {
        let term = self.get(index)?.term;
        let mut first = index;
        while first > self.start_index && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        Ok(first)
    }

    /// Highest index holding an entry of `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.term >= term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    fn offset(&self, index: u64) -> Result<usize, RaftError> {
        if index < self.start_index || index > self.last_index() {
            return Err(self.out_of_range(index));
        }
        Ok((index - self.start_index) as usize)
    }

    fn out_of_range(&self, index: u64) -> RaftError {
        RaftError::OutOfRange {
            index,
            first: self.start_index,
            last: self.last_index(),
        }
    }

    fn load_from_disk(&mut self) -> Result<(), RaftError> {
        let mut file = File::open(&self.log_file)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut pos = 0;
        while buffer.len() - pos >= FRAME_HEADER_LEN {
            let (len, sum) = read_header(&buffer[pos..pos + FRAME_HEADER_LEN]);

            let body_start = pos + FRAME_HEADER_LEN;
            if buffer.len() - body_start < len {
                break;
            }
            let body = &buffer[body_start..body_start + len];

            let decoded = if checksum(body) == sum {
                bincode::serde::decode_from_slice::<LogEntry, _>(body, bincode::config::standard())
                    .map(|(entry, _)| entry)
                    .map_err(|e| e.to_string())
            } else {
                Err("checksum mismatch".to_string())
            };

            match decoded {
                Ok(entry) => entries.push(entry),
                // A bad frame with nothing valid after it is an unfinished write
                Err(reason) if is_torn_tail(&buffer[pos..], body_start + len == buffer.len()) => {
                    debug!("Log frame at byte {pos} is a torn write: {reason}");
                    break;
                }
                Err(reason) => {
                    return Err(RaftError::Corrupt(format!("log frame at byte {pos}: {reason}")));
                }
            }
            pos = body_start + len;
        }

        if pos < buffer.len() {
            warn!(
                "Discarding {} trailing bytes of a torn write in {}",
                buffer.len() - pos,
                self.log_file.display()
            );
            let file = OpenOptions::new().write(true).open(&self.log_file)?;
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        self.durable_len = pos as u64;

        if let Some(first) = entries.first() {
            if first.index != self.start_index {
                return Err(RaftError::Corrupt(format!(
                    "log starts at index {}, expected {}",
                    first.index, self.start_index
                )));
            }
        }
        if let Some(pair) = entries.windows(2).find(|w| w[1].index != w[0].index + 1) {
            return Err(RaftError::Corrupt(format!(
                "gap in log between index {} and {}",
                pair[0].index, pair[1].index
            )));
        }

        debug!(
            "Loaded {} log entries from {}",
            entries.len(),
            self.log_file.display()
        );
        self.entries = entries;

        Ok(())
    }

    fn save_to_disk(&mut self) -> Result<(), RaftError> {
        let encoded = encode_frames(&self.entries)?;

        let tmp = self.log_file.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.log_file)?;
        self.durable_len = encoded.len() as u64;

        Ok(())
    }

    fn append_to_disk(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        let encoded = encode_frames(entries)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;

        let on_disk = file.metadata()?.len();
        if on_disk > self.durable_len {
            warn!(
                "Cutting {} stray bytes from {} before appending",
                on_disk - self.durable_len,
                self.log_file.display()
            );
            file.set_len(self.durable_len)?;
        }

        let written = file.write_all(&encoded).and_then(|()| file.sync_data());
        if let Err(e) = written {
            // Drop the partial frame so later appends stay aligned. If this fails
            // too, the next append retries the cut.
            if let Err(cut) = file.set_len(self.durable_len) {
                error!(
                    "Failed to cut partial frame from {}: {}",
                    self.log_file.display(),
                    cut
                );
            }
            return Err(e.into());
        }
        self.durable_len += encoded.len() as u64;

        Ok(())
    }
}

fn encode_frames(entries: &[LogEntry]) -> Result<Vec<u8>, RaftError> {
    let mut buf = Vec::new();
    for entry in entries {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&checksum(&bytes).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

fn read_header(header: &[u8]) -> (usize, u32) {
    let mut len = [0u8; 4];
    let mut sum = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    sum.copy_from_slice(&header[4..FRAME_HEADER_LEN]);
    (u32::from_be_bytes(len) as usize, u32::from_be_bytes(sum))
}

/// First four bytes of the body's SHA-256.
fn checksum(body: &[u8]) -> u32 {
    let digest = Sha256::digest(body);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Whether a frame that failed to verify can only be the tail of a write that
/// never finished: it runs to the end of the file, or only zeroes follow.
fn is_torn_tail(rest: &[u8], ends_file: bool) -> bool {
    ends_file || rest.iter().all(|&b| b == 0)
}
