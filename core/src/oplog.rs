//! # Oplog
//!
//! A write-ahead log with two rotating header slots and a tail of entries.
//!
//! ## Layout
//!
//! ```text
//! [0, page)          header slot 0
//! [page, 2·page)     header slot 1
//! [2·page, EOF)      entry records
//! ```
//!
//! Every record, header or entry, is framed the same way:
//!
//! ```text
//! crc32(LE, 4B) ‖ u32le(payload_len << 1 | generation_bit) ‖ payload
//! ```
//!
//! The CRC covers the length word and the payload.
//!
//! ## Generations
//!
//! Each slot carries one generation bit. Reading both bits gives the active
//! slot, `(bit0 + bit1) & 1`, which is also the bit every current entry is
//! stamped with. A checkpoint rewrites the *inactive* slot with its bit
//! flipped, which makes it the active one in a single page write, then drops
//! the entries. A crash between those two steps leaves entries stamped with
//! the old generation, and recovery discards them.
//!
//! ## Recovery
//!
//! `open` reads the whole file, picks the active header, and replays entries
//! until the first record that fails its checksum, carries the wrong
//! generation, or runs past EOF. Everything after that point is truncated.
//!
//! The oplog has no idea what its entries mean. A caller that checkpoints
//! with `flush` must make sure the new header already reflects every entry
//! it drops; replaying entries on top of a header is the caller's problem.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{OplogConfig, OPLOG_RECORD_HEADER};

/// Largest payload the 31-bit length field can describe.
pub const MAX_RECORD_PAYLOAD: usize = (u32::MAX >> 1) as usize;

#[derive(Debug, Error)]
pub enum OplogError {
    #[error("oplog i/o error: {0}")]
    Io(#[from] io::Error),

    /// Neither header slot decodes but the file is big enough to have had
    /// one.
    #[error("oplog is corrupt: no valid header in {len} bytes")]
    Corrupt { len: u64 },

    #[error("header of {size} bytes does not fit a {max}-byte slot")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("record payload of {len} bytes is too large")]
    RecordTooLarge { len: usize },

    /// Entries were appended before any header was ever written.
    #[error("oplog has no header yet; flush one before appending")]
    NoHeader,

    #[error("oplog encoding error: {0}")]
    Encode(String),
}

impl From<bincode::Error> for OplogError {
    fn from(e: bincode::Error) -> Self {
        OplogError::Encode(e.to_string())
    }
}

pub type OplogResult<T> = Result<T, OplogError>;

/// Random-access storage an [`Oplog`] can live in.
pub trait OplogFile: Read + Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Makes previous writes durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl OplogFile for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl OplogFile for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record framing
// ---------------------------------------------------------------------------

fn encode_record(payload: &[u8], bit: u8) -> OplogResult<Vec<u8>> {
    if payload.len() > MAX_RECORD_PAYLOAD {
        return Err(OplogError::RecordTooLarge { len: payload.len() });
    }
    let word = ((payload.len() as u32) << 1) | (bit as u32 & 1);

    let mut out = Vec::with_capacity(OPLOG_RECORD_HEADER + payload.len());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&word.to_le_bytes());
    out.extend_from_slice(payload);

    let crc = crc32fast::hash(&out[4..]);
    out[..4].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// A record that passed its checksum.
struct Record<'a> {
    bit: u8,
    payload: &'a [u8],
    /// Framing plus payload.
    size: usize,
}

fn decode_record(buf: &[u8]) -> Option<Record<'_>> {
    if buf.len() < OPLOG_RECORD_HEADER {
        return None;
    }
    let crc = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let word = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    let len = (word >> 1) as usize;
    let size = OPLOG_RECORD_HEADER.checked_add(len)?;
    if buf.len() < size {
        return None;
    }
    if crc32fast::hash(&buf[4..size]) != crc {
        return None;
    }
    Some(Record {
        bit: (word & 1) as u8,
        payload: &buf[OPLOG_RECORD_HEADER..size],
        size,
    })
}

fn header_slot(buf: &[u8], slot: usize, page: usize) -> &[u8] {
    let start = (slot * page).min(buf.len());
    let end = ((slot + 1) * page).min(buf.len());
    &buf[start..end]
}

fn decode_header<H: DeserializeOwned>(slot: &[u8]) -> Option<(u8, H)> {
    let record = decode_record(slot)?;
    let header = bincode::deserialize(record.payload).ok()?;
    Some((record.bit, header))
}

// ---------------------------------------------------------------------------
// Oplog
// ---------------------------------------------------------------------------

/// What `open` recovered.
#[derive(Debug)]
pub struct Recovered<H, E> {
    /// The active header, or `None` for a log that never had one.
    pub header: Option<H>,
    /// Entries appended since that header, in order.
    pub entries: Vec<E>,
    /// Bytes dropped from the tail.
    pub truncated: u64,
}

/// A header-plus-entries write-ahead log over an [`OplogFile`].
///
/// No internal locking: the owner serializes calls.
pub struct Oplog<F, H, E> {
    file: F,
    page_size: usize,
    headers: [u8; 2],
    has_header: bool,
    byte_length: u64,
    entry_count: u64,
    _marker: PhantomData<fn() -> (H, E)>,
}

impl<F, H, E> Oplog<F, H, E>
where
    F: OplogFile,
    H: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
{
    /// Recovers an oplog from `file`.
    pub fn open(mut file: F, config: OplogConfig) -> OplogResult<(Self, Recovered<H, E>)> {
        let page = config.page_size;

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        let len = buf.len() as u64;

        let h0 = decode_header::<H>(header_slot(&buf, 0, page));
        let h1 = decode_header::<H>(header_slot(&buf, 1, page));

        let (headers, header) = match (h0, h1) {
            (None, None) => {
                if len >= 2 * page as u64 {
                    return Err(OplogError::Corrupt { len });
                }
                let oplog = Self::fresh(file, page);
                return Ok((
                    oplog,
                    Recovered {
                        header: None,
                        entries: Vec::new(),
                        truncated: 0,
                    },
                ));
            }
            (Some((b, h)), None) => ([b, b], h),
            (None, Some((b, h))) => ([(b + 1) & 1, b], h),
            (Some((b0, h0)), Some((b1, h1))) => {
                let active = (b0 + b1) & 1;
                ([b0, b1], if active == 0 { h0 } else { h1 })
            }
        };

        let bit = (headers[0] + headers[1]) & 1;
        let start = 2 * page;
        let mut pos = start;
        let mut entries = Vec::new();

        while pos < buf.len() {
            let Some(record) = decode_record(&buf[pos..]) else {
                break;
            };
            if record.bit != bit {
                break;
            }
            let Ok(entry) = bincode::deserialize::<E>(record.payload) else {
                break;
            };
            entries.push(entry);
            pos += record.size;
        }

        let valid_end = pos.max(start) as u64;
        let truncated = len.saturating_sub(valid_end);
        if truncated > 0 {
            warn!(
                dropped = truncated,
                kept = entries.len(),
                "oplog tail failed recovery, truncating"
            );
            file.set_len(valid_end)?;
            file.sync()?;
        }

        let oplog = Self {
            file,
            page_size: page,
            headers,
            has_header: true,
            byte_length: valid_end - start as u64,
            entry_count: entries.len() as u64,
            _marker: PhantomData,
        };
        debug!(
            entries = oplog.entry_count,
            bytes = oplog.byte_length,
            "oplog opened"
        );

        Ok((
            oplog,
            Recovered {
                header: Some(header),
                entries,
                truncated,
            },
        ))
    }

    fn fresh(file: F, page_size: usize) -> Self {
        Self {
            file,
            page_size,
            headers: [1, 0],
            has_header: false,
            byte_length: 0,
            entry_count: 0,
            _marker: PhantomData,
        }
    }

    fn entry_offset(&self) -> u64 {
        2 * self.page_size as u64
    }

    /// The generation bit current entries carry.
    fn active_bit(&self) -> u8 {
        (self.headers[0] + self.headers[1]) & 1
    }

    /// Appends one entry at the end of the log and syncs it.
    pub fn append(&mut self, entry: &E) -> OplogResult<()> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Appends several entries with one write and one sync. Each entry is
    /// still its own record: a crash mid-write keeps a prefix.
    pub fn append_batch(&mut self, entries: &[E]) -> OplogResult<()> {
        if !self.has_header {
            return Err(OplogError::NoHeader);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let bit = self.active_bit();
        let mut out = Vec::new();
        for entry in entries {
            out.extend(encode_record(&bincode::serialize(entry)?, bit)?);
        }

        self.file
            .seek(SeekFrom::Start(self.entry_offset() + self.byte_length))?;
        self.file.write_all(&out)?;
        self.file.sync()?;

        self.byte_length += out.len() as u64;
        self.entry_count += entries.len() as u64;
        Ok(())
    }

    /// Checkpoints: writes `header` into the inactive slot, then drops every
    /// entry.
    pub fn flush(&mut self, header: &H) -> OplogResult<()> {
        let payload = bincode::serialize(header)?;
        let max = self.page_size.saturating_sub(OPLOG_RECORD_HEADER);
        if payload.len() > max {
            return Err(OplogError::HeaderTooLarge {
                size: payload.len(),
                max,
            });
        }

        let i = if self.headers[0] == self.headers[1] { 1 } else { 0 };
        let bit = (self.headers[i] + 1) & 1;
        let record = encode_record(&payload, bit)?;

        self.file
            .seek(SeekFrom::Start((i * self.page_size) as u64))?;
        self.file.write_all(&record)?;
        self.file.sync()?;

        self.headers[i] = bit;
        self.has_header = true;

        self.file.set_len(self.entry_offset())?;
        self.file.sync()?;

        debug!(slot = i, dropped = self.entry_count, "oplog checkpoint");
        self.byte_length = 0;
        self.entry_count = 0;
        Ok(())
    }

    /// Bytes of entries since the last checkpoint.
    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Entries since the last checkpoint.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    /// Syncs and gives the file back.
    pub fn close(mut self) -> OplogResult<F> {
        self.file.sync()?;
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Header {
        name: String,
        length: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Append(u64),
        Truncate(u64),
    }

    type TestLog = Oplog<Cursor<Vec<u8>>, Header, Entry>;

    const PAGE: usize = 256;

    fn config() -> OplogConfig {
        OplogConfig { page_size: PAGE }
    }

    fn header(length: u64) -> Header {
        Header {
            name: "log".into(),
            length,
        }
    }

    fn reopen(bytes: Vec<u8>) -> (TestLog, Recovered<Header, Entry>) {
        TestLog::open(Cursor::new(bytes), config()).unwrap()
    }

    fn created() -> TestLog {
        let (mut log, rec) = reopen(Vec::new());
        assert!(rec.header.is_none());
        log.flush(&header(0)).unwrap();
        log
    }

    #[test]
    fn test_fresh_log_has_no_header() {
        let (log, rec) = reopen(Vec::new());
        assert!(rec.header.is_none());
        assert!(rec.entries.is_empty());
        assert!(!log.has_header());
    }

    #[test]
    fn test_append_requires_header() {
        let (mut log, _) = reopen(Vec::new());
        assert!(matches!(
            log.append(&Entry::Append(1)),
            Err(OplogError::NoHeader)
        ));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let mut log = created();
        let entries: Vec<Entry> = (1..=5).map(Entry::Append).collect();
        for e in &entries {
            log.append(e).unwrap();
        }
        let bytes = log.close().unwrap().into_inner();

        let (log, rec) = reopen(bytes);
        assert_eq!(rec.header, Some(header(0)));
        assert_eq!(rec.entries, entries);
        assert_eq!(rec.truncated, 0);
        assert_eq!(log.entry_count(), 5);
    }

    #[test]
    fn test_flush_drops_entries() {
        let mut log = created();
        log.append(&Entry::Append(1)).unwrap();
        log.append(&Entry::Append(2)).unwrap();
        log.flush(&header(2)).unwrap();
        assert_eq!(log.byte_length(), 0);
        let bytes = log.close().unwrap().into_inner();
        assert_eq!(bytes.len(), 2 * PAGE);

        let (_, rec) = reopen(bytes);
        assert_eq!(rec.header, Some(header(2)));
        assert!(rec.entries.is_empty());
    }

    #[test]
    fn test_header_slots_rotate() {
        let mut log = created();
        for n in 1..=5 {
            log.flush(&header(n)).unwrap();
            log.append(&Entry::Append(n)).unwrap();

            let bytes = log.close().unwrap().into_inner();
            let (reopened, rec) = reopen(bytes);
            assert_eq!(rec.header, Some(header(n)));
            assert_eq!(rec.entries, vec![Entry::Append(n)]);
            log = reopened;
        }
    }

    #[test]
    fn test_partial_tail_entry_is_dropped() {
        let mut log = created();
        log.append(&Entry::Append(1)).unwrap();
        log.append(&Entry::Truncate(0)).unwrap();
        log.append(&Entry::Append(7)).unwrap();
        let mut bytes = log.close().unwrap().into_inner();

        let full = bytes.len();
        bytes.truncate(full - 3);
        let (log, rec) = reopen(bytes);
        assert_eq!(rec.entries, vec![Entry::Append(1), Entry::Truncate(0)]);
        assert!(rec.truncated > 0);

        // The torn record is gone from the file too.
        let bytes = log.close().unwrap().into_inner();
        assert!(bytes.len() < full - 3);
        let (_, rec) = reopen(bytes);
        assert_eq!(rec.truncated, 0);
        assert_eq!(rec.entries.len(), 2);
    }

    #[test]
    fn test_flipped_byte_stops_replay() {
        let mut log = created();
        log.append(&Entry::Append(1)).unwrap();
        log.append(&Entry::Append(2)).unwrap();
        let mut bytes = log.close().unwrap().into_inner();

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let (_, rec) = reopen(bytes);
        assert_eq!(rec.entries, vec![Entry::Append(1)]);
    }

    #[test]
    fn test_stale_generation_entries_are_dropped() {
        let mut log = created();
        log.append(&Entry::Append(1)).unwrap();
        let before_flush = log.close().unwrap().into_inner();

        // New header written, crash before the entries were cut.
        let (mut log, _) = reopen(before_flush.clone());
        log.flush(&header(1)).unwrap();
        let mut after = log.close().unwrap().into_inner();
        after.extend_from_slice(&before_flush[2 * PAGE..]);

        let (_, rec) = reopen(after);
        assert_eq!(rec.header, Some(header(1)));
        assert!(rec.entries.is_empty());
    }

    #[test]
    fn test_torn_header_falls_back_to_other_slot() {
        let mut log = created();
        log.flush(&header(1)).unwrap();
        log.append(&Entry::Append(1)).unwrap();
        let bytes = log.close().unwrap().into_inner();

        // header(1) went into slot 1; tear it.
        let mut torn = bytes.clone();
        torn[PAGE + 5] ^= 0xFF;
        let (_, rec) = reopen(torn);
        assert_eq!(rec.header, Some(header(0)));
        // Entries were written under slot 1's generation.
        assert!(rec.entries.is_empty());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let bytes = vec![0xAB; 2 * PAGE + 10];
        assert!(matches!(
            TestLog::open(Cursor::new(bytes), config()),
            Err(OplogError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_short_garbage_is_treated_as_empty() {
        let (log, rec) = reopen(vec![0xAB; PAGE / 2]);
        assert!(rec.header.is_none());
        assert!(!log.has_header());
    }

    #[test]
    fn test_header_too_large() {
        let mut log = created();
        let big = Header {
            name: "x".repeat(PAGE),
            length: 0,
        };
        assert!(matches!(
            log.flush(&big),
            Err(OplogError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_file_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();

        let (mut log, _) = Oplog::<File, Header, Entry>::open(file, config()).unwrap();
        log.flush(&header(0)).unwrap();
        log.append_batch(&[Entry::Append(1), Entry::Append(2)]).unwrap();
        log.close().unwrap();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let (_, rec) = Oplog::<File, Header, Entry>::open(file, config()).unwrap();
        assert_eq!(rec.entries, vec![Entry::Append(1), Entry::Append(2)]);
    }
}
