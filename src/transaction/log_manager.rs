//! Append-only write-ahead log.
//!
//! Records accumulate in an in-memory buffer; `flush_to_lsn` writes the
//! buffer out and fsyncs. Because the whole buffer is written, `flushed_lsn`
//! advances to the highest LSN that actually reached the file, never just
//! the requested one. Commit durability is `append(COMMIT)` followed by
//! `flush_to_lsn(commit_lsn)`.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{
    error::DbError,
    transaction::{
        log_record::{LogRecord, LogRecordBody},
        transaction::Transaction,
    },
    types::{DbResult, Lsn, TransactionId, NULL_LSN},
    utils::DbFile,
};

pub struct LogManager {
    path: PathBuf,
    file: DbFile,
    buffer: Vec<u8>,
    next_lsn: Lsn,
    /// Highest LSN sitting in the in-memory buffer.
    buffer_end_lsn: Lsn,
    flushed_lsn: Lsn,
}

impl LogManager {
    /// Open (or create) the log, scanning existing records to seed the LSN
    /// counter. A torn record at the tail (crash mid-write) is truncated
    /// away so later appends stay readable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let file = DbFile::open(&path)?;

        let mut last_lsn = NULL_LSN;
        let mut reader = LogReader::open(&path)?;
        while let Some((_, record)) = reader.next_record()? {
            if record.lsn > last_lsn {
                last_lsn = record.lsn;
            }
        }
        let valid_end = reader.position();
        if valid_end < file.get_size()? {
            warn!(
                "log {:?} has a torn tail; truncating to {} bytes",
                path, valid_end
            );
            file.set_len(valid_end)?;
        }
        debug!("log opened at {:?}, last lsn {}", path, last_lsn);

        Ok(Self {
            path,
            file,
            buffer: Vec::new(),
            next_lsn: last_lsn + 1,
            buffer_end_lsn: last_lsn,
            flushed_lsn: last_lsn,
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    pub fn get_next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Append a record on behalf of a transaction, chaining `prev_lsn`
    /// through the transaction's `last_lsn`.
    pub fn append(&mut self, tx: &Transaction, body: LogRecordBody) -> Result<Lsn, DbError> {
        let prev_lsn = tx.get_last_lsn();
        let lsn = self.append_with_prev(tx.get_id(), prev_lsn, body)?;
        tx.set_last_lsn(lsn);
        Ok(lsn)
    }

    /// Append with an explicit chain pointer. Recovery uses this to keep
    /// undo chains intact for transactions that no longer have a live
    /// `Transaction` object.
    pub fn append_with_prev(
        &mut self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        body: LogRecordBody,
    ) -> Result<Lsn, DbError> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        let record = LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            body,
        };
        self.buffer.extend_from_slice(&record.to_bytes_with_prefix()?);
        self.buffer_end_lsn = lsn;
        debug!("appended lsn {} (txn {})", lsn, txn_id as i64);
        Ok(lsn)
    }

    /// Make every record with `lsn <= target` durable. The whole buffer is
    /// written, so `flushed_lsn` lands on the buffer's last LSN.
    pub fn flush_to_lsn(&mut self, target: Lsn) -> DbResult {
        if target <= self.flushed_lsn || self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.buffer);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_bytes(&bytes)?;
        self.file.sync()?;
        self.flushed_lsn = self.buffer_end_lsn;
        Ok(())
    }

    /// Flush everything appended so far.
    pub fn flush_all(&mut self) -> DbResult {
        let end = self.buffer_end_lsn;
        self.flush_to_lsn(end)
    }

    /// Sequential scan for a record by LSN. Only durable records are
    /// visible; callers flush first.
    pub fn read_record_by_lsn(&self, lsn: Lsn) -> Result<Option<LogRecord>, DbError> {
        let mut reader = LogReader::open(&self.path)?;
        while let Some((_, record)) = reader.next_record()? {
            if record.lsn == lsn {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Human-readable dump of the on-disk log, for debugging.
    pub fn dump(&self) -> Result<String, DbError> {
        let mut out = String::new();
        let mut reader = LogReader::open(&self.path)?;
        while let Some((offset, record)) = reader.next_record()? {
            let detail = match &record.body {
                LogRecordBody::Insert { resource, data } => {
                    format!("INSERT {} [{}]", resource, hex::encode(&data[..data.len().min(16)]))
                }
                LogRecordBody::Delete { resource, data } => {
                    format!("DELETE {} [{}]", resource, hex::encode(&data[..data.len().min(16)]))
                }
                LogRecordBody::Update { resource, before, after } => format!(
                    "UPDATE {} [{} -> {}]",
                    resource,
                    hex::encode(&before[..before.len().min(16)]),
                    hex::encode(&after[..after.len().min(16)])
                ),
                other => format!("{:?}", other),
            };
            out.push_str(&format!(
                "├── [pos {}] lsn {} prev {} txn {} {}\n",
                offset, record.lsn, record.prev_lsn, record.txn_id as i64, detail
            ));
        }
        Ok(out)
    }
}

/// Forward reader over the framed record stream. Stops cleanly at a torn
/// tail (an incomplete record after a crash).
pub struct LogReader {
    file: DbFile,
    size: u64,
    offset: u64,
}

impl LogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let file = DbFile::open(path)?;
        let size = file.get_size()?;
        Ok(Self {
            file,
            size,
            offset: 0,
        })
    }

    /// The next `(offset, record)` pair, or None at end of stream.
    pub fn next_record(&mut self) -> Result<Option<(u64, LogRecord)>, DbError> {
        if self.offset + 4 > self.size {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.offset))?;
        let len = self.file.read::<u32>()? as u64;
        if self.offset + 4 + len > self.size {
            // torn tail from a crash mid-write; recovery ignores it
            return Ok(None);
        }
        let payload = self.file.read_bytes(len as usize)?;
        let record = LogRecord::from_bytes(&payload)?;
        let record_offset = self.offset;
        self.offset += 4 + len;
        Ok(Some((record_offset, record)))
    }

    /// Byte offset just past the last complete record read.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Read the single record at a known offset.
    pub fn read_at(&mut self, offset: u64) -> Result<LogRecord, DbError> {
        self.file.seek(SeekFrom::Start(offset))?;
        let len = self.file.read::<u32>()? as usize;
        let payload = self.file.read_bytes(len)?;
        LogRecord::from_bytes(&payload)
    }
}
