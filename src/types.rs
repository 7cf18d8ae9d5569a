use std::{
    fmt,
    io::Read,
    sync::{Arc, RwLock},
};

use crate::{
    error::DbError,
    utils::{Decodeable, Encodeable},
};

// Type alias, not a new type, so the underlying RwLock api stays usable.
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, DbError>;
pub type DbResult = Result<(), DbError>;

pub type PageId = u32;
pub type RecordId = u32;
pub type TransactionId = u32;
pub type Lsn = u64;

pub const NULL_LSN: Lsn = 0;

/// Transaction id carried by system records (checkpoints); -1 when viewed as
/// a signed integer.
pub const SYSTEM_TXN_ID: TransactionId = u32::MAX;

/// Stable identifier of a record: the page it lives on and its slot. Neither
/// in-place update nor rollback changes a row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    pub page_id: PageId,
    pub record_id: RecordId,
}

impl RowId {
    pub fn new(page_id: PageId, record_id: RecordId) -> Self {
        Self { page_id, record_id }
    }
}

impl Encodeable for RowId {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.page_id.to_le_bytes());
        buf.extend_from_slice(&self.record_id.to_le_bytes());
        buf
    }
}

impl Decodeable for RowId {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DbError> {
        let page_id = u32::decode_from(reader)?;
        let record_id = u32::decode_from(reader)?;
        Ok(Self { page_id, record_id })
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.record_id)
    }
}
