//! Typed WAL records and their wire format.
//!
//! Each record on disk is framed as `length(4 LE) || payload`. The payload
//! starts with the common header `lsn(8) || prev_lsn(8) || txn_id(4) ||
//! type(1)`, followed by a per-type body. Checkpoint tables and DDL
//! descriptors are JSON sub-payloads.

use std::{
    collections::HashMap,
    io::Read,
};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::{ColumnInfo, TriggerInfo},
    error::DbError,
    transaction::lock_manager::ResourceId,
    types::{DbResult, Lsn, PageId, TransactionId},
    utils::{read_exact, ByteWriter, Decodeable},
};

const TYPE_UPDATE: u8 = 1;
const TYPE_INSERT: u8 = 2;
const TYPE_DELETE: u8 = 3;
const TYPE_COMMIT: u8 = 10;
const TYPE_ABORT: u8 = 11;
const TYPE_CLR: u8 = 12;
const TYPE_BEGIN_CHECKPOINT: u8 = 20;
const TYPE_END_CHECKPOINT: u8 = 21;
const TYPE_CREATE_TABLE: u8 = 30;
const TYPE_DROP_TABLE: u8 = 31;
const TYPE_CREATE_INDEX: u8 = 32;
const TYPE_DROP_INDEX: u8 = 33;
const TYPE_CREATE_VIEW: u8 = 34;
const TYPE_DROP_VIEW: u8 = 35;
const TYPE_ALTER_VIEW: u8 = 36;
const TYPE_CREATE_TRIGGER: u8 = 37;
const TYPE_DROP_TRIGGER: u8 = 38;
const TYPE_ALTER_TRIGGER: u8 = 39;

/// The inverse payload a CLR carries: everything needed to undo the original
/// action without consulting the original record again.
#[derive(Debug, Clone, PartialEq)]
pub enum ClrPayload {
    /// Undo an UPDATE: write the before image back.
    Update { resource: ResourceId, restore: Vec<u8> },
    /// Undo a DELETE: re-insert the deleted bytes at their original slot.
    Delete { resource: ResourceId, restore: Vec<u8> },
    /// Undo an INSERT: tombstone the record of this size.
    Insert { resource: ResourceId, record_size: u32 },
}

impl ClrPayload {
    pub fn resource(&self) -> &ResourceId {
        match self {
            ClrPayload::Update { resource, .. }
            | ClrPayload::Delete { resource, .. }
            | ClrPayload::Insert { resource, .. } => resource,
        }
    }

    fn original_type(&self) -> u8 {
        match self {
            ClrPayload::Update { .. } => TYPE_UPDATE,
            ClrPayload::Delete { .. } => TYPE_DELETE,
            ClrPayload::Insert { .. } => TYPE_INSERT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub cols: Vec<String>,
    pub types: Vec<u8>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecordBody {
    Update {
        resource: ResourceId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Insert {
        resource: ResourceId,
        data: Vec<u8>,
    },
    Delete {
        resource: ResourceId,
        data: Vec<u8>,
    },
    Commit,
    Abort,
    Clr {
        undo_next_lsn: Lsn,
        payload: ClrPayload,
    },
    BeginCheckpoint,
    EndCheckpoint {
        att: HashMap<TransactionId, Lsn>,
        dpt: HashMap<PageId, Lsn>,
    },
    CreateTable {
        table_name: String,
        columns: Vec<ColumnInfo>,
    },
    DropTable {
        table_name: String,
    },
    CreateIndex {
        table_name: String,
        index_name: String,
        columns: Vec<String>,
        key_col_types: Vec<u8>,
        is_unique: bool,
    },
    DropIndex {
        table_name: String,
        index_name: String,
    },
    CreateView {
        view_name: String,
        definition: String,
        is_updatable: bool,
    },
    DropView {
        view_name: String,
    },
    AlterView {
        view_name: String,
        definition: String,
        is_updatable: bool,
    },
    CreateTrigger(TriggerInfo),
    DropTrigger {
        trigger_name: String,
    },
    AlterTrigger(TriggerInfo),
}

impl LogRecordBody {
    /// Resource touched by a data record; None for everything else.
    pub fn data_resource(&self) -> Option<&ResourceId> {
        match self {
            LogRecordBody::Update { resource, .. }
            | LogRecordBody::Insert { resource, .. }
            | LogRecordBody::Delete { resource, .. } => Some(resource),
            LogRecordBody::Clr { payload, .. } => Some(payload.resource()),
            _ => None,
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            LogRecordBody::Update { .. } => TYPE_UPDATE,
            LogRecordBody::Insert { .. } => TYPE_INSERT,
            LogRecordBody::Delete { .. } => TYPE_DELETE,
            LogRecordBody::Commit => TYPE_COMMIT,
            LogRecordBody::Abort => TYPE_ABORT,
            LogRecordBody::Clr { .. } => TYPE_CLR,
            LogRecordBody::BeginCheckpoint => TYPE_BEGIN_CHECKPOINT,
            LogRecordBody::EndCheckpoint { .. } => TYPE_END_CHECKPOINT,
            LogRecordBody::CreateTable { .. } => TYPE_CREATE_TABLE,
            LogRecordBody::DropTable { .. } => TYPE_DROP_TABLE,
            LogRecordBody::CreateIndex { .. } => TYPE_CREATE_INDEX,
            LogRecordBody::DropIndex { .. } => TYPE_DROP_INDEX,
            LogRecordBody::CreateView { .. } => TYPE_CREATE_VIEW,
            LogRecordBody::DropView { .. } => TYPE_DROP_VIEW,
            LogRecordBody::AlterView { .. } => TYPE_ALTER_VIEW,
            LogRecordBody::CreateTrigger(_) => TYPE_CREATE_TRIGGER,
            LogRecordBody::DropTrigger { .. } => TYPE_DROP_TRIGGER,
            LogRecordBody::AlterTrigger(_) => TYPE_ALTER_TRIGGER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TransactionId,
    pub body: LogRecordBody,
}

fn write_name(writer: &mut ByteWriter, name: &str) {
    writer.write(&(name.as_bytes().len() as u16));
    writer.write_bytes(name.as_bytes());
}

fn read_name<R: Read>(reader: &mut R) -> Result<String, DbError> {
    let len = u16::decode_from(reader)? as usize;
    let bytes = read_exact(reader, len)?;
    String::from_utf8(bytes).map_err(|e| DbError::corruption(&format!("bad name in log: {}", e)))
}

fn write_json<T: Serialize>(writer: &mut ByteWriter, value: &T) -> DbResult {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| DbError::internal(&format!("log json encode failed: {}", e)))?;
    writer.write(&(bytes.len() as u32));
    writer.write_bytes(&bytes);
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>, R: Read>(reader: &mut R) -> Result<T, DbError> {
    let len = u32::decode_from(reader)? as usize;
    let bytes = read_exact(reader, len)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DbError::corruption(&format!("log json decode failed: {}", e)))
}

fn write_resource(writer: &mut ByteWriter, resource: &ResourceId) {
    write_name(writer, &resource.table_name);
    writer.write(&resource.page_id.unwrap_or(0));
    writer.write(&resource.record_id.unwrap_or(0));
}

fn read_resource<R: Read>(reader: &mut R) -> Result<ResourceId, DbError> {
    let table_name = read_name(reader)?;
    let page_id = u32::decode_from(reader)?;
    let record_id = u32::decode_from(reader)?;
    Ok(ResourceId::record(&table_name, page_id, record_id))
}

fn write_image(writer: &mut ByteWriter, image: &[u8]) {
    writer.write(&(image.len() as u16));
    writer.write_bytes(image);
}

fn read_image<R: Read>(reader: &mut R) -> Result<Vec<u8>, DbError> {
    let len = u16::decode_from(reader)? as usize;
    read_exact(reader, len)
}

impl LogRecord {
    /// Serialize with the 4-byte length frame.
    pub fn to_bytes_with_prefix(&self) -> Result<Vec<u8>, DbError> {
        let payload = self.to_bytes()?;
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DbError> {
        let mut writer = ByteWriter::new();
        writer.write(&self.lsn);
        writer.write(&self.prev_lsn);
        writer.write(&self.txn_id);
        writer.write(&self.body.type_code());

        match &self.body {
            LogRecordBody::Update {
                resource,
                before,
                after,
            } => {
                write_name(&mut writer, &resource.table_name);
                writer.write(&resource.page_id.unwrap_or(0));
                writer.write(&resource.record_id.unwrap_or(0));
                writer.write(&(before.len() as u16));
                writer.write(&(after.len() as u16));
                writer.write_bytes(before);
                writer.write_bytes(after);
            }
            LogRecordBody::Insert { resource, data } | LogRecordBody::Delete { resource, data } => {
                write_name(&mut writer, &resource.table_name);
                writer.write(&resource.page_id.unwrap_or(0));
                writer.write(&resource.record_id.unwrap_or(0));
                write_image(&mut writer, data);
            }
            LogRecordBody::Commit
            | LogRecordBody::Abort
            | LogRecordBody::BeginCheckpoint => {}
            LogRecordBody::Clr {
                undo_next_lsn,
                payload,
            } => {
                writer.write(undo_next_lsn);
                writer.write(&payload.original_type());
                write_resource(&mut writer, payload.resource());
                match payload {
                    ClrPayload::Update { restore, .. } | ClrPayload::Delete { restore, .. } => {
                        write_image(&mut writer, restore)
                    }
                    ClrPayload::Insert { record_size, .. } => writer.write(record_size),
                }
            }
            LogRecordBody::EndCheckpoint { att, dpt } => {
                #[derive(Serialize)]
                struct Tables<'a> {
                    att: &'a HashMap<TransactionId, Lsn>,
                    dpt: &'a HashMap<PageId, Lsn>,
                }
                write_json(&mut writer, &Tables { att, dpt })?;
            }
            LogRecordBody::CreateTable {
                table_name,
                columns,
            } => {
                write_name(&mut writer, table_name);
                write_json(&mut writer, columns)?;
            }
            LogRecordBody::DropTable { table_name } => write_name(&mut writer, table_name),
            LogRecordBody::CreateIndex {
                table_name,
                index_name,
                columns,
                key_col_types,
                is_unique,
            } => {
                write_name(&mut writer, table_name);
                write_name(&mut writer, index_name);
                write_json(
                    &mut writer,
                    &IndexDescriptor {
                        cols: columns.clone(),
                        types: key_col_types.clone(),
                        unique: *is_unique,
                    },
                )?;
            }
            LogRecordBody::DropIndex {
                table_name,
                index_name,
            } => {
                write_name(&mut writer, table_name);
                write_name(&mut writer, index_name);
            }
            LogRecordBody::CreateView {
                view_name,
                definition,
                is_updatable,
            }
            | LogRecordBody::AlterView {
                view_name,
                definition,
                is_updatable,
            } => {
                write_name(&mut writer, view_name);
                writer.write(&(definition.as_bytes().len() as u32));
                writer.write(&(*is_updatable as u8));
                writer.write_bytes(definition.as_bytes());
            }
            LogRecordBody::DropView { view_name } => write_name(&mut writer, view_name),
            LogRecordBody::CreateTrigger(info) | LogRecordBody::AlterTrigger(info) => {
                write_name(&mut writer, &info.trigger_name);
                write_name(&mut writer, &info.table_name);
                write_name(&mut writer, &info.timing);
                write_json(&mut writer, &info.events)?;
                writer.write(&(info.is_row_level as u8));
                write_name(&mut writer, info.when_condition.as_deref().unwrap_or(""));
                write_json(&mut writer, &info.trigger_body)?;
            }
            LogRecordBody::DropTrigger { trigger_name } => write_name(&mut writer, trigger_name),
        }
        Ok(writer.to_bytes())
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, DbError> {
        let mut reader = std::io::Cursor::new(payload);
        let lsn = u64::decode_from(&mut reader)?;
        let prev_lsn = u64::decode_from(&mut reader)?;
        let txn_id = u32::decode_from(&mut reader)?;
        let type_code = u8::decode_from(&mut reader)?;

        let body = match type_code {
            TYPE_UPDATE => {
                let table_name = read_name(&mut reader)?;
                let page_id = u32::decode_from(&mut reader)?;
                let record_id = u32::decode_from(&mut reader)?;
                let before_len = u16::decode_from(&mut reader)? as usize;
                let after_len = u16::decode_from(&mut reader)? as usize;
                let before = read_exact(&mut reader, before_len)?;
                let after = read_exact(&mut reader, after_len)?;
                LogRecordBody::Update {
                    resource: ResourceId::record(&table_name, page_id, record_id),
                    before,
                    after,
                }
            }
            TYPE_INSERT | TYPE_DELETE => {
                let table_name = read_name(&mut reader)?;
                let page_id = u32::decode_from(&mut reader)?;
                let record_id = u32::decode_from(&mut reader)?;
                let data = read_image(&mut reader)?;
                let resource = ResourceId::record(&table_name, page_id, record_id);
                if type_code == TYPE_INSERT {
                    LogRecordBody::Insert { resource, data }
                } else {
                    LogRecordBody::Delete { resource, data }
                }
            }
            TYPE_COMMIT => LogRecordBody::Commit,
            TYPE_ABORT => LogRecordBody::Abort,
            TYPE_CLR => {
                let undo_next_lsn = u64::decode_from(&mut reader)?;
                let original_type = u8::decode_from(&mut reader)?;
                let resource = read_resource(&mut reader)?;
                let payload = match original_type {
                    TYPE_UPDATE => ClrPayload::Update {
                        resource,
                        restore: read_image(&mut reader)?,
                    },
                    TYPE_DELETE => ClrPayload::Delete {
                        resource,
                        restore: read_image(&mut reader)?,
                    },
                    TYPE_INSERT => ClrPayload::Insert {
                        resource,
                        record_size: u32::decode_from(&mut reader)?,
                    },
                    other => {
                        return Err(DbError::corruption(&format!(
                            "CLR cannot compensate record type {}",
                            other
                        )))
                    }
                };
                LogRecordBody::Clr {
                    undo_next_lsn,
                    payload,
                }
            }
            TYPE_BEGIN_CHECKPOINT => LogRecordBody::BeginCheckpoint,
            TYPE_END_CHECKPOINT => {
                #[derive(Deserialize)]
                struct Tables {
                    att: HashMap<TransactionId, Lsn>,
                    dpt: HashMap<PageId, Lsn>,
                }
                let tables: Tables = read_json(&mut reader)?;
                LogRecordBody::EndCheckpoint {
                    att: tables.att,
                    dpt: tables.dpt,
                }
            }
            TYPE_CREATE_TABLE => LogRecordBody::CreateTable {
                table_name: read_name(&mut reader)?,
                columns: read_json(&mut reader)?,
            },
            TYPE_DROP_TABLE => LogRecordBody::DropTable {
                table_name: read_name(&mut reader)?,
            },
            TYPE_CREATE_INDEX => {
                let table_name = read_name(&mut reader)?;
                let index_name = read_name(&mut reader)?;
                let descriptor: IndexDescriptor = read_json(&mut reader)?;
                LogRecordBody::CreateIndex {
                    table_name,
                    index_name,
                    columns: descriptor.cols,
                    key_col_types: descriptor.types,
                    is_unique: descriptor.unique,
                }
            }
            TYPE_DROP_INDEX => LogRecordBody::DropIndex {
                table_name: read_name(&mut reader)?,
                index_name: read_name(&mut reader)?,
            },
            TYPE_CREATE_VIEW | TYPE_ALTER_VIEW => {
                let view_name = read_name(&mut reader)?;
                let def_len = u32::decode_from(&mut reader)? as usize;
                let is_updatable = u8::decode_from(&mut reader)? == 1;
                let definition = String::from_utf8(read_exact(&mut reader, def_len)?)
                    .map_err(|e| DbError::corruption(&format!("bad view definition: {}", e)))?;
                if type_code == TYPE_CREATE_VIEW {
                    LogRecordBody::CreateView {
                        view_name,
                        definition,
                        is_updatable,
                    }
                } else {
                    LogRecordBody::AlterView {
                        view_name,
                        definition,
                        is_updatable,
                    }
                }
            }
            TYPE_DROP_VIEW => LogRecordBody::DropView {
                view_name: read_name(&mut reader)?,
            },
            TYPE_CREATE_TRIGGER | TYPE_ALTER_TRIGGER => {
                let trigger_name = read_name(&mut reader)?;
                let table_name = read_name(&mut reader)?;
                let timing = read_name(&mut reader)?;
                let events: Vec<String> = read_json(&mut reader)?;
                let is_row_level = u8::decode_from(&mut reader)? == 1;
                let when = read_name(&mut reader)?;
                let trigger_body: Vec<String> = read_json(&mut reader)?;
                let info = TriggerInfo {
                    trigger_name,
                    table_name,
                    timing,
                    events,
                    is_row_level,
                    when_condition: if when.is_empty() { None } else { Some(when) },
                    trigger_body,
                };
                if type_code == TYPE_CREATE_TRIGGER {
                    LogRecordBody::CreateTrigger(info)
                } else {
                    LogRecordBody::AlterTrigger(info)
                }
            }
            TYPE_DROP_TRIGGER => LogRecordBody::DropTrigger {
                trigger_name: read_name(&mut reader)?,
            },
            other => {
                return Err(DbError::corruption(&format!(
                    "unknown log record type: {}",
                    other
                )))
            }
        };

        Ok(LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::DataType;

    use super::*;

    fn round_trip(record: LogRecord) {
        let bytes = record.to_bytes().unwrap();
        let decoded = LogRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_data_records_round_trip() {
        let resource = ResourceId::record("users", 1, 0);
        round_trip(LogRecord {
            lsn: 7,
            prev_lsn: 3,
            txn_id: 2,
            body: LogRecordBody::Insert {
                resource: resource.clone(),
                data: vec![1, 2, 3, 4],
            },
        });
        round_trip(LogRecord {
            lsn: 8,
            prev_lsn: 7,
            txn_id: 2,
            body: LogRecordBody::Update {
                resource: resource.clone(),
                before: vec![1, 2],
                after: vec![3, 4],
            },
        });
        round_trip(LogRecord {
            lsn: 9,
            prev_lsn: 8,
            txn_id: 2,
            body: LogRecordBody::Delete {
                resource,
                data: vec![9, 9],
            },
        });
    }

    #[test]
    fn test_clr_round_trip() {
        let resource = ResourceId::record("users", 2, 5);
        round_trip(LogRecord {
            lsn: 12,
            prev_lsn: 11,
            txn_id: 4,
            body: LogRecordBody::Clr {
                undo_next_lsn: 10,
                payload: ClrPayload::Insert {
                    resource: resource.clone(),
                    record_size: 24,
                },
            },
        });
        round_trip(LogRecord {
            lsn: 13,
            prev_lsn: 12,
            txn_id: 4,
            body: LogRecordBody::Clr {
                undo_next_lsn: 0,
                payload: ClrPayload::Update {
                    resource,
                    restore: vec![5, 6, 7],
                },
            },
        });
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut att = HashMap::new();
        att.insert(3u32, 17u64);
        let mut dpt = HashMap::new();
        dpt.insert(1u32, 9u64);
        round_trip(LogRecord {
            lsn: 20,
            prev_lsn: 0,
            txn_id: crate::types::SYSTEM_TXN_ID,
            body: LogRecordBody::EndCheckpoint { att, dpt },
        });
    }

    #[test]
    fn test_ddl_round_trip() {
        round_trip(LogRecord {
            lsn: 1,
            prev_lsn: 0,
            txn_id: 1,
            body: LogRecordBody::CreateTable {
                table_name: "users".to_string(),
                columns: vec![
                    ColumnInfo::new("name", DataType::Str(20)).primary_key(),
                    ColumnInfo::new("age", DataType::Int),
                ],
            },
        });
        round_trip(LogRecord {
            lsn: 2,
            prev_lsn: 1,
            txn_id: 1,
            body: LogRecordBody::CreateIndex {
                table_name: "users".to_string(),
                index_name: "idx_name".to_string(),
                columns: vec!["name".to_string()],
                key_col_types: vec![crate::storage::key::KEY_TYPE_STR],
                is_unique: true,
            },
        });
        round_trip(LogRecord {
            lsn: 3,
            prev_lsn: 2,
            txn_id: 1,
            body: LogRecordBody::CreateTrigger(TriggerInfo {
                trigger_name: "audit_users".to_string(),
                table_name: "users".to_string(),
                timing: "AFTER".to_string(),
                events: vec!["INSERT".to_string()],
                is_row_level: true,
                when_condition: None,
                trigger_body: vec!["INSERT INTO audit VALUES (1)".to_string()],
            }),
        });
    }
}
