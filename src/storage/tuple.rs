//! Fixed-width row codec.
//!
//! Every table stores records of a fixed size derived from its schema:
//! integers as 4-byte LE, strings zero-padded to the declared length,
//! decimals and floats as zero-padded UTF-8 text, dates and timestamps as
//! 20-byte text. An all-zero text field decodes as NULL.

use crate::{
    catalog::{ColumnInfo, DataType, Value},
    error::{DbError, ErrorKind},
};
use crate::types::DbResult;

pub struct RowCodec {
    schema: Vec<ColumnInfo>,
    record_size: usize,
}

impl RowCodec {
    pub fn new(schema: &[ColumnInfo]) -> Self {
        let record_size = schema.iter().map(|c| c.data_type.byte_width()).sum();
        Self {
            schema: schema.to_vec(),
            record_size,
        }
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn serialize(&self, row: &[Value]) -> Result<Vec<u8>, DbError> {
        if row.len() != self.schema.len() {
            return Err(DbError::new(
                ErrorKind::ConstraintViolation,
                &format!(
                    "row has {} values, schema has {} columns",
                    row.len(),
                    self.schema.len()
                ),
            ));
        }

        let mut buf = Vec::with_capacity(self.record_size);
        for (value, column) in row.iter().zip(self.schema.iter()) {
            let width = column.data_type.byte_width();
            match (&column.data_type, value) {
                (DataType::Int, Value::Int(v)) => buf.extend_from_slice(&v.to_le_bytes()),
                (DataType::Int, Value::Null) => {
                    return Err(DbError::new(
                        ErrorKind::ConstraintViolation,
                        &format!("INT column {} cannot be NULL", column.column_name),
                    ))
                }
                (DataType::Str(_), Value::Str(s)) => {
                    Self::write_padded_text(&mut buf, s, width, &column.column_name)?
                }
                (DataType::Decimal(_, _), Value::Float(v))
                | (DataType::Float, Value::Float(v)) => {
                    Self::write_padded_text(&mut buf, &v.to_string(), width, &column.column_name)?
                }
                (DataType::Decimal(_, _), Value::Int(v)) | (DataType::Float, Value::Int(v)) => {
                    // integer literals flow into numeric columns freely
                    Self::write_padded_text(
                        &mut buf,
                        &(*v as f64).to_string(),
                        width,
                        &column.column_name,
                    )?
                }
                (DataType::Date, Value::Str(s)) | (DataType::Timestamp, Value::Str(s)) => {
                    Self::write_padded_text(&mut buf, s, width, &column.column_name)?
                }
                (_, Value::Null) => buf.extend_from_slice(&vec![0u8; width]),
                (dt, v) => {
                    return Err(DbError::new(
                        ErrorKind::ConstraintViolation,
                        &format!(
                            "value {} does not fit column {} of type {:?}",
                            v, column.column_name, dt
                        ),
                    ))
                }
            }
        }
        Ok(buf)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Vec<Value>, DbError> {
        if bytes.len() != self.record_size {
            return Err(DbError::corruption(&format!(
                "record is {} bytes, schema expects {}",
                bytes.len(),
                self.record_size
            )));
        }

        let mut row = Vec::with_capacity(self.schema.len());
        let mut offset = 0;
        for column in &self.schema {
            let width = column.data_type.byte_width();
            let field = &bytes[offset..offset + width];
            offset += width;

            let value = match column.data_type {
                DataType::Int => Value::Int(i32::from_le_bytes(field.try_into().unwrap())),
                DataType::Str(_) | DataType::Date | DataType::Timestamp => {
                    match Self::read_padded_text(field)? {
                        None => Value::Null,
                        Some(s) => Value::Str(s),
                    }
                }
                DataType::Decimal(_, _) | DataType::Float => {
                    match Self::read_padded_text(field)? {
                        None => Value::Null,
                        Some(s) => Value::Float(s.parse::<f64>().map_err(|e| {
                            DbError::corruption(&format!(
                                "column {} holds non-numeric text {:?}: {}",
                                column.column_name, s, e
                            ))
                        })?),
                    }
                }
            };
            row.push(value);
        }
        Ok(row)
    }

    /// Project the index key columns out of a row, in index column order.
    pub fn project_key(&self, row: &[Value], column_names: &[String]) -> Result<Vec<Value>, DbError> {
        let mut projected = Vec::with_capacity(column_names.len());
        for name in column_names {
            let idx = self
                .schema
                .iter()
                .position(|c| &c.column_name == name)
                .ok_or_else(|| DbError::not_found(&format!("column {} not found", name)))?;
            projected.push(row[idx].clone());
        }
        Ok(projected)
    }

    fn write_padded_text(
        buf: &mut Vec<u8>,
        text: &str,
        width: usize,
        column: &str,
    ) -> DbResult {
        let payload = text.as_bytes();
        if payload.len() > width {
            return Err(DbError::new(
                ErrorKind::ConstraintViolation,
                &format!(
                    "value of {} bytes exceeds the {}-byte width of column {}",
                    payload.len(),
                    width,
                    column
                ),
            ));
        }
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&vec![0u8; width - payload.len()]);
        Ok(())
    }

    fn read_padded_text(field: &[u8]) -> Result<Option<String>, DbError> {
        let end = field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(field.len());
        if end == 0 {
            return Ok(None);
        }
        let s = std::str::from_utf8(&field[..end])
            .map_err(|e| DbError::corruption(&format!("invalid utf-8 in record: {}", e)))?;
        Ok(Some(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> RowCodec {
        RowCodec::new(&[
            ColumnInfo::new("name", DataType::Str(20)),
            ColumnInfo::new("age", DataType::Int),
            ColumnInfo::new("score", DataType::Decimal(6, 2)),
        ])
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let row = vec![
            Value::Str("alice".to_string()),
            Value::Int(25),
            Value::Float(93.5),
        ];
        let bytes = codec.serialize(&row).unwrap();
        assert_eq!(bytes.len(), codec.record_size());
        assert_eq!(codec.deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_null_text_round_trip() {
        let codec = codec();
        let row = vec![Value::Null, Value::Int(1), Value::Null];
        let bytes = codec.serialize(&row).unwrap();
        assert_eq!(codec.deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_null_int_rejected() {
        let codec = codec();
        let row = vec![Value::Str("x".to_string()), Value::Null, Value::Null];
        let err = codec.serialize(&row).unwrap_err();
        assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let codec = codec();
        let row = vec![
            Value::Str("this string is far longer than twenty bytes".to_string()),
            Value::Int(1),
            Value::Null,
        ];
        let err = codec.serialize(&row).unwrap_err();
        assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
    }
}
