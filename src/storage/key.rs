//! Typed index keys and their wire format.
//!
//! A key is a tuple of typed components. Each component is encoded as
//! `type_tag(1) || length(2 LE) || payload`, and composite keys are the
//! concatenation of their components. Ordering is lexicographic over
//! components with each component compared in its native order.

use std::{cmp::Ordering, fmt, io::Read};

use crate::{
    catalog::Value,
    error::{DbError, ErrorKind},
    utils::{read_exact, ByteWriter, Decodeable, Encodeable},
};

pub const KEY_TYPE_INT: u8 = 1;
pub const KEY_TYPE_STR: u8 = 2;
pub const KEY_TYPE_FLOAT: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Int(i32),
    Str(String),
    Float(f64),
}

impl KeyValue {
    fn type_tag(&self) -> u8 {
        match self {
            KeyValue::Int(_) => KEY_TYPE_INT,
            KeyValue::Str(_) => KEY_TYPE_STR,
            KeyValue::Float(_) => KEY_TYPE_FLOAT,
        }
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => a.total_cmp(b),
            // Components of a well-formed key never mix types; fall back to
            // the tag order so the comparison is still total.
            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Str(v) => write!(f, "{}", v),
            KeyValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(pub Vec<KeyValue>);

impl Key {
    pub fn from_values(values: &[Value]) -> Result<Self, DbError> {
        let mut components = Vec::with_capacity(values.len());
        for v in values {
            let component = match v {
                Value::Int(i) => KeyValue::Int(*i),
                Value::Str(s) => KeyValue::Str(s.clone()),
                Value::Float(f) => KeyValue::Float(*f),
                Value::Null => {
                    return Err(DbError::new(
                        ErrorKind::ConstraintViolation,
                        "indexed columns cannot be NULL",
                    ))
                }
            };
            components.push(component);
        }
        Ok(Key(components))
    }

    /// Decode a key whose component count is given by `key_col_types`. The
    /// on-wire tags are authoritative; the catalog types only tell us how
    /// many components to read.
    pub fn decode_from<R: Read>(reader: &mut R, key_col_types: &[u8]) -> Result<Self, DbError> {
        let mut components = Vec::with_capacity(key_col_types.len());
        for _ in key_col_types {
            let tag = u8::decode_from(reader)?;
            let len = u16::decode_from(reader)? as usize;
            let payload = read_exact(reader, len)?;
            let component = match tag {
                KEY_TYPE_INT => {
                    if len != 4 {
                        return Err(DbError::corruption("int key component must be 4 bytes"));
                    }
                    KeyValue::Int(i32::from_le_bytes(payload.try_into().unwrap()))
                }
                KEY_TYPE_FLOAT => {
                    if len != 8 {
                        return Err(DbError::corruption("float key component must be 8 bytes"));
                    }
                    KeyValue::Float(f64::from_le_bytes(payload.try_into().unwrap()))
                }
                KEY_TYPE_STR => KeyValue::Str(String::from_utf8(payload).map_err(|e| {
                    DbError::corruption(&format!("invalid utf-8 in key component: {}", e))
                })?),
                _ => {
                    return Err(DbError::corruption(&format!(
                        "unknown key component tag: {}",
                        tag
                    )))
                }
            };
            components.push(component);
        }
        Ok(Key(components))
    }

    pub fn encoded_len(&self) -> usize {
        self.0
            .iter()
            .map(|c| {
                3 + match c {
                    KeyValue::Int(_) => 4,
                    KeyValue::Float(_) => 8,
                    KeyValue::Str(s) => s.as_bytes().len(),
                }
            })
            .sum()
    }
}

impl Encodeable for Key {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        for component in &self.0 {
            writer.write(&component.type_tag());
            match component {
                KeyValue::Int(v) => {
                    writer.write(&4u16);
                    writer.write(v);
                }
                KeyValue::Float(v) => {
                    writer.write(&8u16);
                    writer.write(v);
                }
                KeyValue::Str(v) => {
                    writer.write(&(v.as_bytes().len() as u16));
                    writer.write_bytes(v.as_bytes());
                }
            }
        }
        writer.to_bytes()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}
