use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use crate::error::{DbError, ErrorKind};
use crate::types::DbResult;

/// Thin wrapper around a read/write file handle with typed helpers. Every
/// persistent file in the engine (tablespaces, the log) goes through this.
pub struct DbFile {
    file: File,
}

impl DbFile {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(&file_path)
            .map_err(|e| {
                DbError::io(&format!(
                    "open {:?} failed: {}",
                    file_path.as_ref(),
                    e
                ))
            })?;

        Ok(Self { file })
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) -> DbResult {
        self.write_bytes(&obj.encode())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> DbResult {
        self.file
            .write_all(bytes)
            .map_err(|e| DbError::io(&e.to_string()))
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, DbError> {
        T::decode_from(&mut self.file)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DbError> {
        read_exact(&mut self.file, count)
    }

    pub fn get_size(&self) -> Result<u64, DbError> {
        let metadata = self.file.metadata().map_err(|e| DbError::io(&e.to_string()))?;
        Ok(metadata.len())
    }

    pub fn set_len(&self, len: u64) -> DbResult {
        self.file
            .set_len(len)
            .map_err(|e| DbError::io(&e.to_string()))
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, DbError> {
        self.file.seek(pos).map_err(|e| DbError::io(&e.to_string()))
    }

    /// Flush buffered bytes and force them to stable storage.
    pub fn sync(&mut self) -> DbResult {
        self.file.flush().map_err(|e| DbError::io(&e.to_string()))?;
        self.file
            .sync_data()
            .map_err(|e| DbError::io(&e.to_string()))
    }
}

pub fn read_exact<R: Read>(reader: &mut R, count: usize) -> Result<Vec<u8>, DbError> {
    let mut buffer = vec![0u8; count];
    reader.read_exact(&mut buffer).map_err(|e| {
        DbError::new(
            ErrorKind::Corruption,
            &format!("expected {} bytes: {}", count, e),
        )
    })?;
    Ok(buffer)
}

/// Append-only byte buffer used to assemble page images and log records.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DbError>;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DbError> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

/// # Format
///
/// - 2 bytes: byte length (LE)
/// - n bytes: UTF-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let payload = self.as_bytes();
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DbError> {
        let size = u16::decode_from(reader)?;
        let bytes = read_exact(reader, size as usize)?;
        String::from_utf8(bytes)
            .map_err(|e| DbError::corruption(&format!("invalid utf-8 string: {}", e)))
    }
}

macro_rules! impl_codec {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DbError> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_codec!(for u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);
