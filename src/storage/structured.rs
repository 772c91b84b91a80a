//! Structured file I/O for the binary index formats.
//!
//! Every index file is framed the same way:
//!
//! ```text
//! magic: u32 | version: u32 | body ... | crc32(all preceding bytes): u32
//! ```
//!
//! [`StructWriter`] accumulates the checksum while writing and appends it on
//! [`StructWriter::close`]. [`StructReader::open`] loads a file, verifies the
//! footer before any byte is interpreted, and [`StructReader::check_header`]
//! rejects foreign or out-of-range format versions with a distinguishable
//! error naming the file.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{HalberdError, Result};
use crate::storage::{Storage, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Write the magic number and format version.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.update_checksum(&[value]);
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writer.write_i64::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.update_checksum(&encoded);
        Ok(())
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.writer.write_all(value)?;
        self.update_checksum(value);
        Ok(())
    }

    /// Write a strictly increasing integer array using delta encoding.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            let delta = value.wrapping_sub(previous);
            self.write_varint(delta as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Write a string-to-string map in key order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;

        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn update_checksum(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Append the checksum footer and close the output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: Read> {
    reader: R,
    name: String,
    position: u64,
}

impl StructReader<Cursor<Vec<u8>>> {
    /// Load `name`, verify its checksum footer and position after the footer check.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut data = storage.read_all(name)?;
        if data.len() < 12 {
            return Err(HalberdError::corruption(
                name,
                format!("file too short ({} bytes)", data.len()),
            ));
        }

        let body_len = data.len() - 4;
        let mut footer = &data[body_len..];
        let stored = footer.read_u32::<LittleEndian>()?;
        let actual = crc32fast::hash(&data[..body_len]);
        if stored != actual {
            return Err(HalberdError::corruption(
                name,
                format!("checksum mismatch (expected {stored:08x}, actual {actual:08x})"),
            ));
        }

        data.truncate(body_len);
        Ok(StructReader {
            reader: Cursor::new(data),
            name: name.to_string(),
            position: 0,
        })
    }
}

impl<R: Read> StructReader<R> {
    /// Wrap an unverified reader.
    pub fn new(reader: R, name: &str) -> Self {
        StructReader {
            reader,
            name: name.to_string(),
            position: 0,
        }
    }

    /// Name of the file being read.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check magic and version; returns the version found.
    pub fn check_header(&mut self, magic: u32, min_version: u32, max_version: u32) -> Result<u32> {
        let found_magic = self.read_u32()?;
        if found_magic != magic {
            return Err(HalberdError::unsupported_format(
                self.name.clone(),
                format!("bad magic {found_magic:08x}, expected {magic:08x}"),
            ));
        }

        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(HalberdError::unsupported_format(
                self.name.clone(),
                format!("format version {version} outside supported range {min_version}..={max_version}"),
            ));
        }

        Ok(version)
    }

    fn truncated(&self, e: std::io::Error) -> HalberdError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HalberdError::corruption(self.name.clone(), format!("truncated at byte {}", self.position))
        } else {
            HalberdError::Io(e)
        }
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8().map_err(|e| self.truncated(e))?;
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.position += 8;
        Ok(value)
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        let value = self
            .reader
            .read_i64::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.position += 8;
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_u8()?;
            bytes.push(byte);
            if byte & 0x80 == 0 {
                break;
            }
        }

        let (value, _) = decode_u64(&bytes)?;
        Ok(value)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| HalberdError::corruption(self.name.clone(), format!("invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        let mut bytes = vec![0u8; length];
        self.reader
            .read_exact(&mut bytes)
            .map_err(|e| self.truncated(e))?;
        self.position += length as u64;
        Ok(bytes)
    }

    /// Read a delta-compressed integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        let length = self.read_varint()? as usize;
        let mut values = Vec::with_capacity(length);
        let mut previous = 0u32;

        for _ in 0..length {
            let delta = self.read_varint()? as u32;
            let value = previous.wrapping_add(delta);
            values.push(value);
            previous = value;
        }

        Ok(values)
    }

    /// Read a string-to-string map.
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let length = self.read_varint()? as usize;
        let mut map = BTreeMap::new();

        for _ in 0..length {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }

        Ok(map)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }
}
