//! Chunk archive files.
//!
//! An archive is a header followed by a sequence of records, each holding one
//! serialised data blob:
//!
//! ```text
//! magic      8 bytes   "DAQBLOB\0"
//! version    u16       1
//! byte order u8        0 = little endian, 1 = big endian
//! layout     u8        0 = heterogeneous, 1 = homogeneous
//! type name  string    homogeneous archives only
//! records    ...
//! ```
//!
//! Heterogeneous records are `type name | length | bytes`; homogeneous
//! records omit the type name. Strings are a `u16` length followed by UTF-8,
//! blob lengths are `u32`, both in the archive's byte order (the magic and
//! version are always big endian).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{AppResult, DaqError};

pub const ARCHIVE_MAGIC: &[u8; 8] = b"DAQBLOB\0";
pub const ARCHIVE_VERSION: u16 = 1;

/// Largest blob a record may hold. Longer length fields mark a corrupt file.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    Little,
    #[default]
    Big,
}

impl ByteOrder {
    fn tag(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        }
    }

    fn from_tag(tag: u8) -> AppResult<Self> {
        match tag {
            0 => Ok(ByteOrder::Little),
            1 => Ok(ByteOrder::Big),
            other => Err(DaqError::Format(format!("invalid byte order marker {}", other))),
        }
    }

    fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// One blob read back from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub type_name: String,
    pub data: Vec<u8>,
}

/// Writes records to an archive.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    order: ByteOrder,
    homogeneous_type: Option<String>,
    records: u64,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create a heterogeneous archive file at `path`.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::heterogeneous(BufWriter::new(File::create(path)?), ByteOrder::default())
    }
}

impl<W: Write> ArchiveWriter<W> {
    /// An archive whose records may each be of a different type.
    pub fn heterogeneous(inner: W, order: ByteOrder) -> AppResult<Self> {
        Self::start(inner, order, None)
    }

    /// An archive holding only `type_name` records; the name is written once.
    pub fn homogeneous(inner: W, order: ByteOrder, type_name: impl Into<String>) -> AppResult<Self> {
        Self::start(inner, order, Some(type_name.into()))
    }

    fn start(mut inner: W, order: ByteOrder, homogeneous_type: Option<String>) -> AppResult<Self> {
        inner.write_all(ARCHIVE_MAGIC)?;
        inner.write_all(&ARCHIVE_VERSION.to_be_bytes())?;
        inner.write_all(&[order.tag(), u8::from(homogeneous_type.is_some())])?;
        let mut writer = Self {
            inner,
            order,
            homogeneous_type: None,
            records: 0,
        };
        if let Some(name) = &homogeneous_type {
            writer.write_string(name)?;
        }
        writer.homogeneous_type = homogeneous_type;
        Ok(writer)
    }

    fn write_string(&mut self, value: &str) -> AppResult<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| DaqError::Format(format!("type name of {} bytes is too long", value.len())))?;
        self.inner.write_all(&self.order.u16_bytes(len))?;
        self.inner.write_all(value.as_bytes())?;
        Ok(())
    }

    /// Append one blob.
    pub fn write_record(&mut self, type_name: &str, data: &[u8]) -> AppResult<()> {
        match &self.homogeneous_type {
            Some(expected) if expected != type_name => {
                return Err(DaqError::Format(format!(
                    "archive holds only '{}' records, got '{}'",
                    expected, type_name
                )));
            }
            Some(_) => {}
            None => self.write_string(type_name)?,
        }
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or_else(|| DaqError::Format(format!("record of {} bytes is too long", data.len())))?;
        self.inner.write_all(&self.order.u32_bytes(len))?;
        self.inner.write_all(data)?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> AppResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads records from an archive.
#[derive(Debug)]
pub struct ArchiveReader<R: Read> {
    inner: R,
    order: ByteOrder,
    homogeneous_type: Option<String>,
}

impl ArchiveReader<BufReader<File>> {
    pub fn open_path(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::open(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> ArchiveReader<R> {
    /// Validate the header. Any mismatch is a [`DaqError::Format`].
    pub fn open(mut inner: R) -> AppResult<Self> {
        let mut magic = [0u8; 8];
        read_header_field(&mut inner, &mut magic)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(DaqError::Format("not a chunk archive (bad magic)".into()));
        }

        let mut version = [0u8; 2];
        read_header_field(&mut inner, &mut version)?;
        let version = u16::from_be_bytes(version);
        if version != ARCHIVE_VERSION {
            return Err(DaqError::Format(format!(
                "unsupported archive version {} (expected {})",
                version, ARCHIVE_VERSION
            )));
        }

        let mut flags = [0u8; 2];
        read_header_field(&mut inner, &mut flags)?;
        let order = ByteOrder::from_tag(flags[0])?;
        let homogeneous = match flags[1] {
            0 => false,
            1 => true,
            other => {
                return Err(DaqError::Format(format!("invalid layout flag {}", other)));
            }
        };

        let mut reader = Self {
            inner,
            order,
            homogeneous_type: None,
        };
        if homogeneous {
            reader.homogeneous_type = Some(reader.read_string()?);
        }
        Ok(reader)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn is_homogeneous(&self) -> bool {
        self.homogeneous_type.is_some()
    }

    /// The single record type of a homogeneous archive.
    pub fn type_name(&self) -> Option<&str> {
        self.homogeneous_type.as_deref()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DaqError::Format("truncated archive record".into()),
            _ => DaqError::Io(e),
        })
    }

    fn read_string(&mut self) -> AppResult<String> {
        let mut len = [0u8; 2];
        self.read_exact(&mut len)?;
        self.read_string_body(len)
    }

    fn read_string_body(&mut self, len: [u8; 2]) -> AppResult<String> {
        let mut bytes = vec![0u8; usize::from(self.order.read_u16(len))];
        self.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| DaqError::Format("type name is not UTF-8".into()))
    }

    /// True at a clean end of input, without consuming anything else.
    fn at_end(&mut self, first: &mut [u8; 1]) -> AppResult<bool> {
        loop {
            match self.inner.read(first) {
                Ok(0) => return Ok(true),
                Ok(_) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The next record, or `None` at end of archive.
    pub fn next_record(&mut self) -> AppResult<Option<ArchiveRecord>> {
        let mut first = [0u8; 1];
        if self.at_end(&mut first)? {
            return Ok(None);
        }

        if let Some(name) = self.homogeneous_type.clone() {
            let mut len = [first[0], 0, 0, 0];
            self.read_exact(&mut len[1..])?;
            return self.read_blob(name, len).map(Some);
        }

        let mut len = [first[0], 0];
        self.read_exact(&mut len[1..])?;
        let type_name = self.read_string_body(len)?;

        let mut len = [0u8; 4];
        self.read_exact(&mut len)?;
        self.read_blob(type_name, len).map(Some)
    }

    fn read_blob(&mut self, type_name: String, len: [u8; 4]) -> AppResult<ArchiveRecord> {
        let len = self.order.read_u32(len);
        if len > MAX_RECORD_SIZE {
            return Err(DaqError::Format(format!(
                "'{}' record claims {} bytes, limit is {}",
                type_name, len, MAX_RECORD_SIZE
            )));
        }
        let mut data = vec![0u8; len as usize];
        self.read_exact(&mut data)?;
        Ok(ArchiveRecord { type_name, data })
    }
}

impl<R: Read> Iterator for ArchiveReader<R> {
    type Item = AppResult<ArchiveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_header_field<R: Read>(reader: &mut R, buf: &mut [u8]) -> AppResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DaqError::Format("truncated archive header".into()),
        _ => DaqError::Io(e),
    })
}
