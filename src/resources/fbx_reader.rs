//! Binary FBX record reader.
//!
//! A binary FBX file is a tree of named records, each carrying a list of
//! typed properties. This module only turns bytes into that tree; the object
//! graph on top of it is read by [`crate::resources::fbx_graph`].

use std::io::Read;

use anyhow::{Context as _, bail};

use crate::error::ImportError;

/// `"Kaydara FBX Binary  \0"` followed by `0x1A 0x00`.
const MAGIC: &[u8; 23] = b"Kaydara FBX Binary  \x00\x1a\x00";
/// Versions from 7500 on use 64-bit record headers.
const WIDE_HEADER_VERSION: u32 = 7500;
const ARRAY_ZLIB: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum Property {
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    BoolArray(Vec<bool>),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    String(String),
    Raw(Vec<u8>),
}

impl Property {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Property::I16(v) => Some(v.into()),
            Property::I32(v) => Some(v.into()),
            Property::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Property::F32(v) => Some(v.into()),
            Property::F64(v) => Some(v),
            Property::I16(v) => Some(v.into()),
            Property::I32(v) => Some(v.into()),
            Property::I64(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Property::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any numeric array widened to `f64`.
    pub fn to_f64s(&self) -> Option<Vec<f64>> {
        match self {
            Property::F64Array(v) => Some(v.clone()),
            Property::F32Array(v) => Some(v.iter().map(|&x| x.into()).collect()),
            Property::I32Array(v) => Some(v.iter().map(|&x| x.into()).collect()),
            Property::I64Array(v) => Some(v.iter().map(|&x| x as f64).collect()),
            _ => None,
        }
    }

    /// Any integer array widened to `i64`.
    pub fn to_i64s(&self) -> Option<Vec<i64>> {
        match self {
            Property::I32Array(v) => Some(v.iter().map(|&x| x.into()).collect()),
            Property::I64Array(v) => Some(v.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Record>,
}

impl Record {
    pub fn child(&self, name: &str) -> Option<&Record> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Record> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn property(&self, idx: usize) -> Option<&Property> {
        self.properties.get(idx)
    }
}

/// The record tree of a whole file.
#[derive(Clone, Debug, Default)]
pub struct FbxFile {
    pub version: u32,
    pub records: Vec<Record>,
}

impl FbxFile {
    pub fn record(&self, name: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.name == name)
    }
}

pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    wide: bool,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .with_context(|| format!("FBX data ends early: {} bytes wanted at offset {}", len, self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// A record header field: 32 bits before 7.5, 64 bits after.
    fn offset(&mut self) -> anyhow::Result<u64> {
        if self.wide {
            Ok(u64::from_le_bytes(self.array()?))
        } else {
            Ok(self.u32()?.into())
        }
    }
}

/// Parses a binary FBX file into its record tree.
pub fn read(bytes: &[u8]) -> anyhow::Result<FbxFile> {
    if !is_binary(bytes) {
        bail!(ImportError::UnsupportedFormat(
            "only binary FBX files can be read without the assimp feature".to_string()
        ));
    }
    let mut cursor = Cursor {
        bytes,
        pos: MAGIC.len(),
        wide: false,
    };
    let version = cursor.u32()?;
    cursor.wide = version >= WIDE_HEADER_VERSION;
    let mut records = Vec::new();
    while cursor.pos < bytes.len() {
        match read_record(&mut cursor)? {
            Some(record) => records.push(record),
            None => break,
        }
    }
    log::debug!("FBX {}: {} top-level records", version, records.len());
    Ok(FbxFile { version, records })
}

/// `None` for the all-zero record that terminates a nested list.
fn read_record(cursor: &mut Cursor<'_>) -> anyhow::Result<Option<Record>> {
    let end = cursor.offset()?;
    let property_count = cursor.offset()?;
    let property_bytes = cursor.offset()?;
    let name_len = cursor.u8()? as usize;
    if end == 0 {
        return Ok(None);
    }
    let end = usize::try_from(end).context("FBX record offset overflows")?;
    if end > cursor.bytes.len() || end < cursor.pos {
        bail!("FBX record ends at {} outside the file of {} bytes", end, cursor.bytes.len());
    }
    let name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();

    let properties_start = cursor.pos;
    let mut properties = Vec::with_capacity(property_count.min(64) as usize);
    for _ in 0..property_count {
        properties.push(read_property(cursor).with_context(|| format!("In FBX record {name}"))?);
    }
    cursor.pos = properties_start + property_bytes as usize;

    let mut children = Vec::new();
    while cursor.pos < end {
        match read_record(cursor)? {
            Some(child) => children.push(child),
            None => break,
        }
    }
    cursor.pos = end;
    Ok(Some(Record {
        name,
        properties,
        children,
    }))
}

fn read_property(cursor: &mut Cursor<'_>) -> anyhow::Result<Property> {
    let code = cursor.u8()?;
    Ok(match code {
        b'C' => Property::Bool(cursor.u8()? != 0),
        b'Y' => Property::I16(i16::from_le_bytes(cursor.array()?)),
        b'I' => Property::I32(i32::from_le_bytes(cursor.array()?)),
        b'L' => Property::I64(i64::from_le_bytes(cursor.array()?)),
        b'F' => Property::F32(f32::from_le_bytes(cursor.array()?)),
        b'D' => Property::F64(f64::from_le_bytes(cursor.array()?)),
        b'S' => {
            let len = cursor.u32()? as usize;
            Property::String(String::from_utf8_lossy(cursor.take(len)?).into_owned())
        }
        b'R' => {
            let len = cursor.u32()? as usize;
            Property::Raw(cursor.take(len)?.to_vec())
        }
        b'b' => Property::BoolArray(read_array(cursor, 1)?.into_iter().map(|b| b != 0).collect()),
        b'i' => Property::I32Array(
            read_array(cursor, 4)?
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        b'f' => Property::F32Array(
            read_array(cursor, 4)?
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        b'l' => Property::I64Array(
            read_array(cursor, 8)?
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        b'd' => Property::F64Array(
            read_array(cursor, 8)?
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        other => bail!("unknown FBX property type {:?}", other as char),
    })
}

/// Raw little-endian element bytes of an array property, inflated if needed.
fn read_array(cursor: &mut Cursor<'_>, element_size: usize) -> anyhow::Result<Vec<u8>> {
    let count = cursor.u32()? as usize;
    let encoding = cursor.u32()?;
    let stored = cursor.u32()? as usize;
    let data = cursor.take(stored)?;
    let expected = count
        .checked_mul(element_size)
        .context("FBX array length overflows")?;
    let bytes = if encoding == ARRAY_ZLIB {
        let mut out = Vec::with_capacity(expected);
        flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .context("Failed to inflate FBX array")?;
        out
    } else {
        data.to_vec()
    };
    if bytes.len() < expected {
        bail!("FBX array holds {} bytes, {} expected", bytes.len(), expected);
    }
    Ok(bytes[..expected].to_vec())
}
