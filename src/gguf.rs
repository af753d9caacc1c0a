//! GGUF container reader.
//!
//! The file is memory-mapped and the header, metadata table and tensor
//! directory are parsed eagerly. Tensor payloads stay untouched until
//! [`GgufFile::tensor_data`] is asked for them.

use crate::error::{Result, RuntimeError};
use crate::quant::QuantKind;
use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const GGUF_MAGIC: u32 = 0x46554747;
pub const MIN_FILE_SIZE: u64 = 100;
pub const DEFAULT_ALIGNMENT: u64 = 32;
pub const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

const MAX_DIMS: u32 = 8;
const MAX_ARRAY_LEN: u64 = 1 << 22;
const MAX_NESTING: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            MetadataValue::U8(v) => Some(v as u64),
            MetadataValue::U16(v) => Some(v as u64),
            MetadataValue::U32(v) => Some(v as u64),
            MetadataValue::U64(v) => Some(v),
            MetadataValue::I8(v) if v >= 0 => Some(v as u64),
            MetadataValue::I16(v) if v >= 0 => Some(v as u64),
            MetadataValue::I32(v) if v >= 0 => Some(v as u64),
            MetadataValue::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            MetadataValue::F32(v) => Some(v as f64),
            MetadataValue::F64(v) => Some(v),
            _ => self.as_u64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::Array(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub kind: QuantKind,
    /// Offset relative to the start of the data section.
    pub offset: u64,
    /// Declared on-disk byte size, derived from dims and kind.
    pub size: u64,
}

impl TensorInfo {
    pub fn num_elements(&self) -> u64 {
        self.dims.iter().product()
    }
}

pub struct GgufFile {
    path: PathBuf,
    header: GgufHeader,
    metadata: HashMap<String, MetadataValue>,
    tensors: Vec<TensorInfo>,
    data_offset: u64,
    file_size: u64,
    mmap: Mmap,
}

impl std::fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufFile")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("tensors", &self.tensors.len())
            .field("data_offset", &self.data_offset)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl GgufFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < MIN_FILE_SIZE {
            return Err(RuntimeError::invalid_format(format!(
                "{} is {} bytes, below the {} byte minimum",
                path.display(),
                file_size,
                MIN_FILE_SIZE
            )));
        }

        // SAFETY: the mapping is read-only and owned by this value. Callers
        // must not truncate the file while a GgufFile is alive.
        let mmap = unsafe { Mmap::map(&file)? };

        let parsed = parse(&mmap)?;
        tracing::debug!(
            "parsed {}: v{} {} metadata keys, {} tensors",
            path.display(),
            parsed.header.version,
            parsed.header.metadata_count,
            parsed.header.tensor_count
        );

        Ok(Self {
            path: path.to_path_buf(),
            header: parsed.header,
            metadata: parsed.metadata,
            tensors: parsed.tensors,
            data_offset: parsed.data_offset,
            file_size,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> GgufHeader {
        self.header
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetadataValue::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(MetadataValue::as_f64).map(|v| v as f32)
    }

    /// String array value; non-string elements are rendered empty so
    /// indices stay aligned.
    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        self.get(key)?.as_array().map(|arr| {
            arr.iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
    }

    pub fn architecture(&self) -> &str {
        self.get_str("general.architecture").unwrap_or("llama")
    }

    /// Looks up `{architecture}.{suffix}`.
    pub fn arch_u64(&self, suffix: &str) -> Option<u64> {
        self.get_u64(&format!("{}.{}", self.architecture(), suffix))
    }

    pub fn metadata_keys(&self) -> impl Iterator<Item = &str> {
        self.metadata.keys().map(String::as_str)
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn tensor(&self, index: usize) -> Option<&TensorInfo> {
        self.tensors.get(index)
    }

    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Payload bytes of a tensor. Bounds were validated at open time.
    pub fn tensor_data(&self, info: &TensorInfo) -> &[u8] {
        let start = (self.data_offset + info.offset) as usize;
        let end = start + info.size as usize;
        self.mmap.get(start..end).unwrap_or(&[])
    }
}

struct Parsed {
    header: GgufHeader,
    metadata: HashMap<String, MetadataValue>,
    tensors: Vec<TensorInfo>,
    data_offset: u64,
}

fn parse(buf: &[u8]) -> Result<Parsed> {
    let mut r = Reader::new(buf);

    let magic = r.u32()?;
    if magic != GGUF_MAGIC {
        return Err(RuntimeError::invalid_format(format!(
            "bad magic: expected {:08x}, got {:08x}",
            GGUF_MAGIC, magic
        )));
    }

    let version = r.u32()?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(RuntimeError::invalid_format(format!("unsupported GGUF version {}", version)));
    }

    let tensor_count = r.u64()?;
    let metadata_count = r.u64()?;
    let file_len = buf.len() as u64;

    // Smallest possible entries: an empty-key u8 pair is 13 bytes, an empty
    // 1-d tensor entry 32 bytes.
    if metadata_count > file_len / 13 || tensor_count > file_len / 32 {
        return Err(RuntimeError::invalid_format(format!(
            "header counts ({} metadata, {} tensors) do not fit a {} byte file",
            metadata_count, tensor_count, file_len
        )));
    }

    let mut metadata = HashMap::with_capacity(metadata_count as usize);
    for _ in 0..metadata_count {
        let key = r.string()?;
        let value_type = r.u32()?;
        let value = r.value(value_type, 0)?;
        metadata.insert(key, value);
    }

    let mut tensors = Vec::with_capacity(tensor_count as usize);
    let mut seen = HashSet::with_capacity(tensor_count as usize);
    for _ in 0..tensor_count {
        let info = r.tensor_info()?;
        if !seen.insert(info.name.clone()) {
            return Err(RuntimeError::invalid_format(format!(
                "duplicate tensor name {}",
                info.name
            )));
        }
        tensors.push(info);
    }

    let alignment = match metadata.get("general.alignment") {
        Some(v) => v
            .as_u64()
            .filter(|a| *a > 0 && a.is_power_of_two())
            .ok_or_else(|| {
                RuntimeError::invalid_format("general.alignment must be a power of two")
            })?,
        None => DEFAULT_ALIGNMENT,
    };
    let data_offset = align_up(r.position(), alignment);

    for t in &tensors {
        let end = data_offset
            .checked_add(t.offset)
            .and_then(|v| v.checked_add(t.size));
        match end {
            Some(end) if end <= file_len => {}
            _ => {
                return Err(RuntimeError::invalid_format(format!(
                    "tensor {} ({} bytes at offset {}) lies outside the {} byte file",
                    t.name, t.size, t.offset, file_len
                )))
            }
        }
    }

    Ok(Parsed {
        header: GgufHeader {
            version,
            tensor_count,
            metadata_count,
        },
        metadata,
        tensors,
        data_offset,
    })
}

fn align_up(pos: u64, alignment: u64) -> u64 {
    pos.div_ceil(alignment) * alignment
}

fn truncated(_: std::io::Error) -> RuntimeError {
    RuntimeError::invalid_format("unexpected end of file")
}

struct Reader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { cur: Cursor::new(buf) }
    }

    fn position(&self) -> u64 {
        self.cur.position()
    }

    fn remaining(&self) -> u64 {
        (self.cur.get_ref().len() as u64).saturating_sub(self.cur.position())
    }

    fn u8(&mut self) -> Result<u8> {
        self.cur.read_u8().map_err(truncated)
    }

    fn u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<LittleEndian>().map_err(truncated)
    }

    fn u64(&mut self) -> Result<u64> {
        self.cur.read_u64::<LittleEndian>().map_err(truncated)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()?;
        if len > self.remaining() {
            return Err(RuntimeError::invalid_format(format!(
                "string of {} bytes runs past end of file",
                len
            )));
        }
        let start = self.cur.position() as usize;
        let end = start + len as usize;
        let bytes = &self.cur.get_ref()[start..end];
        self.cur.set_position(end as u64);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn value(&mut self, value_type: u32, depth: usize) -> Result<MetadataValue> {
        let v = match value_type {
            0 => MetadataValue::U8(self.cur.read_u8().map_err(truncated)?),
            1 => MetadataValue::I8(self.cur.read_i8().map_err(truncated)?),
            2 => MetadataValue::U16(self.cur.read_u16::<LittleEndian>().map_err(truncated)?),
            3 => MetadataValue::I16(self.cur.read_i16::<LittleEndian>().map_err(truncated)?),
            4 => MetadataValue::U32(self.cur.read_u32::<LittleEndian>().map_err(truncated)?),
            5 => MetadataValue::I32(self.cur.read_i32::<LittleEndian>().map_err(truncated)?),
            6 => MetadataValue::F32(self.cur.read_f32::<LittleEndian>().map_err(truncated)?),
            7 => MetadataValue::Bool(self.u8()? != 0),
            8 => MetadataValue::String(self.string()?),
            9 => {
                if depth >= MAX_NESTING {
                    return Err(RuntimeError::invalid_format("metadata arrays nested too deeply"));
                }
                let element_type = self.u32()?;
                let len = self.u64()?;
                if len > MAX_ARRAY_LEN || len > self.remaining() {
                    return Err(RuntimeError::invalid_format(format!(
                        "metadata array of {} elements is too large",
                        len
                    )));
                }
                let mut arr = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    arr.push(self.value(element_type, depth + 1)?);
                }
                MetadataValue::Array(arr)
            }
            10 => MetadataValue::U64(self.cur.read_u64::<LittleEndian>().map_err(truncated)?),
            11 => MetadataValue::I64(self.cur.read_i64::<LittleEndian>().map_err(truncated)?),
            12 => MetadataValue::F64(self.cur.read_f64::<LittleEndian>().map_err(truncated)?),
            other => {
                return Err(RuntimeError::invalid_format(format!(
                    "unknown metadata value type {}",
                    other
                )))
            }
        };
        Ok(v)
    }

    fn tensor_info(&mut self) -> Result<TensorInfo> {
        let name = self.string()?;
        let n_dims = self.u32()?;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(RuntimeError::invalid_format(format!(
                "tensor {} has {} dimensions",
                name, n_dims
            )));
        }

        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(self.u64()?);
        }

        let kind = QuantKind::from(self.u32()?);
        let offset = self.u64()?;

        let size = dims
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .and_then(|elements| kind.byte_size(elements))
            .ok_or_else(|| {
                RuntimeError::invalid_format(format!("tensor {} size overflows", name))
            })?;

        Ok(TensorInfo {
            name,
            dims,
            kind,
            offset,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn header(tensors: u64, kvs: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&tensors.to_le_bytes());
        buf.extend_from_slice(&kvs.to_le_bytes());
        buf
    }

    fn pad_to(buf: &mut Vec<u8>, len: usize) {
        if buf.len() < len {
            buf.resize(len, 0);
        }
    }

    #[test]
    fn test_parse_metadata_and_tensor() {
        let mut buf = header(1, 2);
        put_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes());
        put_string(&mut buf, "llama");
        put_string(&mut buf, "llama.block_count");
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&7u32.to_le_bytes());

        put_string(&mut buf, "output.weight");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        let data_start = align_up(buf.len() as u64, DEFAULT_ALIGNMENT) as usize;
        pad_to(&mut buf, data_start + 32);
        pad_to(&mut buf, 128);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.header.tensor_count, 1);
        assert_eq!(parsed.data_offset as usize, data_start);
        assert_eq!(parsed.metadata["general.architecture"].as_str(), Some("llama"));
        assert_eq!(parsed.metadata["llama.block_count"].as_u64(), Some(7));
        assert_eq!(parsed.tensors[0].size, 32);
        assert_eq!(parsed.tensors[0].kind, QuantKind::F32);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = vec![b'G', b'G', b'M', b'L'];
        pad_to(&mut buf, 128);
        assert!(matches!(parse(&buf), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        pad_to(&mut buf, 128);
        assert!(matches!(parse(&buf), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn test_tensor_out_of_bounds() {
        let mut buf = header(1, 0);
        put_string(&mut buf, "big");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&4096u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        pad_to(&mut buf, 256);
        assert!(matches!(parse(&buf), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn test_absurd_string_length() {
        let mut buf = header(0, 1);
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        pad_to(&mut buf, 128);
        assert!(matches!(parse(&buf), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn test_absurd_counts() {
        let mut buf = header(1 << 40, 0);
        pad_to(&mut buf, 128);
        assert!(matches!(parse(&buf), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(64, 32), 64);
        assert_eq!(align_up(65, 32), 96);
    }
}
