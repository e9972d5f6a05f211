//! GGUF binary format: header, metadata key/value section, and tensor-info
//! section. Unlike a quick-scan metadata reader, this walks past the
//! metadata into the tensor-info table so callers can derive `blockCount`
//! and `parameterCount` from the full tensor list.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{Result, SwitchboardError};

pub const GGUF_MAGIC: u32 = 0x4655_4747;
pub const GGUF_VERSION_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl TryFrom<u32> for GgufValueType {
    type Error = SwitchboardError;
    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Uint8),
            1 => Ok(Self::Int8),
            2 => Ok(Self::Uint16),
            3 => Ok(Self::Int16),
            4 => Ok(Self::Uint32),
            5 => Ok(Self::Int32),
            6 => Ok(Self::Float32),
            7 => Ok(Self::Bool),
            8 => Ok(Self::String),
            9 => Ok(Self::Array),
            10 => Ok(Self::Uint64),
            11 => Ok(Self::Int64),
            12 => Ok(Self::Float64),
            other => Err(SwitchboardError::Parse {
                reason: format!("invalid GGUF value type tag {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GgufValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl GgufValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(v) => Some(*v),
            Self::Int32(v) => Some(*v as u32),
            Self::Uint64(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

#[derive(Debug, Clone)]
pub struct GgufMetadataKv {
    pub key: String,
    pub value: GgufValue,
}

/// One entry from the tensor-info section: name, shape, and byte offset.
/// The element type tag is read but not retained, it is irrelevant to
/// parameter counting.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dimensions: Vec<u64>,
}

impl TensorInfo {
    pub fn element_count(&self) -> u64 {
        self.dimensions.iter().product()
    }
}

/// Full parse of a GGUF file: header, metadata, and every tensor's shape.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub header: GgufHeader,
    pub metadata: Vec<GgufMetadataKv>,
    pub tensors: Vec<TensorInfo>,
}

impl GgufFile {
    pub fn metadata_map(&self) -> HashMap<&str, &GgufValue> {
        self.metadata
            .iter()
            .map(|kv| (kv.key.as_str(), &kv.value))
            .collect()
    }

    /// One past the highest `N` in any `blk.<N>.*` tensor name, i.e. the
    /// number of transformer blocks. `None` if no tensor matches the
    /// pattern.
    pub fn block_count(&self) -> Option<u64> {
        self.tensors
            .iter()
            .filter_map(|t| {
                let rest = t.name.strip_prefix("blk.")?;
                let end = rest.find('.')?;
                rest[..end].parse::<u64>().ok()
            })
            .max()
            .map(|max_n| max_n + 1)
    }

    /// Sum of `element_count()` across every tensor.
    pub fn parameter_count(&self) -> u64 {
        self.tensors.iter().map(TensorInfo::element_count).sum()
    }
}

/// Parse the full GGUF structure from `r`: header, all metadata KVs (no
/// scan-window truncation), and the complete tensor-info table.
pub fn parse(mut r: impl Read) -> Result<GgufFile> {
    let magic = read_u32(&mut r)?;
    if magic != GGUF_MAGIC {
        return Err(SwitchboardError::Parse {
            reason: format!("bad GGUF magic 0x{magic:08x}"),
        });
    }
    let version = read_u32(&mut r)?;
    if version > GGUF_VERSION_MAX {
        return Err(SwitchboardError::Parse {
            reason: format!("unsupported GGUF version {version}"),
        });
    }
    let tensor_count = read_u64(&mut r)?;
    let metadata_kv_count = read_u64(&mut r)?;

    let mut metadata = Vec::with_capacity(metadata_kv_count as usize);
    for _ in 0..metadata_kv_count {
        metadata.push(read_kv(&mut r)?);
    }

    let mut tensors = Vec::with_capacity(tensor_count as usize);
    for _ in 0..tensor_count {
        tensors.push(read_tensor_info(&mut r)?);
    }

    Ok(GgufFile {
        header: GgufHeader {
            version,
            tensor_count,
            metadata_kv_count,
        },
        metadata,
        tensors,
    })
}

fn read_tensor_info(r: &mut impl Read) -> Result<TensorInfo> {
    let name = read_string(r)?;
    let n_dims = read_u32(r)?;
    let mut dimensions = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        dimensions.push(read_u64(r)?);
    }
    let _ggml_type = read_u32(r)?;
    let _offset = read_u64(r)?;
    Ok(TensorInfo { name, dimensions })
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i8(r: &mut impl Read) -> Result<i8> {
    Ok(read_u8(r)? as i8)
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_i16(r: &mut impl Read) -> Result<i16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(i16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f32(r: &mut impl Read) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_bool(r: &mut impl Read) -> Result<bool> {
    Ok(read_u8(r)? != 0)
}

fn read_string(r: &mut impl Read) -> Result<String> {
    let len = read_u64(r)? as usize;
    if len > 16_000_000 {
        return Err(SwitchboardError::Parse {
            reason: format!("string length {len} implausibly large"),
        });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_value(r: &mut impl Read, vtype: GgufValueType) -> Result<GgufValue> {
    match vtype {
        GgufValueType::Uint8 => Ok(GgufValue::Uint8(read_u8(r)?)),
        GgufValueType::Int8 => Ok(GgufValue::Int8(read_i8(r)?)),
        GgufValueType::Uint16 => Ok(GgufValue::Uint16(read_u16(r)?)),
        GgufValueType::Int16 => Ok(GgufValue::Int16(read_i16(r)?)),
        GgufValueType::Uint32 => Ok(GgufValue::Uint32(read_u32(r)?)),
        GgufValueType::Int32 => Ok(GgufValue::Int32(read_i32(r)?)),
        GgufValueType::Float32 => Ok(GgufValue::Float32(read_f32(r)?)),
        GgufValueType::Bool => Ok(GgufValue::Bool(read_bool(r)?)),
        GgufValueType::String => Ok(GgufValue::String(read_string(r)?)),
        GgufValueType::Array => {
            let elem_type = GgufValueType::try_from(read_u32(r)?)?;
            let count = read_u64(r)? as usize;
            if count > 20_000_000 {
                return Err(SwitchboardError::Parse {
                    reason: format!("array length {count} implausibly large"),
                });
            }
            let mut arr = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                arr.push(read_value(r, elem_type)?);
            }
            Ok(GgufValue::Array(arr))
        }
        GgufValueType::Uint64 => Ok(GgufValue::Uint64(read_u64(r)?)),
        GgufValueType::Int64 => Ok(GgufValue::Int64(read_i64(r)?)),
        GgufValueType::Float64 => Ok(GgufValue::Float64(read_f64(r)?)),
    }
}

fn read_kv(r: &mut impl Read) -> Result<GgufMetadataKv> {
    let key = read_string(r)?;
    let vtype = GgufValueType::try_from(read_u32(r)?)?;
    let value = read_value(r, vtype)?;
    Ok(GgufMetadataKv { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Build a minimal GGUF byte stream: one string metadata KV and two
    /// `blk.N.*` tensors, to exercise block/parameter counting end to end.
    fn sample_file_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&2u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&1u64.to_le_bytes()); // metadata_kv_count

        // metadata: general.architecture = "llama"
        write_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&(GgufValueType::String as u32).to_le_bytes());
        write_string(&mut buf, "llama");

        // tensor 0: blk.0.attn_q.weight, dims [4, 8]
        write_string(&mut buf, "blk.0.attn_q.weight");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // ggml type
        buf.extend_from_slice(&0u64.to_le_bytes()); // offset

        // tensor 1: blk.1.attn_q.weight, dims [4, 8]
        write_string(&mut buf, "blk.1.attn_q.weight");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());

        buf
    }

    #[test]
    fn parses_header_metadata_and_tensors() {
        let bytes = sample_file_bytes();
        let file = parse(Cursor::new(bytes)).unwrap();
        assert_eq!(file.header.tensor_count, 2);
        assert_eq!(file.tensors.len(), 2);
        let map = file.metadata_map();
        assert_eq!(map.get("general.architecture").unwrap().as_str(), Some("llama"));
    }

    #[test]
    fn block_count_is_max_index_plus_one() {
        let file = parse(Cursor::new(sample_file_bytes())).unwrap();
        assert_eq!(file.block_count(), Some(2));
    }

    #[test]
    fn parameter_count_sums_all_tensors() {
        let file = parse(Cursor::new(sample_file_bytes())).unwrap();
        assert_eq!(file.parameter_count(), 4 * 8 * 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_file_bytes();
        bytes[0] = 0;
        assert!(parse(Cursor::new(bytes)).is_err());
    }
}
