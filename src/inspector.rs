//! Model File Inspector (C4): derives file identity (size, SHA-256) and
//! GGUF metadata for a model path, behind a narrow [`GgufReader`] trait so
//! callers can substitute a fake in tests without touching real files.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;
use crate::gguf::{self, GgufValue};

/// Metadata values whose JSON encoding exceeds this many bytes are dropped
/// from [`ModelFileInfo::metadata`], except `tokenizer.chat_template` which
/// is kept regardless of size since callers need it verbatim.
const METADATA_VALUE_BYTE_LIMIT: usize = 200;
const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFileInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub sha256: String,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub file_type: Option<u32>,
    pub context_length: Option<u32>,
    pub embedding_length: Option<u32>,
    pub chat_template: Option<String>,
    pub block_count: Option<u64>,
    pub parameter_count: Option<u64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Narrow seam over GGUF inspection so the detection engine and registry
/// can be tested against a stub without real model files on disk.
pub trait GgufReader: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ModelFileInfo>;
}

/// Default [`GgufReader`] backed by real file I/O.
pub struct FileGgufReader;

impl GgufReader for FileGgufReader {
    /// File identity (`file_size`/`sha256`) is always produced. GGUF
    /// metadata is best-effort: a parse failure leaves every
    /// metadata-derived field `None`/empty rather than failing the whole
    /// inspection, matching `parameterCount`'s documented nullability on
    /// parse error (§3/§4.4).
    fn inspect(&self, path: &Path) -> Result<ModelFileInfo> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let sha256 = hash_file(path)?;

        let mut info = ModelFileInfo {
            path: path.to_path_buf(),
            file_size,
            sha256,
            architecture: None,
            name: None,
            file_type: None,
            context_length: None,
            embedding_length: None,
            chat_template: None,
            block_count: None,
            parameter_count: None,
            metadata: serde_json::Map::new(),
        };

        match File::open(path).map_err(Into::into).and_then(|f| gguf::parse(BufReader::new(f))) {
            Ok(parsed) => fill_from_parsed(&mut info, &parsed),
            Err(e) => warn!(path = %path.display(), error = %e, "GGUF metadata parse failed, returning file identity only"),
        }

        Ok(info)
    }
}

fn fill_from_parsed(info: &mut ModelFileInfo, parsed: &gguf::GgufFile) {
    let kv = parsed.metadata_map();

    info.architecture = kv.get("general.architecture").and_then(|v| v.as_str()).map(str::to_owned);
    info.name = kv.get("general.name").and_then(|v| v.as_str()).map(str::to_owned);
    info.file_type = kv.get("general.file_type").and_then(|v| v.as_u32());

    let arch = info.architecture.as_deref().unwrap_or("llama");
    info.context_length = kv
        .get(format!("{arch}.context_length").as_str())
        .and_then(|v| v.as_u32());
    info.embedding_length = kv
        .get(format!("{arch}.embedding_length").as_str())
        .and_then(|v| v.as_u32());
    info.chat_template = kv.get(CHAT_TEMPLATE_KEY).and_then(|v| v.as_str()).map(str::to_owned);

    info.block_count = parsed.block_count();
    info.parameter_count = Some(parsed.parameter_count());

    for (key, value) in &kv {
        let json = gguf_value_to_json(value);
        let encoded_len = serde_json::to_string(&json).map(|s| s.len()).unwrap_or(usize::MAX);
        if *key == CHAT_TEMPLATE_KEY || encoded_len <= METADATA_VALUE_BYTE_LIMIT {
            info.metadata.insert((*key).to_string(), json);
        }
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn gguf_value_to_json(value: &GgufValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        GgufValue::Uint8(v) => Value::from(*v),
        GgufValue::Int8(v) => Value::from(*v),
        GgufValue::Uint16(v) => Value::from(*v),
        GgufValue::Int16(v) => Value::from(*v),
        GgufValue::Uint32(v) => Value::from(*v),
        GgufValue::Int32(v) => Value::from(*v),
        GgufValue::Float32(v) => serde_json::Number::from_f64(*v as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        GgufValue::Bool(v) => Value::from(*v),
        GgufValue::String(v) => Value::from(v.clone()),
        GgufValue::Uint64(v) => Value::from(*v),
        GgufValue::Int64(v) => Value::from(*v),
        GgufValue::Float64(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        GgufValue::Array(items) => Value::Array(items.iter().map(gguf_value_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn write_str(buf: &mut Vec<u8>, s: &str) {
        write_u64(buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }

    fn sample_gguf_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&gguf::GGUF_MAGIC.to_le_bytes());
        write_u32(&mut buf, 3);
        write_u64(&mut buf, 1); // tensor_count
        write_u64(&mut buf, 2); // metadata_kv_count

        write_str(&mut buf, "general.architecture");
        write_u32(&mut buf, 8); // String type
        write_str(&mut buf, "llama");

        write_str(&mut buf, "tokenizer.chat_template");
        write_u32(&mut buf, 8);
        write_str(&mut buf, "{{ messages }}");

        write_str(&mut buf, "blk.0.attn_q.weight");
        write_u32(&mut buf, 2); // n_dims
        write_u64(&mut buf, 2);
        write_u64(&mut buf, 3);
        write_u32(&mut buf, 0); // ggml type
        write_u64(&mut buf, 0); // offset

        buf
    }

    #[test]
    fn inspect_extracts_metadata_and_hash() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(&sample_gguf_bytes()).unwrap();

        let info = FileGgufReader.inspect(tmp.path()).unwrap();
        assert_eq!(info.architecture.as_deref(), Some("llama"));
        assert_eq!(info.chat_template.as_deref(), Some("{{ messages }}"));
        assert_eq!(info.block_count, Some(1));
        assert_eq!(info.parameter_count, Some(6));
        assert_eq!(info.sha256.len(), 64);
    }

    #[test]
    fn oversized_metadata_values_are_trimmed_except_chat_template() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut buf = sample_gguf_bytes();
        // Patch metadata_kv_count up and append an oversized value.
        buf[16..24].copy_from_slice(&3u64.to_le_bytes());
        write_str(&mut buf, "general.huge_blob");
        write_u32(&mut buf, 8);
        write_str(&mut buf, &"x".repeat(500));
        tmp.as_file().write_all(&buf).unwrap();

        let info = FileGgufReader.inspect(tmp.path()).unwrap();
        assert!(!info.metadata.contains_key("general.huge_blob"));
        assert!(info.metadata.contains_key("tokenizer.chat_template"));
    }

    #[test]
    fn parse_failure_still_yields_file_identity() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().write_all(b"not a gguf file").unwrap();

        let info = FileGgufReader.inspect(tmp.path()).unwrap();
        assert_eq!(info.sha256.len(), 64);
        assert_eq!(info.file_size, "not a gguf file".len() as u64);
        assert_eq!(info.parameter_count, None);
        assert_eq!(info.block_count, None);
        assert_eq!(info.architecture, None);
        assert!(info.metadata.is_empty());
    }
}
