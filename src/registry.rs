//! Spec Registry (C6): an in-memory catalogue of detection results, keyed
//! by hash/alias/filename, resolved against a requested context size.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detection::DetectionResult;

/// A detection result plus the human-friendly aliases it was registered
/// under, in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub result: DetectionResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// Registry of detection results. Lookup order is always insertion order:
/// the first entry whose identity and context-size requirements are
/// satisfied wins.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SpecRegistry {
    entries: Vec<Entry>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_str(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::error::SwitchboardError::Parse {
            reason: format!("invalid spec registry JSON: {e}"),
        })
    }

    pub fn to_json_string(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::SwitchboardError::Parse {
            reason: format!("failed to serialize spec registry: {e}"),
        })
    }

    pub fn add_detection_result(&mut self, result: DetectionResult, aliases: Vec<String>) {
        self.entries.push(Entry { result, aliases });
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Resolve `identifier` (sha256, alias, filename stem, or quant-stripped
    /// filename stem) to the first matching entry whose detected context
    /// sizes can satisfy `context_size` (when given). First match wins.
    pub fn select_spec(&self, identifier: &str, context_size: Option<u64>) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| identifier_matches(e, identifier) && satisfies_context(e, context_size))
    }
}

fn identifier_matches(entry: &Entry, identifier: &str) -> bool {
    if entry.result.sha256.eq_ignore_ascii_case(identifier) {
        return true;
    }
    if entry.aliases.iter().any(|a| a == identifier) {
        return true;
    }
    if let Some(stem) = filename_stem_lower(&entry.result.model_path) {
        if stem == identifier.to_lowercase() {
            return true;
        }
        if strip_quant_suffix(&stem) == strip_quant_suffix(&identifier.to_lowercase()) {
            return true;
        }
    }
    false
}

fn satisfies_context(entry: &Entry, context_size: Option<u64>) -> bool {
    match context_size {
        None => !entry.result.per_context.is_empty(),
        Some(requested) => entry
            .result
            .per_context
            .iter()
            .any(|c| c.context_size >= requested),
    }
}

fn filename_stem_lower(path: &Path) -> Option<String> {
    Some(path.file_stem()?.to_string_lossy().to_lowercase())
}

/// Strip a trailing quantization suffix such as `-q4_k_m` or `-q8_0`,
/// applied once.
fn strip_quant_suffix(name: &str) -> String {
    let re = Regex::new(r"-q\d+(_[a-z0-9]+)*$").unwrap();
    re.replace(name, "").into_owned()
}
