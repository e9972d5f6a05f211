//! Server configuration: an immutable value type and the `accept` pre-order
//! that decides whether a running config can satisfy a pending one.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default context size used wherever a config leaves it unset.
pub const DEFAULT_CONTEXT_SIZE: u64 = 4096;

/// Tri-state flash-attention setting. `Auto` is the default and is
/// semantically equivalent to the field being absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttention {
    On,
    Off,
    Auto,
}

impl Default for FlashAttention {
    fn default() -> Self {
        FlashAttention::Auto
    }
}

/// Server configuration. Value type: equality is structural across all
/// fields. Every field but `model_path` is optional and falls back to a
/// documented default via [`Config::effective_*`] helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    pub model_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embeddings: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flash_attention: Option<FlashAttention>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mlock: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gpu_layers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub n_cpu_moe: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_tensors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Config {
    /// A bare config pointing at `model_path`, every other field at its
    /// documented default.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            host: None,
            port: None,
            model_path: model_path.into(),
            threads: None,
            context_size: None,
            embeddings: None,
            flash_attention: None,
            mlock: None,
            gpu_layers: None,
            n_cpu_moe: None,
            override_tensors: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn with_context_size(mut self, context_size: u64) -> Self {
        self.context_size = Some(context_size);
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = Some(gpu_layers);
        self
    }

    pub fn with_n_cpu_moe(mut self, n_cpu_moe: u32) -> Self {
        self.n_cpu_moe = Some(n_cpu_moe);
        self
    }

    pub fn with_override_tensors(mut self, override_tensors: Vec<String>) -> Self {
        self.override_tensors = override_tensors;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_flash_attention(mut self, flash_attention: FlashAttention) -> Self {
        self.flash_attention = Some(flash_attention);
        self
    }

    pub fn effective_host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn effective_context_size(&self) -> u64 {
        self.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE)
    }

    pub fn effective_embeddings(&self) -> bool {
        self.embeddings.unwrap_or(false)
    }

    pub fn effective_flash_attention(&self) -> FlashAttention {
        self.flash_attention.unwrap_or_default()
    }

    pub fn effective_mlock(&self) -> bool {
        self.mlock.unwrap_or(false)
    }

    /// `None` means "unspecified" (CPU-only semantics), distinct from `Some(0)`.
    pub fn effective_gpu_layers(&self) -> Option<u32> {
        self.gpu_layers
    }

    pub fn effective_n_cpu_moe(&self) -> u32 {
        self.n_cpu_moe.unwrap_or(0)
    }

    /// Does a server already running with `self` accept a pending request
    /// whose desired config is `other`? Reflexive, not symmetric — a
    /// pre-order suitable for "can this host satisfy this demand?" (§4.2).
    pub fn accept(&self, other: &Config) -> bool {
        if self == other {
            return true;
        }
        if self.model_path != other.model_path {
            return false;
        }
        if self.effective_context_size() < other.effective_context_size() {
            return false;
        }
        if self.effective_flash_attention() != other.effective_flash_attention() {
            return false;
        }
        if self.effective_embeddings() != other.effective_embeddings() {
            return false;
        }
        match (self.effective_gpu_layers(), other.effective_gpu_layers()) {
            (None, Some(_)) => return false,
            (Some(a), Some(b)) if a < b => return false,
            (None, None) => {}
            (Some(_), None) => {}
            (Some(_), Some(_)) => {}
        }
        if self.effective_n_cpu_moe() > other.effective_n_cpu_moe() {
            return false;
        }
        if self.override_tensors != other.override_tensors {
            return false;
        }
        if self.args != other.args {
            return false;
        }
        true
    }
}
