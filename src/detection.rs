//! Detection Engine (C5): binary-searches the configuration space across a
//! ladder of context sizes, benchmarking each candidate against a running
//! `llama-server`, to produce a [`DetectionResult`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, FlashAttention};
use crate::error::{Result, SwitchboardError};
use crate::http_client::CompletionsClient;
use crate::inspector::GgufReader;
use crate::installation::Installation;
use crate::supervisor::Supervisor;

/// Context sizes walked from smallest to largest. Each step reuses the
/// previous step's findings as a search hint rather than starting cold.
pub const CONTEXT_LADDER: &[u64] = &[
    4 * 1024,
    8 * 1024,
    16 * 1024,
    24 * 1024,
    32 * 1024,
    48 * 1024,
    64 * 1024,
    96 * 1024,
    128 * 1024,
    192 * 1024,
    256 * 1024,
];

/// Fixed prompts benchmarked at every probe, verbatim per §6.3, each capped
/// at 20 generated tokens.
pub const BENCH_PROMPTS: &[&str] = &[
    "What is machine learning and how does it differ from traditional programming?",
    "What are the essential ingredients needed to make pasta from scratch?",
    "How many players are on a basketball team during a game?",
];
const BENCH_MAX_TOKENS: u32 = 20;

/// Fixed tensor-override patterns tried, in order, when GPU-layer and
/// CPU-MoE search alone cannot fit a context size in VRAM, verbatim per
/// §6.3. Some entries are compound: every pattern in the entry becomes one
/// element of `Config::override_tensors`.
pub const TENSOR_OVERRIDE_PATTERNS: &[&[&str]] = &[
    &["ffn_up.*=CPU"],
    &["ffn_down.*=CPU"],
    &["ffn_gate.*=CPU"],
    &["ffn_up.*=CPU", "ffn_down.*=CPU"],
    &["ffn_up.*=CPU", "ffn_gate.*=CPU"],
    &["attn.*=CPU"],
];

const FULL_OFFLOAD_GPU_LAYERS: u32 = 999;

/// Flash-attention states searched independently at every context size
/// (§4.5): each can win at a different context size, so both are probed
/// and the better-scoring one is kept.
const FLASH_ATTENTION_STATES: [FlashAttention; 2] = [FlashAttention::On, FlashAttention::Off];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCandidate {
    pub context_size: u64,
    pub config: Config,
    pub prompt_tps: f64,
    pub generation_tps: f64,
}

impl ContextCandidate {
    pub fn score(&self) -> f64 {
        self.prompt_tps + self.generation_tps
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub model_path: PathBuf,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parameter_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block_count: Option<u64>,
    /// One winning candidate per context size that could be benchmarked at
    /// all; sizes nothing could fit are simply absent.
    pub per_context: Vec<ContextCandidate>,
}

pub struct DetectionEngine {
    reader: Arc<dyn GgufReader>,
    installation: Arc<Installation>,
    client: Arc<dyn CompletionsClient>,
}

impl DetectionEngine {
    pub fn new(
        reader: Arc<dyn GgufReader>,
        installation: Arc<Installation>,
        client: Arc<dyn CompletionsClient>,
    ) -> Self {
        Self {
            reader,
            installation,
            client,
        }
    }

    pub async fn detect(&self, model_path: &Path) -> Result<DetectionResult> {
        let info = self.reader.inspect(model_path)?;
        let has_cuda = self.installation.has_cuda().await?;

        let mut per_context = Vec::new();
        let mut prev_max_gpu_layers: Option<u32> = None;
        let mut prev_min_cpu_moe: Option<u32> = None;
        let mut prev_override_pattern: Option<usize> = None;

        for &context_size in CONTEXT_LADDER {
            let mut best: Option<ContextCandidate> = None;

            for flash in FLASH_ATTENTION_STATES {
                let base = Config::new(model_path)
                    .with_context_size(context_size)
                    .with_flash_attention(flash);

                let candidate = if !has_cuda {
                    self.search_cpu_only(&base, context_size).await
                } else {
                    self.search_gpu(
                        &base,
                        context_size,
                        info.block_count,
                        &mut prev_max_gpu_layers,
                        &mut prev_min_cpu_moe,
                        &mut prev_override_pattern,
                    )
                    .await
                };

                if let Some(c) = candidate {
                    if best.as_ref().map(|b| c.score() > b.score()).unwrap_or(true) {
                        best = Some(c);
                    }
                }
            }

            match best {
                Some(c) => per_context.push(c),
                None => {
                    info!(context_size, "no configuration fit at this context size, skipping");
                }
            }
        }

        Ok(DetectionResult {
            model_path: model_path.to_path_buf(),
            sha256: info.sha256,
            architecture: info.architecture,
            parameter_count: info.parameter_count,
            block_count: info.block_count,
            per_context,
        })
    }

    /// CPU-only hosts have nothing to binary-search: a single baseline
    /// probe either benchmarks or the context size is infeasible.
    async fn search_cpu_only(&self, base: &Config, context_size: u64) -> Option<ContextCandidate> {
        self.benchmark(base).await.ok().map(|(tps_p, tps_g)| ContextCandidate {
            context_size,
            config: base.clone(),
            prompt_tps: tps_p,
            generation_tps: tps_g,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn search_gpu(
        &self,
        base: &Config,
        context_size: u64,
        block_count: Option<u64>,
        prev_max_gpu_layers: &mut Option<u32>,
        prev_min_cpu_moe: &mut Option<u32>,
        prev_override_pattern: &mut Option<usize>,
    ) -> Option<ContextCandidate> {
        let mut best: Option<ContextCandidate> = None;
        let mut consider = |candidate: ContextCandidate, best: &mut Option<ContextCandidate>| {
            if best.as_ref().map(|b| candidate.score() > b.score()).unwrap_or(true) {
                *best = Some(candidate);
            }
        };

        // Step 1: everything on GPU.
        let full = base.clone().with_gpu_layers(FULL_OFFLOAD_GPU_LAYERS);
        if let Ok((p, g)) = self.benchmark(&full).await {
            consider(
                ContextCandidate {
                    context_size,
                    config: full,
                    prompt_tps: p,
                    generation_tps: g,
                },
                &mut best,
            );
            *prev_max_gpu_layers = Some(FULL_OFFLOAD_GPU_LAYERS);
            return best;
        }

        // Step 2: binary-search the maximum gpu_layers that still benchmarks.
        let hi = block_count.map(|b| b as u32).unwrap_or(FULL_OFFLOAD_GPU_LAYERS);
        let max_layers = binary_search_max(0, hi, *prev_max_gpu_layers, |layers| {
            let cfg = base.clone().with_gpu_layers(layers);
            async move { self.benchmark(&cfg).await.is_ok() }
        })
        .await;

        if let Some(layers) = max_layers {
            *prev_max_gpu_layers = Some(layers);
            let cfg = base.clone().with_gpu_layers(layers);
            if let Ok((p, g)) = self.benchmark(&cfg).await {
                consider(
                    ContextCandidate {
                        context_size,
                        config: cfg,
                        prompt_tps: p,
                        generation_tps: g,
                    },
                    &mut best,
                );
            }
        }

        // Step 3: binary-search the minimum n_cpu_moe needed to fit, at max gpu_layers.
        if let Some(layers) = max_layers {
            let min_moe = binary_search_min(0, hi, *prev_min_cpu_moe, |moe| {
                let cfg = base.clone().with_gpu_layers(layers).with_n_cpu_moe(moe);
                async move { self.benchmark(&cfg).await.is_ok() }
            })
            .await;
            if let Some(moe) = min_moe {
                *prev_min_cpu_moe = Some(moe);
                let cfg = base.clone().with_gpu_layers(layers).with_n_cpu_moe(moe);
                if let Ok((p, g)) = self.benchmark(&cfg).await {
                    consider(
                        ContextCandidate {
                            context_size,
                            config: cfg,
                            prompt_tps: p,
                            generation_tps: g,
                        },
                        &mut best,
                    );
                }
            }
        }

        // Step 4: tensor-override patterns, if nothing above worked at all.
        if best.is_none() {
            let order: Vec<usize> = match prev_override_pattern {
                Some(idx) => {
                    let mut v = vec![*idx];
                    v.extend((0..TENSOR_OVERRIDE_PATTERNS.len()).filter(|i| *i != *idx));
                    v
                }
                None => (0..TENSOR_OVERRIDE_PATTERNS.len()).collect(),
            };
            for idx in order {
                let patterns = TENSOR_OVERRIDE_PATTERNS[idx].iter().map(|s| s.to_string()).collect();
                let cfg = base.clone().with_override_tensors(patterns);
                if let Ok((p, g)) = self.benchmark(&cfg).await {
                    *prev_override_pattern = Some(idx);
                    consider(
                        ContextCandidate {
                            context_size,
                            config: cfg,
                            prompt_tps: p,
                            generation_tps: g,
                        },
                        &mut best,
                    );
                    break;
                }
            }
        }

        best
    }

    /// Spawn a supervisor for `config` on an auto-allocated port, wait for
    /// it to become ready, run every fixed prompt, and report the mean
    /// prompt/generation throughput. Any failure (start, timeout, protocol)
    /// is treated as "this configuration doesn't fit" rather than a hard
    /// error, matching the detection engine's probe-swallowing policy.
    async fn benchmark(&self, config: &Config) -> Result<(f64, f64)> {
        let server_path = self
            .installation
            .server_path()
            .ok_or_else(|| SwitchboardError::NotFound {
                what: "llama-server binary".into(),
            })?;
        let flash_attn_is_enum = self.installation.flash_attn_is_enum().await?;
        let mut supervisor = Supervisor::new(server_path, config.clone(), flash_attn_is_enum)?;

        let result = async {
            supervisor.start().await?;
            let base_url = supervisor.base_url();
            let mut prompt_sum = 0.0;
            let mut gen_sum = 0.0;
            for prompt in BENCH_PROMPTS {
                let timings = self.client.complete(&base_url, prompt, BENCH_MAX_TOKENS).await?;
                prompt_sum += timings.prompt_per_second;
                gen_sum += timings.predicted_per_second;
            }
            let n = BENCH_PROMPTS.len() as f64;
            Ok((prompt_sum / n, gen_sum / n))
        }
        .await;

        if let Err(ref e) = result {
            if !matches!(e, SwitchboardError::StartFailed { .. } | SwitchboardError::Timeout { .. } | SwitchboardError::ProtocolError { .. }) {
                warn!(error = %e, "benchmark failed with an unexpected error kind");
            }
        }

        let _ = supervisor.stop(false).await;
        result
    }
}

/// Binary-search the largest `v` in `[lo, hi]` for which `probe(v)` is
/// true, assuming success is monotone non-increasing in `v`. When `initial`
/// is given it is tried first: success narrows the search upward from
/// there, failure narrows it downward, short-circuiting the common case
/// where the previous context size's answer is still close to correct.
async fn binary_search_max<F, Fut>(lo: u32, hi: u32, initial: Option<u32>, mut probe: F) -> Option<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    if hi < lo {
        return None;
    }
    let (mut lo, hi) = (lo, hi);
    if let Some(seed) = initial.filter(|s| *s >= lo && *s <= hi) {
        if probe(seed).await {
            lo = seed;
        } else {
            // Monotone cutoff (§4.5 binary-search contract step 1): a
            // failed seed means nothing above it can work either.
            return None;
        }
    }
    if !probe(hi).await {
        // hi itself may still work if initial wasn't tried or testing the
        // lowered hi narrowed past it; keep halving until we find the edge.
        let mut found = None;
        let (mut l, mut h) = (lo, hi);
        while l <= h {
            let mid = l + (h - l) / 2;
            if probe(mid).await {
                found = Some(mid);
                if mid == u32::MAX {
                    break;
                }
                l = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                h = mid - 1;
            }
        }
        return found;
    }
    Some(hi)
}

/// Binary-search the smallest `v` in `[lo, hi]` for which `probe(v)` is
/// true, assuming success is monotone non-decreasing in `v`.
async fn binary_search_min<F, Fut>(lo: u32, hi: u32, initial: Option<u32>, mut probe: F) -> Option<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    if hi < lo {
        return None;
    }
    if let Some(seed) = initial.filter(|s| *s >= lo && *s <= hi) {
        if probe(seed).await {
            // seed already works; see if anything smaller also works.
            let mut found = seed;
            let (mut l, mut h) = (lo, seed);
            while l < h {
                let mid = l + (h - l) / 2;
                if probe(mid).await {
                    found = mid;
                    h = mid;
                } else {
                    l = mid + 1;
                }
            }
            return Some(found);
        } else {
            // Monotone cutoff (§4.5 binary-search contract step 1): a
            // failed seed means nothing smaller can work either.
            return None;
        }
    }
    let (mut l, mut h) = (lo, hi);
    let mut found = None;
    while l <= h {
        let mid = l + (h - l) / 2;
        if probe(mid).await {
            found = Some(mid);
            if mid == 0 {
                break;
            }
            h = mid - 1;
        } else {
            l = mid + 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binary_search_max_finds_threshold() {
        // Succeeds for v <= 40.
        let found = binary_search_max(0, 100, None, |v| async move { v <= 40 }).await;
        assert_eq!(found, Some(40));
    }

    #[tokio::test]
    async fn binary_search_max_none_when_nothing_succeeds() {
        let found = binary_search_max(0, 100, None, |_| async move { false }).await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn binary_search_max_uses_initial_hint() {
        let mut calls = 0usize;
        let found = binary_search_max(0, 100, Some(40), |v| {
            calls += 1;
            async move { v <= 40 }
        })
        .await;
        assert_eq!(found, Some(40));
        assert!(calls <= 3, "expected the seed to short-circuit the search, got {calls} probes");
    }

    #[tokio::test]
    async fn binary_search_min_finds_threshold() {
        // Succeeds for v >= 17.
        let found = binary_search_min(0, 64, None, |v| async move { v >= 17 }).await;
        assert_eq!(found, Some(17));
    }

    #[tokio::test]
    async fn binary_search_min_none_when_nothing_succeeds() {
        let found = binary_search_min(0, 64, None, |_| async move { false }).await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn binary_search_max_returns_none_on_failed_seed_without_full_search() {
        // Seed fails; even though v <= 10 would succeed if searched fresh,
        // the monotone cutoff means we must not fall back to a full search.
        let mut calls = 0usize;
        let found = binary_search_max(0, 100, Some(40), |v| {
            calls += 1;
            async move { v <= 10 }
        })
        .await;
        assert_eq!(found, None);
        assert_eq!(calls, 1, "must return immediately after the failed seed probe");
    }

    #[tokio::test]
    async fn binary_search_min_returns_none_on_failed_seed_without_full_search() {
        let mut calls = 0usize;
        let found = binary_search_min(0, 64, Some(40), |v| {
            calls += 1;
            async move { v >= 50 }
        })
        .await;
        assert_eq!(found, None);
        assert_eq!(calls, 1, "must return immediately after the failed seed probe");
    }

    #[test]
    fn candidate_score_is_sum_of_throughputs() {
        let c = ContextCandidate {
            context_size: 4096,
            config: Config::new("/m.gguf"),
            prompt_tps: 10.0,
            generation_tps: 5.5,
        };
        assert_eq!(c.score(), 15.5);
    }

    /// S6 from the testable-properties scenarios: a 135M-parameter GGUF
    /// with `contextLength == 8192` yields exactly two benchmarks, at
    /// 4096 and 8192, with the known file-level metadata. Requires a real
    /// `llama-server` and the matching GGUF on disk, named by
    /// `LLAMA_SERVER_PATH` and `LLAMA_TEST_MODEL` respectively.
    #[tokio::test]
    #[ignore = "needs a real llama-server binary and GGUF fixture on disk"]
    async fn detection_shape_matches_known_small_model() {
        use crate::inspector::FileGgufReader;
        use crate::installation::Installation;
        use crate::http_client::ReqwestCompletionsClient;
        use std::path::PathBuf;

        let install_dir = PathBuf::from(
            std::env::var("LLAMA_SERVER_PATH").expect("set LLAMA_SERVER_PATH to an installation directory"),
        );
        let model_path = PathBuf::from(
            std::env::var("LLAMA_TEST_MODEL").expect("set LLAMA_TEST_MODEL to a SmolLM2-135M-Instruct-Q4_K_M.gguf path"),
        );
        let installation = Arc::new(Installation::detect(&install_dir).expect("llama-server/llama-cli found"));
        let engine = DetectionEngine::new(
            Arc::new(FileGgufReader),
            installation,
            Arc::new(ReqwestCompletionsClient::new()),
        );

        let result = engine.detect(&model_path).await.unwrap();
        assert_eq!(result.block_count, Some(30));
        assert_eq!(result.parameter_count, Some(134_515_008));
        assert_eq!(
            result.per_context.iter().map(|c| c.context_size).collect::<Vec<_>>(),
            vec![4096, 8192]
        );
        for candidate in &result.per_context {
            assert!(candidate.prompt_tps > 0.0);
            assert!(candidate.generation_tps > 0.0);
        }
    }
}
