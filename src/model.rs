//! Model wrapper: tokenizer, device selection, and greedy decoding
//!
//! [`EmoModel`] wraps a decoder backend behind the [`EmoBackend`] trait and
//! owns the steering [`ControlState`]. It exposes exactly what the training
//! pipeline and the generation session need: tokenize/detokenize, per-layer
//! activation capture, and greedy autoregressive decoding with the control
//! bias applied.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::control::ControlVector;
use crate::dataset::TokenCodec;
use crate::error::SteerResult;
use crate::forward_mistral::EmoMistral;
use crate::kv_cache::KvCache;
use crate::steering::{default_control_layers, ControlState};

/// Decoder backend: the capabilities the steering pipeline needs from a
/// model architecture. Implemented by [`EmoMistral`]; adding another
/// LLaMA-family architecture means implementing this trait.
pub trait EmoBackend: Send {
    /// Number of decoder layers.
    fn n_layers(&self) -> usize;
    /// Residual-stream width.
    fn d_model(&self) -> usize;
    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Unsteered full pass capturing the last-token residual stream after
    /// every layer, as f32 tensors of shape `(d_model,)`.
    fn capture_hidden(&self, input_ids: &Tensor) -> Result<Vec<Tensor>>;

    /// Fresh KV-cache sized for this model.
    fn new_kv_cache(&self) -> KvCache;

    /// One decode step (prompt chunk or single token), appending to the
    /// cache and applying any installed control bias. Returns f32 logits
    /// of shape `(vocab,)` for the final position.
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        cache: &mut KvCache,
        control: &ControlState,
    ) -> Result<Tensor>;
}

/// Decoding parameters for one generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    /// Hard cap on generated tokens.
    pub max_new_tokens: usize,
    /// Penalty applied to tokens already present in the sequence.
    pub repetition_penalty: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            repetition_penalty: 1.2,
        }
    }
}

/// Base model plus tokenizer plus steering state.
pub struct EmoModel {
    backend: Box<dyn EmoBackend>,
    tokenizer: Tokenizer,
    control: ControlState,
    device: Device,
    dtype: DType,
    model_id: String,
}

impl EmoModel {
    /// Load a model from HuggingFace (CUDA if available, else CPU).
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None, None)
    }

    /// Load with explicit device choice and control-layer set.
    ///
    /// `force_cpu = Some(true)` skips CUDA detection. `control_layers =
    /// None` uses the default set (see `steering::default_control_layers`).
    pub fn from_pretrained_with_device(
        model_id: &str,
        force_cpu: Option<bool>,
        control_layers: Option<BTreeSet<usize>>,
    ) -> Result<Self> {
        let (device, dtype) = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = EmoMistral::load(model_id, &device, dtype)?;
        let control = ControlState::new(
            control_layers.unwrap_or_else(|| default_control_layers(backend.n_layers())),
        );
        info!(
            "Steering {} of {} layers",
            control.layers().len(),
            backend.n_layers()
        );

        Ok(Self {
            backend: Box::new(backend),
            tokenizer,
            control,
            device,
            dtype,
            model_id: model_id.to_string(),
        })
    }

    /// Assemble a model from an already-built backend and tokenizer.
    ///
    /// This is the seam for alternate `EmoBackend` implementations and for
    /// driving the generation pipeline without downloading weights.
    pub fn from_parts(
        backend: Box<dyn EmoBackend>,
        tokenizer: Tokenizer,
        device: Device,
        dtype: DType,
        control_layers: Option<BTreeSet<usize>>,
    ) -> Self {
        let control = ControlState::new(
            control_layers.unwrap_or_else(|| default_control_layers(backend.n_layers())),
        );
        Self {
            backend,
            tokenizer,
            control,
            device,
            dtype,
            model_id: "(custom backend)".to_string(),
        }
    }

    /// The model ID this wrapper was loaded from.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Number of decoder layers.
    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    /// Residual-stream width.
    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    /// The configured interceptable layer set.
    pub fn control_layers(&self) -> &BTreeSet<usize> {
        self.control.layers()
    }

    /// Install a control vector as the active decoding bias.
    pub fn set_control(&mut self, vector: &ControlVector) -> SteerResult<()> {
        self.control.set_control(vector, &self.device, self.dtype)
    }

    /// Clear the active bias; subsequent decoding matches the base model.
    pub fn reset(&mut self) {
        self.control.reset();
    }

    /// Whether a bias is currently installed.
    pub fn is_steered(&self) -> bool {
        self.control.is_set()
    }

    /// End-of-sequence token ID, from the tokenizer's special tokens.
    pub fn eos_token_id(&self) -> Option<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        vocab
            .get("</s>")
            .or_else(|| vocab.get("<|endoftext|>"))
            .or_else(|| vocab.get("<|im_end|>"))
            .copied()
    }

    /// Last-token residual-stream activation at every configured control
    /// layer, for one prompt. Unsteered, no gradients, deterministic.
    pub fn hidden_states(&self, prompt: &str) -> Result<Vec<(usize, Vec<f32>)>> {
        let ids = self.encode(prompt)?;
        let input = Tensor::new(&ids[..], &self.device)?.unsqueeze(0)?;
        let captured = self.backend.capture_hidden(&input)?;

        let mut out = Vec::with_capacity(self.control.layers().len());
        for &layer in self.control.layers() {
            let tensor = captured
                .get(layer)
                .with_context(|| format!("layer {layer} missing from capture"))?;
            out.push((layer, tensor.to_vec1()?));
        }
        Ok(out)
    }

    /// Greedy-decode a continuation of `prompt` under the installed bias.
    ///
    /// Deterministic: argmax sampling with a fixed tie-break, a repetition
    /// penalty over the full context, and a hard token budget. Stops at
    /// the EOS token or the budget, whichever comes first. Returns the
    /// full detokenized sequence including the prompt.
    pub fn generate(&self, prompt: &str, settings: &GenerationSettings) -> Result<String> {
        let prompt_ids = self.encode(prompt)?;
        anyhow::ensure!(!prompt_ids.is_empty(), "prompt tokenized to nothing");
        let eos = self.eos_token_id();

        let mut cache = self.backend.new_kv_cache();
        let mut tokens = prompt_ids.clone();

        // Process the whole prompt, then one token at a time.
        let prompt_tensor = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let mut logits = self
            .backend
            .forward_with_cache(&prompt_tensor, &mut cache, &self.control)?;

        for step in 0..settings.max_new_tokens {
            let next = pick_next_token(&logits, &tokens, settings.repetition_penalty)?;
            if eos == Some(next) {
                break;
            }
            tokens.push(next);

            // The budget is spent; the forward for the next position would
            // produce logits nothing consumes.
            if step + 1 == settings.max_new_tokens {
                break;
            }

            let step_input = Tensor::new(&[next], &self.device)?.unsqueeze(0)?;
            logits = self
                .backend
                .forward_with_cache(&step_input, &mut cache, &self.control)?;
        }

        self.decode(&tokens)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }
}

impl TokenCodec for EmoModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Self::encode(self, text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Self::decode(self, ids)
    }
}

/// Argmax over logits after applying the repetition penalty.
///
/// Each distinct token in `context` is penalized exactly once, however
/// often it occurs: positive logits are divided by the penalty, negative
/// logits multiplied by it. Ties break toward the lower token id, so
/// decoding is reproducible across runs.
fn pick_next_token(logits: &Tensor, context: &[u32], repetition_penalty: f32) -> Result<u32> {
    let mut logits_vec: Vec<f32> = logits.to_vec1()?;
    anyhow::ensure!(!logits_vec.is_empty(), "empty logits");

    if repetition_penalty != 1.0 {
        let mut seen = context.to_vec();
        seen.sort_unstable();
        seen.dedup();
        for token in seen {
            if let Some(logit) = logits_vec.get_mut(token as usize) {
                if *logit > 0.0 {
                    *logit /= repetition_penalty;
                } else {
                    *logit *= repetition_penalty;
                }
            }
        }
    }

    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &val) in logits_vec.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best_idx = idx;
        }
    }
    Ok(best_idx as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pick_next_token_argmax() {
        let l = logits(&[0.1, 2.0, 0.5]);
        assert_eq!(pick_next_token(&l, &[], 1.0).unwrap(), 1);
    }

    #[test]
    fn test_pick_next_token_tie_breaks_low() {
        let l = logits(&[1.0, 1.0, 0.0]);
        assert_eq!(pick_next_token(&l, &[], 1.0).unwrap(), 0);
    }

    #[test]
    fn test_repetition_penalty_demotes_seen_token() {
        // Token 1 leads, but has been generated already; penalty drops it
        // below token 0.
        let l = logits(&[1.9, 2.0, 0.5]);
        assert_eq!(pick_next_token(&l, &[1], 1.2).unwrap(), 0);
    }

    #[test]
    fn test_repetition_penalty_counts_distinct_tokens_once() {
        let l = logits(&[1.5, 2.0]);
        // Token 1 occurs twice but is penalized once: 2.0 / 1.2 = 1.667
        // still beats 1.5. Compounding per occurrence (2.0 / 1.44) would
        // flip the argmax.
        assert_eq!(pick_next_token(&l, &[1, 1], 1.2).unwrap(), 1);
    }

    #[test]
    fn test_repetition_penalty_amplifies_negative_logit() {
        let l = logits(&[-1.0, -0.9]);
        // Token 1 was seen: -0.9 * 1.2 = -1.08 < -1.0, so token 0 wins.
        assert_eq!(pick_next_token(&l, &[1], 1.2).unwrap(), 0);
    }

    #[test]
    fn test_default_settings_match_service_contract() {
        let settings = GenerationSettings::default();
        assert_eq!(settings.max_new_tokens, 128);
        assert!((settings.repetition_penalty - 1.2).abs() < 1e-6);
    }
}
