// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // EmoModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! emosteer-rs: emotionally steered text generation
//!
//! Trains per-emotion control vectors (mean activation differences over a
//! contrastive dataset) and serves generation steered by adding a weighted
//! combination of those vectors to the residual stream at a band of middle
//! layers.
//!
//! ## Architecture
//!
//! - `control`: Control vectors and the persisted per-axis bundle
//! - `steering`: Layer configuration and the active decoding bias
//! - `dataset`: Contrastive prompt-pair construction per emotion axis
//! - `corpus`: Seed statement loading
//! - `trainer`: Mean-difference training over captured activations
//! - `model`: Model wrapper (tokenizer, device selection, greedy decoding)
//! - `forward_mistral`: Mistral forward pass with residual-stream bias injection
//! - `kv_cache`: KV-cache for efficient autoregressive generation
//! - `masks`: Attention mask utilities (causal masks, generation masks)
//! - `session`: Request lifecycle (reset, compose, install, decode, extract)
//! - `server`: POST /generate HTTP layer
//! - `error`: Service error types

pub mod control;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod forward_mistral;
pub mod kv_cache;
pub mod masks;
pub mod model;
pub mod server;
pub mod session;
pub mod steering;
pub mod trainer;

pub use control::{ControlVector, ControlVectorBundle};
pub use corpus::StatementCorpus;
pub use dataset::{
    build_dataset, default_axes, instruction_template, partition_axis, ContrastiveExample,
    EmotionAxis, TokenCodec, ASST_TAG, USER_TAG,
};
pub use error::{SteerError, SteerResult};
pub use forward_mistral::{EmoMistral, MistralConfig};
pub use kv_cache::KvCache;
pub use masks::{causal_mask, generation_mask};
pub use model::{EmoBackend, EmoModel, GenerationSettings};
pub use server::{AxisWeights, GenerateRequest};
pub use session::{describe_weights, extract_reply, GenerationSession};
pub use steering::{default_control_layers, ControlState};
pub use trainer::{load_or_train, train_axis, train_bundle, HiddenStateProvider};
