//! Error taxonomy for emosteer-rs.

/// Errors surfaced by the steering core.
///
/// Model loading, tokenizer, and device failures are propagated as
/// `anyhow::Error` at their call sites; this enum covers the failures
/// that have a defined contract: configuration mistakes, bundle/request
/// mismatches, and degenerate training inputs.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// A control vector references a layer outside the configured set,
    /// or per-layer directions disagree on dimension or layer set.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request weights do not align with the loaded bundle's axes.
    #[error("bundle mismatch: {0}")]
    BundleMismatch(String),

    /// Training produced no usable data (empty corpus, zero examples
    /// for an axis). Never silently yields an all-zero vector.
    #[error("training error: {0}")]
    Training(String),

    /// Tensor operation failure (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// I/O error reading or writing the bundle or corpus.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Bundle or corpus (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result alias for steering-core operations.
pub type SteerResult<T> = std::result::Result<T, SteerError>;
