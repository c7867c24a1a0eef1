//! Generation session: one steered request at a time
//!
//! [`GenerationSession`] owns the model behind a mutex and runs the full
//! request lifecycle under the lock: reset any previous bias, compose the
//! bundle with the request weights, install the composition, greedy-decode,
//! extract the reply. Requests therefore serialize; the steering state can
//! never leak from one request into the next.

use std::sync::Mutex;

use anyhow::Result;
use tracing::info;

use crate::control::ControlVectorBundle;
use crate::dataset::ASST_TAG;
use crate::model::{EmoModel, GenerationSettings};

/// Model plus trained bundle, shared across request handlers.
pub struct GenerationSession {
    model: Mutex<EmoModel>,
    bundle: ControlVectorBundle,
    settings: GenerationSettings,
}

impl GenerationSession {
    /// Build a session with the default decoding settings.
    pub fn new(model: EmoModel, bundle: ControlVectorBundle) -> Self {
        Self::with_settings(model, bundle, GenerationSettings::default())
    }

    /// Build a session with explicit decoding settings.
    pub fn with_settings(
        model: EmoModel,
        bundle: ControlVectorBundle,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            bundle,
            settings,
        }
    }

    /// The loaded bundle (axis order, vectors).
    pub fn bundle(&self) -> &ControlVectorBundle {
        &self.bundle
    }

    /// Run one steered generation.
    ///
    /// `weights` are matched positionally against the bundle's axis order;
    /// a count mismatch fails before the model is touched. The returned
    /// text is the reply only, with the prompt and instruction markers
    /// stripped.
    pub fn generate(&self, prompt: &str, weights: &[f32]) -> Result<String> {
        let composed = self.bundle.compose(weights)?;
        info!(
            "Steering: {}",
            describe_weights(self.bundle.axes(), weights)
        );

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("generation session poisoned by an earlier panic"))?;

        model.reset();
        model.set_control(&composed)?;
        let full = model.generate(prompt, &self.settings)?;
        model.reset();

        Ok(extract_reply(&full).to_string())
    }
}

/// The reply portion of a decoded sequence: everything after the last
/// instruction-close marker.
pub fn extract_reply(text: &str) -> &str {
    match text.rfind(ASST_TAG) {
        Some(pos) => text[pos + ASST_TAG.len()..].trim(),
        None => text.trim(),
    }
}

/// Human-readable summary of a weight assignment, e.g.
/// "very happy, a little calm, extremely disgusted".
///
/// The sign of each weight picks the pole (positive weight, first pole);
/// its magnitude picks an intensity adverb. Zero-weight axes are omitted.
/// Axis names are `pos_neg` pairs, so the pole labels come from splitting
/// on the underscore.
pub fn describe_weights(axes: &[String], weights: &[f32]) -> String {
    axes.iter()
        .zip(weights)
        .filter(|&(_, &w)| w != 0.0)
        .map(|(axis, &w)| {
            let (positive, negative) = axis.split_once('_').unwrap_or((axis.as_str(), ""));
            let pole = if w > 0.0 { positive } else { negative };
            match intensity(w.abs()) {
                "" => pole.to_string(),
                adverb => format!("{adverb} {pole}"),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn intensity(magnitude: f32) -> &'static str {
    if magnitude <= 0.3 {
        "a little"
    } else if magnitude <= 0.7 {
        ""
    } else if magnitude <= 1.0 {
        "very"
    } else {
        "extremely"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> Vec<String> {
        vec![
            "happy_sad".to_string(),
            "angry_calm".to_string(),
            "disgusted_interested".to_string(),
        ]
    }

    #[test]
    fn test_extract_reply_after_last_marker() {
        let text = "[INST] be brief [/INST] sure. [INST] again [/INST]  final answer ";
        assert_eq!(extract_reply(text), "final answer");
    }

    #[test]
    fn test_extract_reply_without_marker() {
        assert_eq!(extract_reply("  bare text  "), "bare text");
    }

    #[test]
    fn test_describe_weights_poles_and_intensity() {
        let described = describe_weights(&axes(), &[0.9, -0.2, 1.5]);
        assert_eq!(described, "very happy, a little calm, extremely disgusted");
    }

    #[test]
    fn test_describe_weights_mid_range_has_no_adverb() {
        let described = describe_weights(&axes(), &[0.5, -0.5, 0.4]);
        assert_eq!(described, "happy, calm, disgusted");
    }

    #[test]
    fn test_describe_weights_skips_zero_axes() {
        let described = describe_weights(&axes(), &[0.0, -0.2, 0.0]);
        assert_eq!(described, "a little calm");

        assert_eq!(describe_weights(&axes(), &[0.0, 0.0, 0.0]), "");
    }
}
