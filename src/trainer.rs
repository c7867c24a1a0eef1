//! Control-vector training: mean activation difference per axis
//!
//! For each emotion axis, run the base model (unsteered) over every
//! contrastive prompt pair, average the last-token residual-stream
//! activations of the positive and negative sides separately at each
//! configured layer, and take the difference of the means. The result is
//! one direction per layer pointing from the negative pole toward the
//! positive pole.
//!
//! Training is read-only with respect to the model: no gradients, no
//! weight updates, just forward passes.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::control::{ControlVector, ControlVectorBundle};
use crate::corpus::StatementCorpus;
use crate::dataset::{build_dataset, partition_axis, ContrastiveExample, EmotionAxis};
use crate::error::SteerError;
use crate::model::EmoModel;

/// Activation-capture seam between the trainer and the model.
///
/// Implemented by `EmoModel`; tests substitute a synthetic provider so the
/// mean-difference arithmetic is checked without loading weights.
pub trait HiddenStateProvider {
    /// Last-token activation at every configured layer for one prompt,
    /// as `(layer, direction)` pairs in ascending layer order.
    fn hidden_states(&self, prompt: &str) -> Result<Vec<(usize, Vec<f32>)>>;
}

impl HiddenStateProvider for EmoModel {
    fn hidden_states(&self, prompt: &str) -> Result<Vec<(usize, Vec<f32>)>> {
        EmoModel::hidden_states(self, prompt)
    }
}

/// Train one axis's control vector from its contrastive examples.
///
/// Zero examples is a hard error: a vector trained from nothing would
/// silently steer toward noise.
pub fn train_axis<P: HiddenStateProvider>(
    provider: &P,
    axis: &EmotionAxis,
    examples: &[&ContrastiveExample],
) -> Result<ControlVector> {
    if examples.is_empty() {
        return Err(SteerError::Training(format!(
            "no contrastive examples for axis `{}`",
            axis.name()
        ))
        .into());
    }

    let mut pos_sums: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
    let mut neg_sums: BTreeMap<usize, Vec<f32>> = BTreeMap::new();

    for (idx, example) in examples.iter().enumerate() {
        accumulate(&mut pos_sums, &provider.hidden_states(&example.positive)?)?;
        accumulate(&mut neg_sums, &provider.hidden_states(&example.negative)?)?;

        if (idx + 1) % 50 == 0 {
            info!(
                "Axis `{}`: {}/{} example pairs processed",
                axis.name(),
                idx + 1,
                examples.len()
            );
        }
    }

    let n = examples.len() as f32;
    let directions: BTreeMap<usize, Vec<f32>> = pos_sums
        .into_iter()
        .map(|(layer, pos)| {
            let neg = &neg_sums[&layer];
            let diff = pos
                .iter()
                .zip(neg)
                .map(|(p, m)| (p - m) / n)
                .collect::<Vec<f32>>();
            (layer, diff)
        })
        .collect();

    Ok(ControlVector::new(directions)?)
}

fn accumulate(sums: &mut BTreeMap<usize, Vec<f32>>, states: &[(usize, Vec<f32>)]) -> Result<()> {
    for (layer, state) in states {
        match sums.get_mut(layer) {
            None => {
                sums.insert(*layer, state.clone());
            }
            Some(acc) => {
                anyhow::ensure!(
                    acc.len() == state.len(),
                    "activation dimension changed mid-training at layer {layer}"
                );
                for (a, s) in acc.iter_mut().zip(state) {
                    *a += s;
                }
            }
        }
    }
    Ok(())
}

/// Train a full bundle: build the contrastive dataset once, then train
/// each axis from its partition. Axis order in the bundle follows `axes`.
pub fn train_bundle(
    model: &EmoModel,
    corpus: &StatementCorpus,
    axes: &[EmotionAxis],
) -> Result<ControlVectorBundle> {
    anyhow::ensure!(!corpus.is_empty(), "statement corpus is empty");

    let dataset = build_dataset(model, corpus.statements(), axes)?;
    if dataset.is_empty() {
        return Err(SteerError::Training(
            "corpus produced no contrastive examples (all statements too short?)".to_string(),
        )
        .into());
    }

    let mut entries = Vec::with_capacity(axes.len());
    for axis in axes {
        let examples = partition_axis(&dataset, axis);
        info!(
            "Training axis `{}` on {} example pairs",
            axis.name(),
            examples.len()
        );
        let vector = train_axis(model, axis, &examples)?;
        entries.push((axis.name(), vector));
    }

    Ok(ControlVectorBundle::new(entries)?)
}

/// Load a previously trained bundle from `bundle_path`, or train one from
/// the corpus and cache it there.
pub fn load_or_train(
    model: &EmoModel,
    corpus_path: &Path,
    bundle_path: &Path,
    axes: &[EmotionAxis],
) -> Result<ControlVectorBundle> {
    if bundle_path.exists() {
        info!("Loading cached control vectors from {}", bundle_path.display());
        return Ok(ControlVectorBundle::load(bundle_path)?);
    }

    info!("No cached vectors at {}, training", bundle_path.display());
    let corpus = StatementCorpus::load(corpus_path)?;
    let bundle = train_bundle(model, &corpus, axes)?;
    if let Some(parent) = bundle_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    bundle.save(bundle_path)?;
    info!("Saved control vectors to {}", bundle_path.display());
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::instruction_template;

    /// Synthetic provider: layer 4 activates [1, 0] for "happy" prompts,
    /// [0, 1] for "sad" prompts, and [0.5, 0.5] otherwise.
    struct LabelProvider;

    impl HiddenStateProvider for LabelProvider {
        fn hidden_states(&self, prompt: &str) -> Result<Vec<(usize, Vec<f32>)>> {
            let state = if prompt.contains("happy") {
                vec![1.0, 0.0]
            } else if prompt.contains("sad") {
                vec![0.0, 1.0]
            } else {
                vec![0.5, 0.5]
            };
            Ok(vec![(4, state.clone()), (5, state)])
        }
    }

    fn axis() -> EmotionAxis {
        EmotionAxis::new("happy", "sad")
    }

    fn example(suffix: &str) -> ContrastiveExample {
        ContrastiveExample {
            positive: instruction_template("happy", suffix),
            negative: instruction_template("sad", suffix),
        }
    }

    #[test]
    fn test_mean_difference_direction() {
        let examples = vec![example("the sky"), example("the sky is")];
        let refs: Vec<&ContrastiveExample> = examples.iter().collect();

        let vector = train_axis(&LabelProvider, &axis(), &refs).unwrap();
        // mean(pos) - mean(neg) = [1,0] - [0,1] at both layers.
        assert_eq!(vector.direction(4).unwrap(), &[1.0, -1.0]);
        assert_eq!(vector.direction(5).unwrap(), &[1.0, -1.0]);
        assert_eq!(vector.n_layers(), 2);
    }

    #[test]
    fn test_empty_examples_is_fatal() {
        let err = train_axis(&LabelProvider, &axis(), &[]).unwrap_err();
        let steer = err.downcast_ref::<SteerError>().unwrap();
        assert!(matches!(steer, SteerError::Training(_)));
    }

    #[test]
    fn test_training_is_deterministic() {
        let examples = vec![example("water boils"), example("water")];
        let refs: Vec<&ContrastiveExample> = examples.iter().collect();

        let first = train_axis(&LabelProvider, &axis(), &refs).unwrap();
        let second = train_axis(&LabelProvider, &axis(), &refs).unwrap();
        assert_eq!(first, second);
    }
}
