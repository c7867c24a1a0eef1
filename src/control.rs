//! Control vectors: per-layer directions in activation space
//!
//! A [`ControlVector`] holds one direction per intercepted layer. Adding a
//! direction to the residual stream at its layer biases generation toward
//! the semantic pole the direction was trained on. Vectors support scalar
//! multiplication and pairwise addition so per-axis vectors can be combined
//! into a single weighted composition at request time.
//!
//! [`ControlVectorBundle`] is the on-disk form: one JSON file mapping axis
//! names to vectors, with a declared axis order that request weights are
//! matched against positionally.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SteerError, SteerResult};

/// An immutable per-layer direction in activation space.
///
/// Directions are stored as host-memory f32 vectors keyed by layer index,
/// so composition and persistence need no device. They are uploaded to
/// device tensors only when installed (see `steering::ControlState`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlVector {
    /// Layer index -> direction of length d_model.
    directions: BTreeMap<usize, Vec<f32>>,
}

impl ControlVector {
    /// Create a vector from per-layer directions.
    ///
    /// Fails if the map is empty or the directions disagree on dimension.
    pub fn new(directions: BTreeMap<usize, Vec<f32>>) -> SteerResult<Self> {
        let mut dims = directions.values().map(std::vec::Vec::len);
        let first = dims
            .next()
            .ok_or_else(|| SteerError::Config("control vector has no layers".to_string()))?;
        if first == 0 {
            return Err(SteerError::Config(
                "control vector direction has zero dimension".to_string(),
            ));
        }
        if dims.any(|d| d != first) {
            return Err(SteerError::Config(
                "control vector directions disagree on hidden dimension".to_string(),
            ));
        }
        Ok(Self { directions })
    }

    /// Layer indices this vector covers, in ascending order.
    pub fn layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.directions.keys().copied()
    }

    /// Hidden dimension of the directions.
    pub fn d_model(&self) -> usize {
        self.directions.values().next().map_or(0, std::vec::Vec::len)
    }

    /// Number of layers covered.
    pub fn n_layers(&self) -> usize {
        self.directions.len()
    }

    /// Direction for a specific layer, if present.
    pub fn direction(&self, layer: usize) -> Option<&[f32]> {
        self.directions.get(&layer).map(std::vec::Vec::as_slice)
    }

    /// Iterate over (layer, direction) pairs in ascending layer order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f32])> {
        self.directions.iter().map(|(&l, d)| (l, d.as_slice()))
    }

    /// New vector with every direction multiplied by `weight`.
    pub fn scale(&self, weight: f32) -> Self {
        let directions = self
            .directions
            .iter()
            .map(|(&layer, dir)| (layer, dir.iter().map(|x| x * weight).collect()))
            .collect();
        Self { directions }
    }

    /// New vector with per-layer directions summed.
    ///
    /// Requires identical layer sets; a vector trained for different
    /// layers cannot be meaningfully combined.
    pub fn add(&self, other: &Self) -> SteerResult<Self> {
        if !self.directions.keys().eq(other.directions.keys()) {
            return Err(SteerError::Config(
                "cannot add control vectors with different layer sets".to_string(),
            ));
        }
        if self.d_model() != other.d_model() {
            return Err(SteerError::Config(format!(
                "cannot add control vectors with dimensions {} and {}",
                self.d_model(),
                other.d_model()
            )));
        }
        let directions = self
            .directions
            .iter()
            .map(|(&layer, dir)| {
                let other_dir = &other.directions[&layer];
                let sum = dir.iter().zip(other_dir).map(|(a, b)| a + b).collect();
                (layer, sum)
            })
            .collect();
        Ok(Self { directions })
    }
}

/// A named set of trained control vectors, persisted as a single JSON file.
///
/// `axes` declares the axis order; request weights are matched against it
/// positionally. The bundle is written once by the training pipeline and
/// loaded read-only at service startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlVectorBundle {
    /// Axis names in their declared order (e.g. "happy_sad").
    axes: Vec<String>,
    /// Axis name -> trained vector.
    vectors: BTreeMap<String, ControlVector>,
}

impl ControlVectorBundle {
    /// Build a bundle from (axis name, vector) pairs, preserving order.
    pub fn new(entries: Vec<(String, ControlVector)>) -> SteerResult<Self> {
        let axes: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();
        let vectors: BTreeMap<String, ControlVector> = entries.into_iter().collect();
        if axes.len() != vectors.len() {
            return Err(SteerError::Config(
                "duplicate axis name in bundle".to_string(),
            ));
        }
        Ok(Self { axes, vectors })
    }

    /// Axis names in declared order.
    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    /// Number of axes.
    pub fn n_axes(&self) -> usize {
        self.axes.len()
    }

    /// Vector for a named axis.
    pub fn get(&self, axis: &str) -> Option<&ControlVector> {
        self.vectors.get(axis)
    }

    /// Write the bundle to a JSON file.
    pub fn save(&self, path: &Path) -> SteerResult<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a bundle from a JSON file.
    pub fn load(path: &Path) -> SteerResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let bundle: Self = serde_json::from_str(&json)?;
        for axis in &bundle.axes {
            if !bundle.vectors.contains_key(axis) {
                return Err(SteerError::Config(format!(
                    "bundle declares axis `{axis}` but has no vector for it"
                )));
            }
        }
        Ok(bundle)
    }

    /// Combine per-axis vectors into one, weighted positionally.
    ///
    /// Weights are matched against the declared axis order. A zero weight
    /// still contributes (a zero vector); all-zero weights yield an
    /// all-zero composition, behaviorally equivalent to no steering.
    ///
    /// A weight count that differs from the axis count is an error rather
    /// than a silent partial composition.
    pub fn compose(&self, weights: &[f32]) -> SteerResult<ControlVector> {
        if weights.len() != self.axes.len() {
            return Err(SteerError::BundleMismatch(format!(
                "{} weights supplied but bundle has {} axes ({})",
                weights.len(),
                self.axes.len(),
                self.axes.join(", ")
            )));
        }
        let mut combined: Option<ControlVector> = None;
        for (axis, &w) in self.axes.iter().zip(weights) {
            let scaled = self.vectors[axis].scale(w);
            combined = Some(match combined {
                None => scaled,
                Some(acc) => acc.add(&scaled)?,
            });
        }
        combined.ok_or_else(|| SteerError::BundleMismatch("bundle has no axes".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(layers: &[usize], fill: f32) -> ControlVector {
        let directions = layers
            .iter()
            .map(|&l| (l, vec![fill, fill * 2.0, fill * 3.0]))
            .collect();
        ControlVector::new(directions).unwrap()
    }

    #[test]
    fn test_scale_composes_multiplicatively() {
        let a = vector(&[4, 5], 1.5);
        assert_eq!(a.scale(2.0).scale(3.0), a.scale(6.0));
    }

    #[test]
    fn test_add_commutes() {
        let a = vector(&[4, 5], 1.0);
        let b = vector(&[4, 5], -0.5);
        assert_eq!(a.add(&b).unwrap(), b.add(&a).unwrap());
    }

    #[test]
    fn test_scale_zero_is_all_zero() {
        let a = vector(&[4, 5], 3.25);
        let zeroed = a.scale(0.0);
        for (_, dir) in zeroed.iter() {
            assert!(dir.iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn test_add_rejects_different_layer_sets() {
        let a = vector(&[4, 5], 1.0);
        let b = vector(&[4, 6], 1.0);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_empty_vector_rejected() {
        assert!(ControlVector::new(BTreeMap::new()).is_err());
    }

    #[test]
    fn test_mismatched_dims_rejected() {
        let mut directions = BTreeMap::new();
        directions.insert(4, vec![1.0, 2.0]);
        directions.insert(5, vec![1.0, 2.0, 3.0]);
        assert!(ControlVector::new(directions).is_err());
    }

    #[test]
    fn test_compose_weight_count_mismatch_errors() {
        let bundle = ControlVectorBundle::new(vec![
            ("happy_sad".to_string(), vector(&[4], 1.0)),
            ("angry_calm".to_string(), vector(&[4], 2.0)),
        ])
        .unwrap();

        let err = bundle.compose(&[1.0]).unwrap_err();
        assert!(matches!(err, SteerError::BundleMismatch(_)));
    }

    #[test]
    fn test_compose_is_deterministic() {
        let bundle = ControlVectorBundle::new(vec![
            ("happy_sad".to_string(), vector(&[4, 5], 1.0)),
            ("angry_calm".to_string(), vector(&[4, 5], -2.0)),
        ])
        .unwrap();

        let first = bundle.compose(&[-1.2, 0.3]).unwrap();
        let second = bundle.compose(&[-1.2, 0.3]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compose_matches_manual_combination() {
        let a = vector(&[4], 1.0);
        let b = vector(&[4], 2.0);
        let bundle = ControlVectorBundle::new(vec![
            ("happy_sad".to_string(), a.clone()),
            ("angry_calm".to_string(), b.clone()),
        ])
        .unwrap();

        let composed = bundle.compose(&[0.5, -1.0]).unwrap();
        let manual = a.scale(0.5).add(&b.scale(-1.0)).unwrap();
        assert_eq!(composed, manual);
    }
}
