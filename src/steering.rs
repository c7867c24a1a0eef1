//! Steering state: the per-layer bias installed into the forward pass
//!
//! [`ControlState`] is the explicit steering context the decoder consults.
//! It declares once, at construction, which layers accept an additive bias;
//! installing a [`ControlVector`] uploads one device tensor per layer, and
//! [`ControlState::reset`] returns the forward pass to the unmodified model.
//!
//! The state is deliberately not synchronized. It is owned by the
//! generation session, which holds a mutex across the whole
//! reset / compose / decode sequence (see `session`).

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Tensor};

use crate::control::ControlVector;
use crate::error::{SteerError, SteerResult};

/// Layers steered by default: the last 13 layers counting from the fifth
/// from the end, i.e. `n_layers-17 ..= n_layers-5`.
pub fn default_control_layers(n_layers: usize) -> BTreeSet<usize> {
    let lo = n_layers.saturating_sub(17);
    let hi = n_layers.saturating_sub(5);
    (lo..=hi).collect()
}

/// The interceptable-layer configuration plus the currently installed bias.
///
/// With no bias installed, `bias_for_layer` returns `None` for every layer
/// and the forward pass is bit-identical to the unmodified model.
#[derive(Debug)]
pub struct ControlState {
    /// Layers that accept an additive residual-stream bias.
    layers: BTreeSet<usize>,
    /// Installed bias, one tensor of shape (d_model,) per covered layer.
    active: Option<HashMap<usize, Tensor>>,
}

impl ControlState {
    /// Declare the interceptable layer set.
    pub fn new(layers: BTreeSet<usize>) -> Self {
        Self {
            layers,
            active: None,
        }
    }

    /// The configured layer set.
    pub fn layers(&self) -> &BTreeSet<usize> {
        &self.layers
    }

    /// Whether a bias is currently installed.
    pub fn is_set(&self) -> bool {
        self.active.is_some()
    }

    /// Install `vector` as the active bias.
    ///
    /// Every direction is uploaded to `device` in `dtype`. Fails if the
    /// vector references a layer outside the configured set; subsequent
    /// forward passes then still see the previous state.
    pub fn set_control(
        &mut self,
        vector: &ControlVector,
        device: &Device,
        dtype: DType,
    ) -> SteerResult<()> {
        for layer in vector.layers() {
            if !self.layers.contains(&layer) {
                return Err(SteerError::Config(format!(
                    "control vector targets layer {layer}, outside the configured set"
                )));
            }
        }
        let mut active = HashMap::with_capacity(vector.n_layers());
        for (layer, direction) in vector.iter() {
            let tensor = Tensor::new(direction, device)?.to_dtype(dtype)?;
            active.insert(layer, tensor);
        }
        self.active = Some(active);
        Ok(())
    }

    /// Clear the active bias. Idempotent; repeated calls are no-ops.
    pub fn reset(&mut self) {
        self.active = None;
    }

    /// Bias tensor for a layer, if one is installed there.
    ///
    /// Consulted by the decoder after each layer; shape (d_model,),
    /// broadcast over batch and sequence positions.
    pub fn bias_for_layer(&self, layer: usize) -> Option<&Tensor> {
        self.active.as_ref().and_then(|map| map.get(&layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn vector(layers: &[usize]) -> ControlVector {
        let directions: BTreeMap<usize, Vec<f32>> =
            layers.iter().map(|&l| (l, vec![1.0, -1.0])).collect();
        ControlVector::new(directions).unwrap()
    }

    #[test]
    fn test_default_layers_for_32_layer_model() {
        let layers = default_control_layers(32);
        assert_eq!(layers.len(), 13);
        assert!(layers.contains(&15));
        assert!(layers.contains(&27));
        assert!(!layers.contains(&14));
        assert!(!layers.contains(&28));
    }

    #[test]
    fn test_set_control_and_reset() {
        let mut state = ControlState::new([4, 5].into_iter().collect());
        assert!(!state.is_set());
        assert!(state.bias_for_layer(4).is_none());

        state
            .set_control(&vector(&[4, 5]), &Device::Cpu, DType::F32)
            .unwrap();
        assert!(state.is_set());
        assert!(state.bias_for_layer(4).is_some());
        assert!(state.bias_for_layer(5).is_some());
        assert!(state.bias_for_layer(6).is_none());

        state.reset();
        assert!(!state.is_set());
        assert!(state.bias_for_layer(4).is_none());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut state = ControlState::new([4].into_iter().collect());
        state
            .set_control(&vector(&[4]), &Device::Cpu, DType::F32)
            .unwrap();

        state.reset();
        state.reset();
        assert!(!state.is_set());
        assert!(state.bias_for_layer(4).is_none());
    }

    #[test]
    fn test_unconfigured_layer_rejected() {
        let mut state = ControlState::new([4, 5].into_iter().collect());
        let err = state
            .set_control(&vector(&[4, 9]), &Device::Cpu, DType::F32)
            .unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));
        // Failed install leaves the previous (empty) state untouched.
        assert!(!state.is_set());
    }
}
