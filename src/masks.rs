//! Attention mask construction
//!
//! Additive masks: `0.0` where a position may attend, `-inf` where it may
//! not. Built per forward pass; this service decodes one request at a time,
//! so prompt-shaped masks are not worth caching across requests.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Causal mask of shape `[1, 1, seq_len, seq_len]`: position `i` attends
/// to positions `j <= i`.
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;
    Ok(mask)
}

/// Mask for decoding with a KV-cache, shape `[1, 1, new_seq_len, total_seq_len]`.
///
/// New token `i` (absolute position `start_pos + i`) attends to every
/// cached position and to new positions up to itself. For the common
/// single-token step this is all zeros.
pub fn generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_seq_len)
                .map(move |j| if j <= visible_up_to { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    let mask =
        Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_values() {
        let mask = causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0 sees only itself; row 2 sees everything.
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);
        assert_eq!(&data[6..9], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_generation_mask_single_token_all_visible() {
        let mask = generation_mask(1, 5, 4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 1, 5]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_generation_mask_multi_token() {
        // 2 new tokens after 3 cached positions.
        let mask = generation_mask(2, 5, 3, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // First new token (pos 3) cannot see pos 4.
        assert_eq!(&data[0..4], &[0.0, 0.0, 0.0, 0.0]);
        assert!(data[4].is_infinite() && data[4] < 0.0);
        // Second new token (pos 4) sees everything.
        assert!(data[5..10].iter().all(|&v| v == 0.0));
    }
}
