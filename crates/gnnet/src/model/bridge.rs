//! Tensor bridge: conversions between flat host buffers (`Vec<f32>`) and
//! burn tensors.
//!
//! Data sources build image and coordinate tensors from host buffers; the loss
//! reads coordinates and scalar terms back to the host.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{Result, TrainError};

/// Convert a flat row-major image buffer to a `[n, c, h, w]` tensor.
///
/// # Panics
/// Panics if the buffer length does not match the shape.
pub fn images_to_tensor<B: Backend>(
    flat: Vec<f32>,
    shape: [usize; 4],
    device: &B::Device,
) -> Tensor<B, 4> {
    let expected: usize = shape.iter().product();
    assert_eq!(
        flat.len(),
        expected,
        "image buffer has {} values, shape {shape:?} needs {expected}",
        flat.len()
    );
    Tensor::from_data(TensorData::new(flat, shape), device)
}

/// Convert flat `(x, y)` pairs to a `[n, m, 2]` coordinate tensor.
///
/// # Panics
/// Panics if the buffer length is not `n * m * 2`.
pub fn coords_to_tensor<B: Backend>(
    flat: Vec<f32>,
    n: usize,
    m: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    assert_eq!(
        flat.len(),
        n * m * 2,
        "coordinate buffer has {} values, expected {n}x{m}x2",
        flat.len()
    );
    Tensor::from_data(TensorData::new(flat, [n, m, 2]), device)
}

/// Read any float tensor back to the host as `f32` values (row-major).
pub fn tensor_to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::Tensor(format!("{e:?}")))
}

/// Extract a single f64 scalar from a one-element tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
