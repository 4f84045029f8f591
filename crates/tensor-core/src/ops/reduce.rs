// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reductions.

use crate::{Shape, Tensor, TensorError};

/// Sum of all elements.
pub fn sum(a: &Tensor) -> f32 {
    a.as_slice().iter().sum()
}

/// Mean of all elements (`0.0` for an empty tensor).
pub fn mean(a: &Tensor) -> f32 {
    let n = a.num_elements();
    if n == 0 {
        0.0
    } else {
        sum(a) / n as f32
    }
}

/// Sums every leading position into a vector over the last dimension.
///
/// For `a: [.., H]` returns `[H]`. This reduces per-feature gradients
/// over batch and sequence positions.
///
/// # Errors
/// Fails for rank-0 input.
pub fn sum_to_last_dim(a: &Tensor) -> Result<Tensor, TensorError> {
    let h = a.shape().last_dim().ok_or_else(|| TensorError::ShapeMismatch {
        op: "sum_to_last_dim",
        lhs: a.shape().clone(),
        rhs: Shape::vector(0),
    })?;
    let mut out = vec![0.0f32; h];
    if h > 0 {
        for row in a.as_slice().chunks_exact(h) {
            for (o, &v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
    }
    Tensor::from_vec(Shape::vector(h), out)
}
