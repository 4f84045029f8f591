// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-feature operations that broadcast a `[H]` vector over `[.., H]`.

use crate::{Tensor, TensorError};

fn broadcast_last(
    op: &'static str,
    x: &Tensor,
    v: &Tensor,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Tensor, TensorError> {
    let h = v.num_elements();
    if v.shape().rank() != 1 || x.shape().last_dim() != Some(h) {
        return Err(TensorError::ShapeMismatch {
            op,
            lhs: x.shape().clone(),
            rhs: v.shape().clone(),
        });
    }
    let mut out = x.clone();
    if h > 0 {
        for row in out.as_mut_slice().chunks_exact_mut(h) {
            for (o, &w) in row.iter_mut().zip(v.as_slice()) {
                *o = f(*o, w);
            }
        }
    }
    Ok(out.with_requires_grad(false))
}

/// Multiplies every row of `x: [.., H]` by `v: [H]`.
pub fn mul_last_dim(x: &Tensor, v: &Tensor) -> Result<Tensor, TensorError> {
    broadcast_last("mul_last_dim", x, v, |a, b| a * b)
}

/// Adds `v: [H]` to every row of `x: [.., H]`.
pub fn add_last_dim(x: &Tensor, v: &Tensor) -> Result<Tensor, TensorError> {
    broadcast_last("add_last_dim", x, v, |a, b| a + b)
}
