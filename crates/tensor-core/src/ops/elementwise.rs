// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Element-wise arithmetic on same-shaped tensors.

use crate::{Tensor, TensorError};

fn check_same(op: &'static str, a: &Tensor, b: &Tensor) -> Result<(), TensorError> {
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            op,
            lhs: a.shape().clone(),
            rhs: b.shape().clone(),
        });
    }
    Ok(())
}

fn zip_with(
    op: &'static str,
    a: &Tensor,
    b: &Tensor,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Tensor, TensorError> {
    check_same(op, a, b)?;
    let data = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Tensor::from_vec(a.shape().clone(), data)
}

/// `a + b`.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    zip_with("add", a, b, |x, y| x + y)
}

/// `a - b`.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    zip_with("sub", a, b, |x, y| x - y)
}

/// `a * b` (Hadamard product).
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    zip_with("mul", a, b, |x, y| x * y)
}

/// `a * factor`.
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let mut out = a.clone();
    for v in out.as_mut_slice() {
        *v *= factor;
    }
    out
}

/// Accumulates `b` into `acc` in place.
///
/// This is the gradient-accumulation primitive: parameter gradients
/// from successive microbatches are summed with it.
///
/// # Errors
/// Returns [`TensorError::ShapeMismatch`] if the shapes differ.
pub fn add_assign(acc: &mut Tensor, b: &Tensor) -> Result<(), TensorError> {
    check_same("add_assign", acc, b)?;
    for (d, &s) in acc.as_mut_slice().iter_mut().zip(b.as_slice()) {
        *d += s;
    }
    Ok(())
}
