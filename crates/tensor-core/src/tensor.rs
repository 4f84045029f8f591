// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Dense `f32` tensor with a gradient-requirement flag.

use crate::{DType, Shape, TensorError};

/// An owned, contiguous, row-major `f32` tensor.
///
/// `requires_grad` is metadata only: it records whether the producing
/// computation tracks gradients, which is what boundary signatures and
/// transfer workers need to know. Gradient bookkeeping itself lives in
/// the tape of the `model-ir` crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
    requires_grad: bool,
}

impl Tensor {
    /// Creates a zero-filled tensor.
    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    /// Creates a tensor filled with ones.
    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    /// Creates a tensor with every element set to `value`.
    pub fn full(shape: Shape, value: f32) -> Self {
        let n = shape.num_elements();
        Self {
            shape,
            data: vec![value; n],
            requires_grad: false,
        }
    }

    /// Creates a rank-0 tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::full(Shape::scalar(), value)
    }

    /// Wraps an existing buffer.
    ///
    /// # Errors
    /// Returns [`TensorError::BufferSizeMismatch`] if `data.len()` does not
    /// match the shape's element count.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = shape.num_elements();
        if data.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            data,
            requires_grad: false,
        })
    }

    /// Decodes little-endian `f32` bytes.
    pub fn from_le_bytes(shape: Shape, bytes: &[u8]) -> Result<Self, TensorError> {
        let width = DType::F32.size_bytes();
        let expected = shape.num_elements() * width;
        if bytes.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected: shape.num_elements(),
                actual: bytes.len() / width,
            });
        }
        let data = bytes
            .chunks_exact(width)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_vec(shape, data)
    }

    /// Decodes little-endian bytes stored as `dtype`, widening to `f32`.
    pub fn decode_le(shape: Shape, dtype: DType, bytes: &[u8]) -> Result<Self, TensorError> {
        match dtype {
            DType::F32 => Self::from_le_bytes(shape, bytes),
            DType::BF16 => {
                if bytes.len() != shape.num_elements() * dtype.size_bytes() {
                    return Err(TensorError::BufferSizeMismatch {
                        expected: shape.num_elements(),
                        actual: bytes.len() / dtype.size_bytes(),
                    });
                }
                // bf16 is the upper half of an f32.
                let data = bytes
                    .chunks_exact(2)
                    .map(|c| f32::from_bits(u32::from(u16::from_le_bytes([c[0], c[1]])) << 16))
                    .collect();
                Self::from_vec(shape, data)
            }
            DType::F16 => Err(TensorError::UnsupportedDType {
                op: "decode_le",
                dtype,
            }),
        }
    }

    /// Encodes the elements as little-endian `f32` bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Returns the shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Compute dtype; always `F32`.
    pub fn dtype(&self) -> DType {
        DType::F32
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Size of the element buffer in bytes.
    pub fn size_bytes(&self) -> usize {
        self.shape.size_bytes(DType::F32)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Returns the tensor with the gradient-requirement flag replaced.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Sets the gradient-requirement flag in place.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Returns the single element of a one-element tensor.
    pub fn item(&self) -> Result<f32, TensorError> {
        match self.data.as_slice() {
            [v] => Ok(*v),
            _ => Err(TensorError::ShapeMismatch {
                op: "item",
                lhs: self.shape.clone(),
                rhs: Shape::scalar(),
            }),
        }
    }

    /// Returns a tensor of the same shape filled with `value`.
    pub fn full_like(&self, value: f32) -> Self {
        Self::full(self.shape.clone(), value)
    }

    /// Splits along the leading dimension into chunks of `chunk` rows.
    ///
    /// The final chunk holds the remainder when the leading dimension is
    /// not a multiple of `chunk`. The flag is preserved on every chunk.
    ///
    /// # Errors
    /// Fails for rank-0 tensors, an empty leading dimension, or `chunk == 0`.
    pub fn split_batch(&self, chunk: usize) -> Result<Vec<Tensor>, TensorError> {
        let rows = self.shape.batch_size().ok_or_else(|| TensorError::BatchDim {
            op: "split_batch",
            detail: "cannot split a scalar".into(),
        })?;
        if chunk == 0 {
            return Err(TensorError::BatchDim {
                op: "split_batch",
                detail: "chunk size must be positive".into(),
            });
        }
        if rows == 0 {
            return Err(TensorError::BatchDim {
                op: "split_batch",
                detail: "leading dimension is empty".into(),
            });
        }

        let row_len = self.shape.row_len();
        let mut parts = Vec::with_capacity(rows.div_ceil(chunk));
        let mut start = 0;
        while start < rows {
            let take = chunk.min(rows - start);
            let data = self.data[start * row_len..(start + take) * row_len].to_vec();
            parts.push(Tensor {
                shape: self.shape.with_dim(0, take),
                data,
                requires_grad: self.requires_grad,
            });
            start += take;
        }
        Ok(parts)
    }

    /// Concatenates tensors along the leading dimension.
    ///
    /// All parts must agree on every dimension except the first.
    pub fn concat_batch(parts: &[Tensor]) -> Result<Tensor, TensorError> {
        let first = parts.first().ok_or_else(|| TensorError::BatchDim {
            op: "concat_batch",
            detail: "no tensors to concatenate".into(),
        })?;
        if first.shape.rank() == 0 {
            return Err(TensorError::BatchDim {
                op: "concat_batch",
                detail: "cannot concatenate scalars".into(),
            });
        }

        let mut rows = 0;
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::num_elements).sum());
        for part in parts {
            if part.shape.rank() != first.shape.rank()
                || part.shape.dims()[1..] != first.shape.dims()[1..]
            {
                return Err(TensorError::ShapeMismatch {
                    op: "concat_batch",
                    lhs: first.shape.clone(),
                    rhs: part.shape.clone(),
                });
            }
            rows += part.shape.dims()[0];
            data.extend_from_slice(&part.data);
        }

        Ok(Tensor {
            shape: first.shape.with_dim(0, rows),
            data,
            requires_grad: first.requires_grad,
        })
    }
}
