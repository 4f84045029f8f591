// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for tensor operations.

use crate::Shape;

/// Errors that can occur during tensor operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// The provided buffer length does not match the element count of the shape.
    #[error("buffer length mismatch: shape needs {expected} elements, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Two tensors have incompatible shapes for the requested operation.
    #[error("incompatible shapes for {op}: {lhs} vs {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// The requested data type is not supported for this operation.
    #[error("unsupported dtype {dtype} for operation {op}")]
    UnsupportedDType {
        op: &'static str,
        dtype: crate::DType,
    },

    /// An operation received the wrong number of operands.
    #[error("{op} expects {expected} operand(s), got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Splitting or concatenating along the batch dimension failed.
    #[error("batch dimension error in {op}: {detail}")]
    BatchDim { op: &'static str, detail: String },
}
