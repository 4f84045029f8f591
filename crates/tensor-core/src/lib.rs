// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # tensor-core
//!
//! Minimal tensor types for pipeline-parallel training.
//!
//! This crate provides:
//! - [`Tensor`]: an owned, row-major `f32` tensor carrying a
//!   gradient-requirement flag.
//! - [`Shape`]: runtime shape descriptors with batch-dimension helpers.
//! - [`DType`]: element types used for storage and transfer accounting.
//! - [`ops`]: element-wise, broadcast and reduction kernels.
//!
//! Splitting along the leading dimension ([`Tensor::split_batch`]) and
//! the inverse [`Tensor::concat_batch`] are what microbatching is built on.

mod dtype;
mod error;
pub mod ops;
mod shape;
mod tensor;

pub use dtype::DType;
pub use error::TensorError;
pub use shape::Shape;
pub use tensor::Tensor;
