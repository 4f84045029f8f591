// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Tensor arithmetic operations.
//!
//! Kernels allocate their outputs; the only in-place operation is
//! [`add_assign`], used for gradient accumulation.

mod broadcast;
mod elementwise;
mod reduce;

pub use broadcast::{add_last_dim, mul_last_dim};
pub use elementwise::{add, add_assign, mul, scale, sub};
pub use reduce::{mean, sum, sum_to_last_dim};
