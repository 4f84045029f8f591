// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reference layers.
//!
//! | Layer | Params | Forward |
//! |---|---|---|
//! | [`Affine`] | `weight [H]`, `bias [H]` | `y = x * weight + bias` per feature |
//! | [`Noise`] | none | `y = x * (1 + a * (u - 0.5))`, `u ~ U[0, 1)` |
//! | [`MseLoss`] | none | `mean((pred - target)^2)` |

mod affine;
mod mse;
mod noise;

pub use affine::Affine;
pub use mse::MseLoss;
pub use noise::Noise;
