// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The model program and the call surface it runs against.
//!
//! A [`ModelProgram`] is the model's forward written as ordinary code: it
//! pulls named inputs from a [`crate::Batch`] and calls modules through an
//! [`Invoke`] implementation. The same program is run by the tracer, the
//! ownership resolver and every pipeline stage; only the `Invoke`
//! implementation changes.
//!
//! Programs must pass module outputs along without inspecting them. On a
//! partitioned stage, calls to modules owned by other stages return an
//! empty value list.

use crate::{Batch, ModelError, ModuleId, Value};

/// Executes one module call on behalf of a [`ModelProgram`].
pub trait Invoke {
    /// Calls `module` on `inputs` and returns its outputs.
    fn call(&mut self, module: ModuleId, inputs: Vec<Value>) -> Result<Vec<Value>, ModelError>;
}

/// The model's forward computation.
pub trait ModelProgram: Send + Sync {
    /// Runs the forward over one (micro)batch, returning the model outputs.
    ///
    /// On the final stage the first output is the scalar loss.
    fn forward(&self, cx: &mut dyn Invoke, batch: &Batch) -> Result<Vec<Value>, ModelError>;
}

/// Whether a call's outputs require gradients under tracking.
///
/// True if any input does or the module reads parameters.
pub fn outputs_require_grad(inputs: &[Value], reads_params: bool) -> bool {
    reads_params || inputs.iter().any(|v| v.tensor().requires_grad())
}
