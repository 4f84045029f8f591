// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # model-ir
//!
//! The in-memory representation of a model that can be cut into
//! pipeline stages.
//!
//! - [`ModelGraph`] — an arena of modules (containers, layers, boundary
//!   markers) and parameters, with a **type-state pattern**
//!   (`Loaded` → `Validated`). Handles are stable; partitioning marks
//!   modules [`Residency::External`] instead of removing them.
//! - [`BoundaryNode`] — forward/backward behaviour of a boundary marker;
//!   [`PassThrough`] until a stage installs a communicating node.
//! - [`Layer`] — a differentiable leaf computation; [`layers`] holds the
//!   reference implementations.
//! - [`ModelProgram`] / [`Invoke`] — the model forward written as code and
//!   the call surface tracers and stages implement.
//! - [`Tape`] — reverse-mode replay of recorded calls.
//! - [`Batch`] — named inputs with microbatch scatter/gather.
//! - [`StageRng`] / [`RngSnapshot`] — explicit random state for recomputation.
//!
//! # Example
//! ```
//! use model_ir::{layers::Affine, ModelGraph};
//! use std::sync::Arc;
//! use tensor_core::{Shape, Tensor};
//!
//! let mut g = ModelGraph::new("tiny");
//! let fc = g.add_layer("fc", None, Arc::new(Affine::new(4)));
//! g.add_parameter(fc, "weight", Tensor::ones(Shape::vector(4))).unwrap();
//! g.add_parameter(fc, "bias", Tensor::zeros(Shape::vector(4))).unwrap();
//! g.add_boundary("cut", None);
//! let graph = g.validate().unwrap();
//! println!("{}", graph.summary());
//! ```

mod autograd;
mod batch;
mod boundary;
mod error;
pub mod graph;
mod layer;
pub mod layers;
mod module;
mod program;
mod rng;

pub use autograd::{Tape, Value, ValueId};
pub use batch::Batch;
pub use boundary::{BoundaryError, BoundaryNode, PassContext, PassThrough};
pub use error::ModelError;
pub use graph::{ModelGraph, Validated};
pub use layer::{Layer, LayerGrads, LayerOutput};
pub use module::{ModuleId, ModuleKind, ModuleNode, ParamId, Parameter, Residency};
pub use program::{outputs_require_grad, Invoke, ModelProgram};
pub use rng::{RngSnapshot, StageRng};
