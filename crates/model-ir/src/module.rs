// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Module and parameter records stored in the graph arena.
//!
//! Modules are addressed by stable [`ModuleId`] handles and never removed.
//! Partitioning a stage marks modules outside it as [`Residency::External`]
//! and drops the values of parameters the stage does not own.

use crate::{BoundaryNode, Layer};
use std::fmt;
use std::sync::Arc;
use tensor_core::{Shape, Tensor};

/// Stable handle of a module in a [`crate::ModelGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable handle of a parameter in a [`crate::ModelGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a module does when the model program calls it.
#[derive(Debug, Clone)]
pub enum ModuleKind {
    /// Groups child modules; not callable.
    Container,
    /// Leaf computation.
    Layer(Arc<dyn Layer>),
    /// Stage cut point with its currently installed behaviour.
    Boundary(Arc<dyn BoundaryNode>),
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Container => "container",
            ModuleKind::Layer(_) => "layer",
            ModuleKind::Boundary(_) => "boundary",
        }
    }
}

/// Whether this process executes a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// Executed by this stage.
    Local,
    /// Belongs to another stage; calls return no value.
    External,
}

/// One node of the module tree.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub(crate) name: String,
    pub(crate) parent: Option<ModuleId>,
    pub(crate) kind: ModuleKind,
    pub(crate) params: Vec<ParamId>,
    pub(crate) residency: Residency,
}

impl ModuleNode {
    /// Fully qualified dotted name, e.g. `"encoder.block.3.attn"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ModuleId> {
        self.parent
    }

    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    /// Parameters read by this module, including tied ones owned elsewhere.
    pub fn params(&self) -> &[ParamId] {
        &self.params
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_external(&self) -> bool {
        self.residency == Residency::External
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.kind, ModuleKind::Boundary(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, ModuleKind::Container)
    }
}

/// A trainable tensor and its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub(crate) name: String,
    pub(crate) owner: ModuleId,
    pub(crate) shape: Shape,
    pub(crate) value: Option<Tensor>,
    pub(crate) grad: Option<Tensor>,
}

impl Parameter {
    /// Fully qualified name, `"<module>.<local>"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module the parameter was declared on (its structural position).
    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// Shape, known even after the value is pruned.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// `true` while the value is held by this process.
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }
}
