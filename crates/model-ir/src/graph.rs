// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Model graph: an arena of modules and parameters.
//!
//! # Type-State Pattern
//!
//! The graph transitions through states enforced at compile time:
//!
//! ```text
//! ModelGraph<Loaded>     — modules being declared, not yet checked.
//!       │  .validate()
//!       ▼
//! ModelGraph<Validated>  — tree and parameter arity verified, ready for
//!                          tracing and partitioning.
//! ```
//!
//! Modules and parameters are appended and never removed. Handles stay
//! valid for the lifetime of the graph, so traces recorded against one
//! copy apply to every per-stage copy built the same way.

use crate::{
    BoundaryNode, Layer, LayerOutput, ModelError, ModuleId, ModuleKind, ModuleNode, ParamId,
    Parameter, PassThrough, Residency, StageRng,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tensor_core::{ops, Tensor};

// ── Type-state markers ─────────────────────────────────────────────

/// Marker: graph is being built and has not been validated.
#[derive(Debug, Clone)]
pub struct Loaded;

/// Marker: graph has been validated and is ready for partitioning.
#[derive(Debug, Clone)]
pub struct Validated;

/// Sealed trait for graph states.
pub trait GraphState: fmt::Debug + Clone {}
impl GraphState for Loaded {}
impl GraphState for Validated {}

// ── ModelGraph ─────────────────────────────────────────────────────

/// The model as a tree of modules with their parameters.
///
/// The tree only supplies names and ancestry. Execution order is whatever
/// order the [`crate::ModelProgram`] calls modules in, discovered by tracing.
#[derive(Debug, Clone)]
pub struct ModelGraph<S: GraphState = Loaded> {
    /// Human-readable model name.
    pub name: String,
    nodes: Vec<ModuleNode>,
    params: Vec<Parameter>,
    _state: std::marker::PhantomData<S>,
}

// ── Loaded state ───────────────────────────────────────────────────

impl ModelGraph<Loaded> {
    /// Creates an empty graph in the `Loaded` state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            params: Vec::new(),
            _state: std::marker::PhantomData,
        }
    }

    fn push(&mut self, local: &str, parent: Option<ModuleId>, kind: ModuleKind) -> ModuleId {
        let name = match parent.and_then(|p| self.nodes.get(p.0)) {
            Some(p) => format!("{}.{local}", p.name),
            None => local.to_string(),
        };
        self.nodes.push(ModuleNode {
            name,
            parent,
            kind,
            params: Vec::new(),
            residency: Residency::Local,
        });
        ModuleId(self.nodes.len() - 1)
    }

    /// Declares a container module.
    pub fn add_container(&mut self, local: &str, parent: Option<ModuleId>) -> ModuleId {
        self.push(local, parent, ModuleKind::Container)
    }

    /// Declares a leaf layer.
    pub fn add_layer(
        &mut self,
        local: &str,
        parent: Option<ModuleId>,
        layer: Arc<dyn Layer>,
    ) -> ModuleId {
        self.push(local, parent, ModuleKind::Layer(layer))
    }

    /// Declares a boundary marker; it starts as [`PassThrough`].
    pub fn add_boundary(&mut self, local: &str, parent: Option<ModuleId>) -> ModuleId {
        self.push(local, parent, ModuleKind::Boundary(Arc::new(PassThrough)))
    }

    /// Declares a parameter on `module`, returning its handle.
    pub fn add_parameter(
        &mut self,
        module: ModuleId,
        local: &str,
        value: Tensor,
    ) -> Result<ParamId, ModelError> {
        let node = self
            .nodes
            .get_mut(module.0)
            .ok_or_else(|| ModelError::UnknownModule(module.to_string()))?;
        let id = ParamId(self.params.len());
        node.params.push(id);
        self.params.push(Parameter {
            name: format!("{}.{local}", node.name),
            owner: module,
            shape: value.shape().clone(),
            value: Some(value),
            grad: None,
        });
        Ok(id)
    }

    /// Lets `module` also read a parameter declared elsewhere (weight tying).
    ///
    /// Tied parameters read from two different stage intervals are rejected
    /// by ownership resolution; declare two parameters as a shared pair instead.
    pub fn tie_parameter(&mut self, module: ModuleId, param: ParamId) -> Result<(), ModelError> {
        if param.0 >= self.params.len() {
            return Err(ModelError::InvalidGraph(format!(
                "parameter handle {} out of range",
                param.0
            )));
        }
        let node = self
            .nodes
            .get_mut(module.0)
            .ok_or_else(|| ModelError::UnknownModule(module.to_string()))?;
        node.params.push(param);
        Ok(())
    }

    /// Validates the graph and transitions to the `Validated` state.
    ///
    /// # Checks
    /// - The graph is non-empty.
    /// - Parents are containers declared before their children.
    /// - Module names and parameter names are unique.
    /// - Each layer reads exactly the number of parameters it declares.
    /// - Boundary markers hold no parameters.
    pub fn validate(self) -> Result<ModelGraph<Validated>, ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::InvalidGraph("model graph contains no modules".into()));
        }

        let mut names = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if !names.insert(node.name.as_str()) {
                return Err(ModelError::InvalidModule {
                    module: node.name.clone(),
                    detail: "duplicate module name".into(),
                });
            }
            if let Some(parent) = node.parent {
                let parent_node = self.nodes.get(parent.0).filter(|_| parent.0 < i);
                match parent_node {
                    Some(p) if p.is_container() => {}
                    _ => {
                        return Err(ModelError::InvalidModule {
                            module: node.name.clone(),
                            detail: format!("parent {parent} is not an earlier container"),
                        })
                    }
                }
            }
            match &node.kind {
                ModuleKind::Layer(layer) if layer.num_params() != node.params.len() => {
                    return Err(ModelError::InvalidModule {
                        module: node.name.clone(),
                        detail: format!(
                            "{} layer expects {} parameter(s), module provides {}",
                            layer.kind(),
                            layer.num_params(),
                            node.params.len()
                        ),
                    });
                }
                ModuleKind::Boundary(_) | ModuleKind::Container if !node.params.is_empty() => {
                    return Err(ModelError::InvalidModule {
                        module: node.name.clone(),
                        detail: format!("a {} cannot read parameters", node.kind.as_str()),
                    });
                }
                _ => {}
            }
        }

        let mut param_names = HashSet::new();
        for p in &self.params {
            if !param_names.insert(p.name.as_str()) {
                return Err(ModelError::InvalidGraph(format!(
                    "duplicate parameter name '{}'",
                    p.name
                )));
            }
        }

        tracing::debug!(
            "validated graph '{}': {} modules, {} parameters",
            self.name,
            self.nodes.len(),
            self.params.len()
        );

        Ok(ModelGraph {
            name: self.name,
            nodes: self.nodes,
            params: self.params,
            _state: std::marker::PhantomData,
        })
    }
}

// ── Validated state ────────────────────────────────────────────────

impl ModelGraph<Validated> {
    pub fn num_modules(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    /// Returns a module by handle.
    pub fn module(&self, id: ModuleId) -> Result<&ModuleNode, ModelError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| ModelError::UnknownModule(id.to_string()))
    }

    /// Iterates modules in declaration order.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &ModuleNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (ModuleId(i), n))
    }

    /// Looks a module up by fully qualified name.
    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        self.nodes.iter().position(|n| n.name == name).map(ModuleId)
    }

    pub fn parameter(&self, id: ParamId) -> Option<&Parameter> {
        self.params.get(id.0)
    }

    /// Iterates parameters in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn find_parameter(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    /// Parameters whose values this process still holds.
    pub fn resident_parameters(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.parameters().filter(|(_, p)| p.is_resident())
    }

    /// Handles of all boundary markers in declaration order.
    pub fn boundary_ids(&self) -> Vec<ModuleId> {
        self.modules()
            .filter(|(_, n)| n.is_boundary())
            .map(|(id, _)| id)
            .collect()
    }

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut cur = self.nodes.get(id.0).and_then(|n| n.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes.get(p.0).and_then(|n| n.parent);
        }
        out
    }

    /// Sets whether this process executes `id`.
    pub fn set_residency(&mut self, id: ModuleId, residency: Residency) -> Result<(), ModelError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| ModelError::UnknownModule(id.to_string()))?;
        node.residency = residency;
        Ok(())
    }

    /// Replaces the behaviour of a boundary marker.
    pub fn install_boundary(
        &mut self,
        id: ModuleId,
        node: Arc<dyn BoundaryNode>,
    ) -> Result<(), ModelError> {
        let module = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| ModelError::UnknownModule(id.to_string()))?;
        match &mut module.kind {
            ModuleKind::Boundary(current) => {
                tracing::debug!(
                    "boundary '{}': {} -> {}",
                    module.name,
                    current.describe(),
                    node.describe()
                );
                *current = node;
                Ok(())
            }
            other => Err(ModelError::InvalidModule {
                module: module.name.clone(),
                detail: format!("cannot install boundary behaviour on a {}", other.as_str()),
            }),
        }
    }

    /// Drops a parameter's value and gradient from this process.
    pub fn prune_parameter(&mut self, id: ParamId) {
        if let Some(p) = self.params.get_mut(id.0) {
            p.value = None;
            p.grad = None;
        }
    }

    /// Overwrites a resident parameter's value, keeping its shape.
    pub fn set_parameter_value(&mut self, id: ParamId, value: Tensor) -> Result<(), ModelError> {
        let p = self
            .params
            .get_mut(id.0)
            .ok_or_else(|| ModelError::InvalidGraph(format!("parameter {} out of range", id.0)))?;
        if value.shape() != &p.shape {
            return Err(ModelError::Tensor(tensor_core::TensorError::ShapeMismatch {
                op: "set_parameter_value",
                lhs: p.shape.clone(),
                rhs: value.shape().clone(),
            }));
        }
        if p.value.is_none() {
            return Err(ModelError::MissingParameter {
                parameter: p.name.clone(),
            });
        }
        p.value = Some(value);
        Ok(())
    }

    /// Adds `grad` into the parameter's accumulated gradient.
    pub fn accumulate_grad(&mut self, id: ParamId, grad: &Tensor) -> Result<(), ModelError> {
        let p = self
            .params
            .get_mut(id.0)
            .ok_or_else(|| ModelError::InvalidGraph(format!("parameter {} out of range", id.0)))?;
        if p.value.is_none() {
            return Err(ModelError::MissingParameter {
                parameter: p.name.clone(),
            });
        }
        match &mut p.grad {
            Some(acc) => ops::add_assign(acc, grad)?,
            None => {
                if grad.shape() != &p.shape {
                    return Err(ModelError::Tensor(tensor_core::TensorError::ShapeMismatch {
                        op: "accumulate_grad",
                        lhs: p.shape.clone(),
                        rhs: grad.shape().clone(),
                    }));
                }
                p.grad = Some(grad.clone().with_requires_grad(false));
            }
        }
        Ok(())
    }

    /// Replaces a parameter's gradient (used after gradient all-reduce).
    pub fn set_grad(&mut self, id: ParamId, grad: Tensor) -> Result<(), ModelError> {
        let p = self
            .params
            .get_mut(id.0)
            .ok_or_else(|| ModelError::InvalidGraph(format!("parameter {} out of range", id.0)))?;
        p.grad = Some(grad);
        Ok(())
    }

    /// Clears every accumulated gradient.
    pub fn zero_grad(&mut self) {
        for p in &mut self.params {
            p.grad = None;
        }
    }

    /// Evaluates a layer module on `inputs` with its current parameter values.
    pub fn run_layer(
        &self,
        id: ModuleId,
        inputs: &[Tensor],
        rng: &mut StageRng,
    ) -> Result<LayerOutput, ModelError> {
        let node = self.module(id)?;
        let layer = match &node.kind {
            ModuleKind::Layer(layer) => layer,
            other => {
                return Err(ModelError::NotCallable {
                    module: node.name.clone(),
                    kind: other.as_str(),
                })
            }
        };
        let params = self.param_values(node)?;
        layer
            .forward(&params, inputs, rng)
            .map_err(|source| ModelError::Compute {
                module: node.name.clone(),
                source,
            })
    }

    /// Current values of the parameters a module reads.
    pub(crate) fn param_values(&self, node: &ModuleNode) -> Result<Vec<&Tensor>, ModelError> {
        node.params
            .iter()
            .map(|pid| {
                let p = &self.params[pid.0];
                p.value.as_ref().ok_or_else(|| ModelError::MissingParameter {
                    parameter: p.name.clone(),
                })
            })
            .collect()
    }

    /// Total number of parameter elements still resident.
    pub fn resident_elements(&self) -> usize {
        self.resident_parameters().map(|(_, p)| p.num_elements()).sum()
    }

    /// Returns a summary string describing the model.
    pub fn summary(&self) -> String {
        let layers = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, ModuleKind::Layer(_)))
            .count();
        let external = self.nodes.iter().filter(|n| n.is_external()).count();
        format!(
            "Model '{}': {} modules ({} layers, {} boundary markers, {} external), {} of {} parameters resident",
            self.name,
            self.nodes.len(),
            layers,
            self.boundary_ids().len(),
            external,
            self.resident_parameters().count(),
            self.params.len(),
        )
    }
}

// ── Shared implementations ─────────────────────────────────────────

impl<S: GraphState> fmt::Display for ModelGraph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ModelGraph '{}' ({} modules):", self.name, self.nodes.len())?;
        for node in &self.nodes {
            let depth = {
                let mut d = 0;
                let mut cur = node.parent;
                while let Some(p) = cur {
                    d += 1;
                    cur = self.nodes.get(p.0).and_then(|n| n.parent);
                }
                d
            };
            let detail = match &node.kind {
                ModuleKind::Container => "container".to_string(),
                ModuleKind::Layer(l) => l.kind().to_string(),
                ModuleKind::Boundary(b) => format!("boundary ({})", b.describe()),
            };
            let marker = if node.is_external() { " [external]" } else { "" };
            writeln!(f, "  {}{} : {}{}", "  ".repeat(depth), node.name, detail, marker)?;
        }
        Ok(())
    }
}
