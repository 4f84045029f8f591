// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Named input batches and microbatching.

use crate::ModelError;
use std::collections::BTreeMap;
use tensor_core::Tensor;

/// A dictionary of named input tensors sharing one leading (batch) dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tensors: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Returns the named input.
    pub fn input(&self, name: &str) -> Result<&Tensor, ModelError> {
        self.tensors.get(name).ok_or_else(|| ModelError::MissingInput {
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The leading dimension shared by every input.
    pub fn batch_size(&self) -> Result<usize, ModelError> {
        let mut size = None;
        for (name, t) in &self.tensors {
            let rows = t.shape().batch_size().ok_or_else(|| {
                ModelError::InconsistentBatch(format!("input '{name}' has no batch dimension"))
            })?;
            match size {
                None => size = Some(rows),
                Some(s) if s != rows => {
                    return Err(ModelError::InconsistentBatch(format!(
                        "input '{name}' has {rows} rows, expected {s}"
                    )))
                }
                Some(_) => {}
            }
        }
        size.ok_or_else(|| ModelError::InconsistentBatch("batch has no inputs".into()))
    }

    /// Splits every input along its leading dimension into microbatches of
    /// `micro_batch_size` rows; the last microbatch holds any remainder.
    pub fn scatter(&self, micro_batch_size: usize) -> Result<Vec<Batch>, ModelError> {
        let rows = self.batch_size()?;
        if micro_batch_size == 0 {
            return Err(ModelError::InconsistentBatch(
                "micro-batch size must be positive".into(),
            ));
        }
        let count = rows.div_ceil(micro_batch_size);
        let mut out = vec![Batch::new(); count];
        for (name, t) in &self.tensors {
            for (mb, chunk) in out.iter_mut().zip(t.split_batch(micro_batch_size)?) {
                mb.insert(name.clone(), chunk);
            }
        }
        Ok(out)
    }

    /// Concatenates microbatches back into one batch.
    pub fn gather(parts: &[Batch]) -> Result<Batch, ModelError> {
        let first = parts
            .first()
            .ok_or_else(|| ModelError::InconsistentBatch("no microbatches to gather".into()))?;
        let mut out = Batch::new();
        for name in first.tensors.keys() {
            let pieces = parts
                .iter()
                .map(|p| p.input(name).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(name.clone(), Tensor::concat_batch(&pieces)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_core::Shape;

    fn arange(dims: Vec<usize>) -> Tensor {
        let shape = Shape::new(dims);
        let n = shape.num_elements();
        Tensor::from_vec(shape, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_scatter_even() {
        let b = Batch::new()
            .with("x", arange(vec![6, 4]))
            .with("y", arange(vec![6]));
        let parts = b.scatter(2).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.batch_size().unwrap() == 2));
    }

    #[test]
    fn test_scatter_remainder_and_gather_roundtrip() {
        let b = Batch::new()
            .with("x", arange(vec![7, 3]))
            .with("mask", arange(vec![7, 1, 2]));
        let parts = b.scatter(2).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].batch_size().unwrap(), 1);
        assert_eq!(parts[3].input("mask").unwrap().shape().dims(), &[1, 1, 2]);
        assert_eq!(Batch::gather(&parts).unwrap(), b);
    }

    #[test]
    fn test_inconsistent_rows_rejected() {
        let b = Batch::new()
            .with("x", arange(vec![4, 2]))
            .with("y", arange(vec![3]));
        assert!(matches!(
            b.scatter(2),
            Err(ModelError::InconsistentBatch(_))
        ));
    }

    #[test]
    fn test_missing_input() {
        let b = Batch::new().with("x", arange(vec![1]));
        assert!(matches!(
            b.input("labels"),
            Err(ModelError::MissingInput { .. })
        ));
    }
}
