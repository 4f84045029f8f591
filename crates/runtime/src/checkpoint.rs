// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stage checkpoints in SafeTensors format.
//!
//! Each stage writes only the parameters it still holds to
//! `stage-{s}.safetensors`. Loading memory-maps the file and overwrites
//! the resident parameters by name; every resident parameter must be
//! present with its exact shape. `bf16` tensors written by other tools
//! are widened on load.

use crate::RuntimeError;
use model_ir::{ModelGraph, Validated};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tensor_core::{DType, Shape, Tensor};

const STAGE_KEY: &str = "stage";

/// File holding `stage`'s parameters inside `dir`.
pub fn checkpoint_path(dir: &Path, stage: usize) -> PathBuf {
    dir.join(format!("stage-{stage}.safetensors"))
}

fn error(path: &Path, detail: impl Into<String>) -> RuntimeError {
    RuntimeError::Checkpoint {
        path: path.display().to_string(),
        detail: detail.into(),
    }
}

/// Writes the resident parameters of `graph`. Returns the file written.
pub fn save_stage(
    graph: &ModelGraph<Validated>,
    stage: usize,
    dir: &Path,
) -> Result<PathBuf, RuntimeError> {
    std::fs::create_dir_all(dir).map_err(|e| error(dir, format!("cannot create directory: {e}")))?;
    let path = checkpoint_path(dir, stage);

    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (_, p) in graph.resident_parameters() {
        if let Some(value) = p.value() {
            buffers.push((p.name().to_string(), p.shape().dims().to_vec(), value.to_le_bytes()));
        }
    }
    let views = buffers
        .iter()
        .map(|(name, dims, bytes)| {
            TensorView::new(Dtype::F32, dims.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| error(&path, format!("'{name}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let metadata = Some(HashMap::from([(STAGE_KEY.to_string(), stage.to_string())]));
    safetensors::serialize_to_file(views, &metadata, &path)
        .map_err(|e| error(&path, e.to_string()))?;
    tracing::info!(
        "stage {stage}: checkpointed {} parameter(s) to {}",
        buffers.len(),
        path.display()
    );
    Ok(path)
}

/// Restores the resident parameters of `graph`. Returns how many were set.
pub fn load_stage(
    graph: &mut ModelGraph<Validated>,
    stage: usize,
    dir: &Path,
) -> Result<usize, RuntimeError> {
    let path = checkpoint_path(dir, stage);
    let file = std::fs::File::open(&path).map_err(|e| error(&path, format!("cannot open: {e}")))?;
    // SAFETY: the checkpoint is written once and not modified while mapped.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| error(&path, format!("mmap failed: {e}")))?;

    let (_, header) = SafeTensors::read_metadata(&mmap)
        .map_err(|e| error(&path, format!("SafeTensors parse error: {e}")))?;
    let written_by = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(STAGE_KEY))
        .and_then(|s| s.parse::<usize>().ok());
    if written_by != Some(stage) {
        return Err(error(
            &path,
            format!("written for stage {written_by:?}, loading into stage {stage}"),
        ));
    }

    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| error(&path, format!("SafeTensors parse error: {e}")))?;
    let targets: Vec<_> = graph
        .resident_parameters()
        .map(|(pid, p)| (pid, p.name().to_string()))
        .collect();
    for (pid, name) in &targets {
        let view = st
            .tensor(name)
            .map_err(|e| error(&path, format!("tensor '{name}' not found: {e}")))?;
        let dtype = match view.dtype() {
            Dtype::F32 => DType::F32,
            Dtype::BF16 => DType::BF16,
            Dtype::F16 => DType::F16,
            other => return Err(error(&path, format!("tensor '{name}' has unsupported dtype {other:?}"))),
        };
        let tensor = Tensor::decode_le(Shape::new(view.shape().to_vec()), dtype, view.data())
            .map_err(|e| error(&path, format!("tensor '{name}': {e}")))?;
        graph.set_parameter_value(*pid, tensor)?;
    }
    tracing::info!(
        "stage {stage}: restored {} parameter(s) from {}",
        targets.len(),
        path.display()
    );
    Ok(targets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_ir::layers::Affine;
    use std::sync::Arc;

    fn graph(fill: f32) -> ModelGraph<Validated> {
        let mut g = ModelGraph::new("ckpt");
        let l = g.add_layer("fc", None, Arc::new(Affine::new(3)));
        g.add_parameter(l, "weight", Tensor::full(Shape::vector(3), fill))
            .unwrap();
        g.add_parameter(l, "bias", Tensor::full(Shape::vector(3), -fill))
            .unwrap();
        g.validate().unwrap()
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_stage(&graph(2.5), 1, dir.path()).unwrap();
        assert!(path.ends_with("stage-1.safetensors"));

        let mut g = graph(0.0);
        assert_eq!(load_stage(&mut g, 1, dir.path()).unwrap(), 2);
        let bias = g.find_parameter("fc.bias").unwrap();
        assert_eq!(g.parameter(bias).unwrap().value().unwrap().as_slice(), &[-2.5; 3]);
    }

    #[test]
    fn test_pruned_parameters_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = graph(1.0);
        let w = g.find_parameter("fc.weight").unwrap();
        g.prune_parameter(w);
        save_stage(&g, 0, dir.path()).unwrap();

        let mut restored = graph(9.0);
        restored.prune_parameter(restored.find_parameter("fc.weight").unwrap());
        assert_eq!(load_stage(&mut restored, 0, dir.path()).unwrap(), 1);
    }

    #[test]
    fn test_stage_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_stage(&graph(1.0), 0, dir.path()).unwrap();
        std::fs::rename(
            checkpoint_path(dir.path(), 0),
            checkpoint_path(dir.path(), 2),
        )
        .unwrap();
        let err = load_stage(&mut graph(1.0), 2, dir.path()).unwrap_err();
        assert!(matches!(err, RuntimeError::Checkpoint { .. }));
    }

    #[test]
    fn test_load_bf16_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let weight: Vec<u8> = [0x4000u16; 3].iter().flat_map(|b| b.to_le_bytes()).collect();
        let bias: Vec<u8> = [0xBF80u16; 3].iter().flat_map(|b| b.to_le_bytes()).collect();
        let views = vec![
            ("fc.weight", TensorView::new(Dtype::BF16, vec![3], &weight).unwrap()),
            ("fc.bias", TensorView::new(Dtype::BF16, vec![3], &bias).unwrap()),
        ];
        let metadata = Some(HashMap::from([(STAGE_KEY.to_string(), "0".to_string())]));
        safetensors::serialize_to_file(views, &metadata, &checkpoint_path(dir.path(), 0)).unwrap();

        let mut g = graph(0.0);
        assert_eq!(load_stage(&mut g, 0, dir.path()).unwrap(), 2);
        let w = g.find_parameter("fc.weight").unwrap();
        assert_eq!(g.parameter(w).unwrap().value().unwrap().as_slice(), &[2.0; 3]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_stage(&mut graph(1.0), 0, dir.path()).is_err());
    }
}
