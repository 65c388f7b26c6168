//! Safetensors snapshots and non-strict parameter restoration.
//!
//! A snapshot nests every parameter under the `state_dict` root: parameter
//! `encoder.conv_in.weight` is stored as `state_dict.encoder.conv_in.weight`.
//! Tensors outside the root (optimizer state, metadata) are ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::error::{AutoencoderError, AutoencoderResult};

/// Root key every parameter is nested under.
pub const STATE_DICT_ROOT: &str = "state_dict";

/// All vars of a `VarMap`, sorted by name.
pub(crate) fn named_vars(varmap: &VarMap) -> AutoencoderResult<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| AutoencoderError::TensorError {
            message: format!("parameter table lock poisoned: {e}"),
        })?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Parameters read from a snapshot file, keyed by name with the root stripped.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
    tensors: BTreeMap<String, Tensor>,
}

impl Snapshot {
    /// Read a snapshot.
    ///
    /// # Errors
    /// - `IoError` if the file is missing or unreadable
    /// - `CheckpointError` if it is not valid safetensors or has no `state_dict` entries
    pub fn load(path: impl AsRef<Path>, device: &Device) -> AutoencoderResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let raw = candle_core::safetensors::load_buffer(&bytes, device).map_err(|e| {
            AutoencoderError::CheckpointError {
                path: path.to_path_buf(),
                message: format!("not a readable safetensors file: {e}"),
            }
        })?;

        let prefix = format!("{STATE_DICT_ROOT}.");
        let tensors: BTreeMap<String, Tensor> = raw
            .into_iter()
            .filter_map(|(name, t)| name.strip_prefix(&prefix).map(|n| (n.to_string(), t)))
            .collect();
        if tensors.is_empty() {
            return Err(AutoencoderError::CheckpointError {
                path: path.to_path_buf(),
                message: format!("no tensors under the '{STATE_DICT_ROOT}' root"),
            });
        }

        debug!(
            target: "autoencoder_kl::checkpoint",
            path = %path.display(),
            tensors = tensors.len(),
            "Loaded snapshot"
        );
        Ok(Self {
            path: path.to_path_buf(),
            tensors,
        })
    }

    /// Write `params` under the `state_dict` root.
    pub fn save(path: impl AsRef<Path>, params: &[(String, Tensor)]) -> AutoencoderResult<()> {
        let path = path.as_ref();
        let nested: HashMap<String, Tensor> = params
            .iter()
            .map(|(name, t)| (format!("{STATE_DICT_ROOT}.{name}"), t.clone()))
            .collect();
        candle_core::safetensors::save(&nested, path).map_err(|e| {
            AutoencoderError::CheckpointError {
                path: path.to_path_buf(),
                message: format!("failed to write snapshot: {e}"),
            }
        })?;
        info!(
            target: "autoencoder_kl::checkpoint",
            path = %path.display(),
            tensors = params.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Parameter names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// What a restore did. Returned instead of printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Target parameters overwritten from the snapshot.
    pub restored: Vec<String>,
    /// Snapshot entries dropped by an ignore prefix.
    pub ignored: Vec<String>,
    /// Target parameters the snapshot did not provide.
    pub missing: Vec<String>,
    /// Snapshot entries with no matching target.
    pub unexpected: Vec<String>,
}

/// Copy snapshot tensors into `targets`, skipping names that start with any
/// of `ignore_keys`. Missing and unexpected names are tolerated and reported.
///
/// # Errors
/// `ShapeMismatch` if a matching name disagrees on shape. Every name is
/// checked before any target is written, so a failed restore leaves the
/// targets untouched.
pub fn restore(
    snapshot: &Snapshot,
    ignore_keys: &[String],
    targets: &[(String, Var)],
) -> AutoencoderResult<RestoreReport> {
    let mut report = RestoreReport::default();
    let mut kept: BTreeMap<&str, &Tensor> = BTreeMap::new();

    for (name, tensor) in &snapshot.tensors {
        if let Some(prefix) = ignore_keys.iter().find(|ik| name.starts_with(ik.as_str())) {
            debug!(
                target: "autoencoder_kl::checkpoint",
                key = %name,
                prefix = %prefix,
                "Dropping key from state_dict"
            );
            report.ignored.push(name.clone());
        } else {
            kept.insert(name.as_str(), tensor);
        }
    }

    let mut staged: Vec<(&Var, Tensor)> = Vec::new();
    for (name, var) in targets {
        let Some(src) = kept.remove(name.as_str()) else {
            report.missing.push(name.clone());
            continue;
        };
        if src.dims() != var.as_tensor().dims() {
            return Err(AutoencoderError::ShapeMismatch {
                context: format!("checkpoint tensor '{name}'"),
                expected: var.as_tensor().dims().to_vec(),
                actual: src.dims().to_vec(),
            });
        }
        staged.push((var, src.to_dtype(var.dtype())?.to_device(var.device())?));
        report.restored.push(name.clone());
    }

    for (var, src) in &staged {
        var.set(src)?;
    }

    report.unexpected = kept.into_keys().map(str::to_string).collect();

    info!(
        target: "autoencoder_kl::checkpoint",
        path = %snapshot.path.display(),
        restored = report.restored.len(),
        ignored = report.ignored.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "Restored from snapshot"
    );
    Ok(report)
}
