use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::AutoencoderResult;

/// Detached diagnostic scalars keyed `"{split}/{name}"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossLog {
    entries: BTreeMap<String, f32>,
}

impl LossLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f32) {
        self.entries.insert(key.into(), value);
    }

    /// Record a scalar tensor. Any rank is accepted; the mean is taken.
    pub fn insert_tensor(&mut self, key: impl Into<String>, value: &Tensor) -> AutoencoderResult<()> {
        let v = value
            .detach()
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;
        self.insert(key, v);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<f32> {
        self.entries.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries of `other` overwrite same-named entries here.
    pub fn merge(&mut self, other: LossLog) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
