//! Per-sample transforms applied after a record is loaded.

use crate::types::Record;
use serde::{Deserialize, Serialize};

/// A single record transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Z-score over the whole record
    Standardize,
    /// Per-channel (row) z-score
    StandardizeChannels,
    Clip { min: f32, max: f32 },
    Scale { factor: f32 },
    /// Full-wave rectification
    Rectify,
}

impl Transform {
    pub fn apply(&self, record: &mut Record) {
        match *self {
            Transform::Standardize => standardize(&mut record.data),
            Transform::StandardizeChannels => {
                let cols = record.cols;
                if cols > 0 {
                    for channel in record.data.chunks_mut(cols) {
                        standardize(channel);
                    }
                }
            }
            Transform::Clip { min, max } => {
                record.data.iter_mut().for_each(|v| *v = v.clamp(min, max))
            }
            Transform::Scale { factor } => record.data.iter_mut().for_each(|v| *v *= factor),
            Transform::Rectify => record.data.iter_mut().for_each(|v| *v = v.abs()),
        }
    }
}

fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = var.sqrt().max(1e-8);
    values.iter_mut().for_each(|v| *v = (*v - mean) / std);
}

/// Ordered list of transforms; the empty chain is the identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformChain(pub Vec<Transform>);

impl TransformChain {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn then(mut self, transform: Transform) -> Self {
        self.0.push(transform);
        self
    }

    pub fn apply(&self, mut record: Record) -> Record {
        for transform in &self.0 {
            transform.apply(&mut record);
        }
        record
    }
}
