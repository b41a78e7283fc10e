//! Fixed-topology feed-forward classifier (spec.md §4.6): two hidden
//! layers with ReLU, a linear output layer, argmax with ties resolved
//! toward `Benign`.

use std::io::Read;
use std::path::Path;

use log::info;

use crate::error::{Error, Result};

pub const HIDDEN1_DIM: usize = 128;
pub const HIDDEN2_DIM: usize = 64;
pub const OUTPUT_DIM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Benign,
    Malicious,
}

/// The six weight/bias arrays of the fixed topology, loaded from a
/// little-endian f32 binary file in a fixed order: `W1, b1, W2, b2, W3,
/// b3`. `input_dim` is `window.b * K` and determines `W1`'s width, so
/// the online (B=10) and offline (B=30) variants load differently
/// shaped models from the same format.
pub struct ModelWeights {
    input_dim: usize,
    w1: Vec<f32>, // HIDDEN1_DIM x input_dim, row-major
    b1: Vec<f32>, // HIDDEN1_DIM
    w2: Vec<f32>, // HIDDEN2_DIM x HIDDEN1_DIM
    b2: Vec<f32>, // HIDDEN2_DIM
    w3: Vec<f32>, // OUTPUT_DIM x HIDDEN2_DIM
    b3: Vec<f32>, // OUTPUT_DIM
}

impl ModelWeights {
    pub fn load(path: impl AsRef<Path>, input_dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|e| Error::ModelLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| Error::ModelLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut cursor = bytes.as_slice();
        let mut read_array = |len: usize| -> Result<Vec<f32>> {
            let needed = len * 4;
            if cursor.len() < needed {
                return Err(Error::ModelLoad {
                    path: path.display().to_string(),
                    reason: format!(
                        "truncated weight file: needed {} more bytes, {} remain",
                        needed,
                        cursor.len()
                    ),
                });
            }
            let (chunk, rest) = cursor.split_at(needed);
            cursor = rest;
            Ok(chunk
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect())
        };

        let w1 = read_array(HIDDEN1_DIM * input_dim)?;
        let b1 = read_array(HIDDEN1_DIM)?;
        let w2 = read_array(HIDDEN2_DIM * HIDDEN1_DIM)?;
        let b2 = read_array(HIDDEN2_DIM)?;
        let w3 = read_array(OUTPUT_DIM * HIDDEN2_DIM)?;
        let b3 = read_array(OUTPUT_DIM)?;

        if !cursor.is_empty() {
            return Err(Error::ModelLoad {
                path: path.display().to_string(),
                reason: format!("{} trailing bytes after the expected 6 arrays", cursor.len()),
            });
        }

        info!(
            "loaded model weights from {} (input_dim={})",
            path.display(),
            input_dim
        );

        Ok(ModelWeights {
            input_dim,
            w1,
            b1,
            w2,
            b2,
            w3,
            b3,
        })
    }

    /// An all-zero model, useful for deterministic tests: every input
    /// produces tied logits, which resolve to `Benign`.
    pub fn zeroed(input_dim: usize) -> Self {
        ModelWeights {
            input_dim,
            w1: vec![0.0; HIDDEN1_DIM * input_dim],
            b1: vec![0.0; HIDDEN1_DIM],
            w2: vec![0.0; HIDDEN2_DIM * HIDDEN1_DIM],
            b2: vec![0.0; HIDDEN2_DIM],
            w3: vec![0.0; OUTPUT_DIM * HIDDEN2_DIM],
            b3: vec![0.0; OUTPUT_DIM],
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// `input` must have exactly `input_dim()` elements, flattened in
    /// row-major `(sample, counter)` order.
    pub fn forward(&self, input: &[f32]) -> [f32; OUTPUT_DIM] {
        debug_assert_eq!(input.len(), self.input_dim);

        let h1 = relu_layer(input, &self.w1, &self.b1, self.input_dim, HIDDEN1_DIM);
        let h2 = relu_layer(&h1, &self.w2, &self.b2, HIDDEN1_DIM, HIDDEN2_DIM);
        let out = linear_layer(&h2, &self.w3, &self.b3, HIDDEN2_DIM, OUTPUT_DIM);

        let mut scores = [0.0f32; OUTPUT_DIM];
        scores.copy_from_slice(&out);
        scores
    }

    pub fn classify(&self, input: &[f32]) -> Verdict {
        Verdict::from_scores(&self.forward(input))
    }
}

impl Verdict {
    /// Argmax over `scores`, with ties resolved toward index 0
    /// (`Benign`) — a false negative is preferred over flip-flopping on
    /// numerically tied logits.
    pub fn from_scores(scores: &[f32; OUTPUT_DIM]) -> Verdict {
        if scores[1] > scores[0] {
            Verdict::Malicious
        } else {
            Verdict::Benign
        }
    }
}

fn linear_layer(input: &[f32], weights: &[f32], bias: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
    let mut output = vec![0.0f32; out_dim];
    for o in 0..out_dim {
        let row = &weights[o * in_dim..(o + 1) * in_dim];
        let mut acc = bias[o];
        for i in 0..in_dim {
            acc += row[i] * input[i];
        }
        output[o] = acc;
    }
    output
}

fn relu_layer(input: &[f32], weights: &[f32], bias: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
    let mut output = linear_layer(input, weights, bias, in_dim, out_dim);
    for v in output.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_model_ties_resolve_to_benign() {
        let model = ModelWeights::zeroed(40);
        let input = vec![1.0; 40];
        assert_eq!(model.classify(&input), Verdict::Benign);
    }

    #[test]
    fn forward_is_deterministic() {
        let model = ModelWeights::zeroed(40);
        let input: Vec<f32> = (0..40).map(|i| i as f32 * 0.1).collect();
        let a = model.forward(&input);
        let b = model.forward(&input);
        assert_eq!(a, b);
    }

    #[test]
    fn relu_clamps_negative_activations() {
        let h = relu_layer(&[1.0, -1.0], &[1.0, 0.0, 0.0, 1.0], &[0.0, 0.0], 2, 2);
        assert_eq!(h, vec![1.0, 0.0]);
    }

    #[test]
    fn verdict_ties_prefer_benign() {
        assert_eq!(Verdict::from_scores(&[0.5, 0.5]), Verdict::Benign);
        assert_eq!(Verdict::from_scores(&[0.4, 0.5]), Verdict::Malicious);
        assert_eq!(Verdict::from_scores(&[0.5, 0.4]), Verdict::Benign);
    }
}
