//! Dense network inference
//!
//! Minimal forward-pass execution for the pre-trained artifacts. Weights
//! are row-major per output neuron; no training code lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Softmax,
    Linear,
}

/// One fully-connected layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `weights[out][in]`
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    pub activation: Activation,
}

impl DenseLayer {
    fn forward(&self, input: &[f32]) -> Vec<f32> {
        let mut out: Vec<f32> = self
            .weights
            .iter()
            .zip(self.bias.iter())
            .map(|(row, b)| {
                row.iter()
                    .zip(input.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f32>()
                    + b
            })
            .collect();

        match self.activation {
            Activation::Relu => {
                for v in &mut out {
                    if *v < 0.0 {
                        *v = 0.0;
                    }
                }
            }
            Activation::Sigmoid => {
                for v in &mut out {
                    *v = 1.0 / (1.0 + (-*v).exp());
                }
            }
            Activation::Softmax => softmax_in_place(&mut out),
            Activation::Linear => {}
        }
        out
    }

    fn input_dim(&self) -> usize {
        self.weights.first().map(|row| row.len()).unwrap_or(0)
    }

    fn output_dim(&self) -> usize {
        self.weights.len()
    }
}

fn softmax_in_place(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    // Shift by the max for numerical stability
    let max = values.iter().cloned().fold(f32::MIN, f32::max);
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// A stack of dense layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<DenseLayer>,
}

impl Mlp {
    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let mut current = input.to_vec();
        for layer in &self.layers {
            current = layer.forward(&current);
        }
        current
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.input_dim()).unwrap_or(0)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.output_dim()).unwrap_or(0)
    }
}
