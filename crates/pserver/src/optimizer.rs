//! Optimizer collaborator: per-parameter weights and update rule
//!
//! The store treats optimizers as opaque: it hands each one its gradients
//! and asks for weights and state when serving reads and checkpoints.

use bytes::Bytes;
use pserver_core::{ElementType, Error, Gradient, ParameterWithConfig, Result};
use serde::{Deserialize, Serialize};

/// Live optimizer instance owning one parameter's weights
pub trait Optimizer: Send {
    /// Element type of the weights
    fn element_type(&self) -> ElementType;

    /// Configuration blob supplied at creation
    fn config(&self) -> Bytes;

    /// Apply a gradient to the weights
    fn update(&mut self, gradient: &Gradient) -> Result<()>;

    /// Current weights
    ///
    /// The returned buffer is never modified afterwards; updates publish a
    /// new buffer instead.
    fn weights(&self) -> Bytes;

    /// Serialized optimizer state, restored through [`OptimizerFactory::create`]
    fn state(&self) -> Bytes;
}

/// Creates optimizer instances for new or recovered parameters
pub trait OptimizerFactory: Send + Sync {
    /// Create an optimizer, restoring `state` when recovering from a checkpoint
    fn create(&self, param: ParameterWithConfig, state: Option<Bytes>)
        -> Result<Box<dyn Optimizer>>;
}

/// SGD optimizer configuration, carried as JSON in the parameter config blob
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.0,
        }
    }
}

impl SgdConfig {
    /// Parse a config blob; an empty blob yields the defaults
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(raw).map_err(|e| Error::Optimizer {
            message: format!("invalid sgd config: {}", e),
        })
    }
}

/// Stochastic gradient descent with optional momentum
///
/// With momentum `m`, each update computes `v = m * v + g` and `w -= lr * v`.
/// The velocity `v` is the optimizer state, encoded as little-endian f64.
/// Integer weights are rounded to the nearest value after each update.
#[derive(Debug)]
pub struct SgdOptimizer {
    element_type: ElementType,
    config: Bytes,
    sgd: SgdConfig,
    weights: Bytes,
    velocity: Vec<f64>,
}

impl SgdOptimizer {
    pub fn new(param: ParameterWithConfig, state: Option<Bytes>) -> Result<Self> {
        let sgd = SgdConfig::parse(&param.config)?;
        let element_type = param.param.element_type;
        let velocity = match state {
            Some(state) if !state.is_empty() => {
                let velocity = decode_f64_le(&state)?;
                if velocity.len() != param.param.len() {
                    return Err(Error::Optimizer {
                        message: format!(
                            "state of {} has {} elements, weights have {}",
                            param.param.name,
                            velocity.len(),
                            param.param.len()
                        ),
                    });
                }
                velocity
            }
            _ => Vec::new(),
        };

        Ok(Self {
            element_type,
            config: param.config,
            sgd,
            weights: param.param.content,
            velocity,
        })
    }
}

impl Optimizer for SgdOptimizer {
    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn config(&self) -> Bytes {
        self.config.clone()
    }

    fn update(&mut self, gradient: &Gradient) -> Result<()> {
        if gradient.element_type != self.element_type {
            return Err(Error::Optimizer {
                message: format!(
                    "gradient {} has element type {:?}, parameter has {:?}",
                    gradient.name, gradient.element_type, self.element_type
                ),
            });
        }
        if gradient.content.len() != self.weights.len() {
            return Err(Error::Optimizer {
                message: format!(
                    "gradient {} has {} bytes, parameter has {}",
                    gradient.name,
                    gradient.content.len(),
                    self.weights.len()
                ),
            });
        }

        let mut weights = decode(self.element_type, &self.weights)?;
        let grads = decode(self.element_type, &gradient.content)?;
        let lr = self.sgd.learning_rate;

        if self.sgd.momentum != 0.0 {
            if self.velocity.len() != weights.len() {
                self.velocity = vec![0.0; weights.len()];
            }
            for ((w, v), g) in weights.iter_mut().zip(self.velocity.iter_mut()).zip(&grads) {
                *v = self.sgd.momentum * *v + g;
                *w -= lr * *v;
            }
        } else {
            for (w, g) in weights.iter_mut().zip(&grads) {
                *w -= lr * g;
            }
        }

        self.weights = encode(self.element_type, &weights);
        Ok(())
    }

    fn weights(&self) -> Bytes {
        self.weights.clone()
    }

    fn state(&self) -> Bytes {
        encode(ElementType::Float64, &self.velocity)
    }
}

/// Factory producing [`SgdOptimizer`] instances
#[derive(Debug, Clone, Copy, Default)]
pub struct SgdOptimizerFactory;

impl OptimizerFactory for SgdOptimizerFactory {
    fn create(
        &self,
        param: ParameterWithConfig,
        state: Option<Bytes>,
    ) -> Result<Box<dyn Optimizer>> {
        Ok(Box::new(SgdOptimizer::new(param, state)?))
    }
}

fn decode_f64_le(raw: &[u8]) -> Result<Vec<f64>> {
    decode(ElementType::Float64, raw)
}

/// Decode a little-endian element buffer into f64 values
fn decode(element_type: ElementType, raw: &[u8]) -> Result<Vec<f64>> {
    let size = element_type.size_bytes();
    if raw.len() % size != 0 {
        return Err(Error::Optimizer {
            message: format!(
                "buffer of {} bytes is not a whole number of {:?} elements",
                raw.len(),
                element_type
            ),
        });
    }

    Ok(raw
        .chunks_exact(size)
        .map(|chunk| {
            let mut b4 = [0u8; 4];
            let mut b8 = [0u8; 8];
            match element_type {
                ElementType::Int32 => {
                    b4.copy_from_slice(chunk);
                    i32::from_le_bytes(b4) as f64
                }
                ElementType::UInt32 => {
                    b4.copy_from_slice(chunk);
                    u32::from_le_bytes(b4) as f64
                }
                ElementType::Float32 => {
                    b4.copy_from_slice(chunk);
                    f32::from_le_bytes(b4) as f64
                }
                ElementType::Int64 => {
                    b8.copy_from_slice(chunk);
                    i64::from_le_bytes(b8) as f64
                }
                ElementType::UInt64 => {
                    b8.copy_from_slice(chunk);
                    u64::from_le_bytes(b8) as f64
                }
                ElementType::Float64 => {
                    b8.copy_from_slice(chunk);
                    f64::from_le_bytes(b8)
                }
            }
        })
        .collect())
}

/// Encode f64 values into a little-endian element buffer
fn encode(element_type: ElementType, values: &[f64]) -> Bytes {
    let mut out = Vec::with_capacity(values.len() * element_type.size_bytes());
    for &v in values {
        match element_type {
            ElementType::Int32 => out.extend_from_slice(&(v.round() as i32).to_le_bytes()),
            ElementType::UInt32 => out.extend_from_slice(&(v.round() as u32).to_le_bytes()),
            ElementType::Int64 => out.extend_from_slice(&(v.round() as i64).to_le_bytes()),
            ElementType::UInt64 => out.extend_from_slice(&(v.round() as u64).to_le_bytes()),
            ElementType::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            ElementType::Float64 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    Bytes::from(out)
}
