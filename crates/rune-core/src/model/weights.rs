//! Parameter storage and SafeTensors checkpoints.
//!
//! A checkpoint is a single `.safetensors` file. Tensors are stored in f32
//! under the names [`ModelConfig::parameter_shapes`] produces; the header
//! metadata carries the model config as JSON plus the training progress.
//!
//! ```ignore
//! use rune_core::model::Checkpoint;
//!
//! let ckpt = Checkpoint::load(Path::new("epoch-003.safetensors"), &Device::Cpu)?;
//! let model = Transformer::new(ckpt.config.clone(), &ckpt.weights)?;
//! ```

use super::ModelConfig;
use crate::error::{Result, RuneError};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use safetensors::{Dtype, SafeTensors, View};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

const FORMAT_KEY: &str = "format";
const FORMAT: &str = "rune";
const CONFIG_KEY: &str = "config";
const STEP_KEY: &str = "step";
const EPOCH_KEY: &str = "epoch";

/// Standard deviation of the random initializer.
const INIT_STD: f32 = 0.02;

/// Named model parameters.
#[derive(Debug, Clone)]
pub struct Weights {
    /// Tensors indexed by parameter name.
    tensors: BTreeMap<String, Tensor>,
    /// Device tensors live on.
    device: Device,
}

impl Weights {
    /// Create an empty parameter set.
    pub fn new(device: &Device) -> Self {
        Self {
            tensors: BTreeMap::new(),
            device: device.clone(),
        }
    }

    /// Random initialization for `config`, reproducible from `seed`.
    ///
    /// Matrices are drawn from N(0, 0.02); norm scales start at one.
    pub fn random(config: &ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, INIT_STD)
            .map_err(|e| RuneError::InvalidConfig(format!("initializer: {e}")))?;

        let mut weights = Self::new(device);
        for (name, shape) in config.parameter_shapes() {
            let numel: usize = shape.iter().product();
            let tensor = if shape.len() == 1 {
                Tensor::ones(shape.as_slice(), DType::F32, device)?
            } else {
                let values: Vec<f32> = (0..numel).map(|_| normal.sample(&mut rng)).collect();
                Tensor::from_vec(values, shape.as_slice(), device)?
            };
            weights.insert(name, tensor);
        }
        Ok(weights)
    }

    fn from_safetensors(safetensors: &SafeTensors<'_>, device: &Device) -> Result<Self> {
        let mut weights = Self::new(device);
        for (name, view) in safetensors.tensors() {
            let tensor = view_to_tensor(&name, &view, device)?;
            weights.insert(name, tensor);
        }
        Ok(weights)
    }

    /// Add or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| RuneError::MissingParameter(name.to_string()))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Iterate `(name, tensor)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of parameters tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are present.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Device the tensors live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check names and shapes against `config`.
    ///
    /// Every parameter the config implies must be present with exactly the
    /// implied shape, and nothing else may be present.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let expected = config.parameter_shapes();

        for (name, shape) in &expected {
            let tensor = self
                .tensors
                .get(name)
                .ok_or_else(|| RuneError::MissingParameter(name.clone()))?;
            if tensor.dims() != shape.as_slice() {
                return Err(RuneError::ShapeMismatch {
                    name: name.clone(),
                    expected: shape.clone(),
                    actual: tensor.dims().to_vec(),
                });
            }
        }

        if self.tensors.len() != expected.len() {
            let known: BTreeMap<&str, ()> = expected.iter().map(|(n, _)| (n.as_str(), ())).collect();
            if let Some(extra) = self.names().find(|n| !known.contains_key(n)) {
                return Err(RuneError::UnexpectedParameter(extra.to_string()));
            }
        }
        Ok(())
    }
}

/// Weights plus the config they were trained under and how far training got.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Model configuration.
    pub config: ModelConfig,
    /// Parameters.
    pub weights: Weights,
    /// Optimizer steps taken.
    pub step: usize,
    /// Completed epochs.
    pub epoch: usize,
}

impl Checkpoint {
    /// Bundle weights with their config. Fails if they disagree.
    pub fn new(config: ModelConfig, weights: Weights, step: usize, epoch: usize) -> Result<Self> {
        weights.validate(&config)?;
        Ok(Self {
            config,
            weights,
            step,
            epoch,
        })
    }

    /// Write the checkpoint to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = Vec::with_capacity(self.weights.len());
        for (name, tensor) in self.weights.iter() {
            tensors.push((name.to_string(), RawTensor::from_tensor(tensor)?));
        }

        let mut metadata = HashMap::new();
        metadata.insert(FORMAT_KEY.to_string(), FORMAT.to_string());
        metadata.insert(CONFIG_KEY.to_string(), serde_json::to_string(&self.config)?);
        metadata.insert(STEP_KEY.to_string(), self.step.to_string());
        metadata.insert(EPOCH_KEY.to_string(), self.epoch.to_string());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        safetensors::serialize_to_file(tensors, &Some(metadata), path)
            .map_err(|e| RuneError::Checkpoint(format!("failed to write {}: {e}", path.display())))?;

        tracing::info!(
            path = %path.display(),
            step = self.step,
            epoch = self.epoch,
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Load a checkpoint, taking the config from its own metadata.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let data = fs::read(path)?;
        let safetensors = deserialize(&data, path)?;
        let metadata = read_metadata(&data, path)?;

        let config_json = metadata.get(CONFIG_KEY).ok_or_else(|| {
            RuneError::Checkpoint(format!("{} carries no model config", path.display()))
        })?;
        let config: ModelConfig = serde_json::from_str(config_json)?;
        config.validate()?;

        let weights = Weights::from_safetensors(&safetensors, device)?;
        weights.validate(&config)?;

        Ok(Self {
            config,
            weights,
            step: parse_counter(&metadata, STEP_KEY, path)?,
            epoch: parse_counter(&metadata, EPOCH_KEY, path)?,
        })
    }

    /// Load a checkpoint and validate it against an externally supplied
    /// config rather than the one stored in the file.
    pub fn load_with_config(path: &Path, config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let data = fs::read(path)?;
        let safetensors = deserialize(&data, path)?;
        let metadata = read_metadata(&data, path)?;

        let weights = Weights::from_safetensors(&safetensors, device)?;
        weights.validate(config)?;

        if let Some(stored) = metadata.get(CONFIG_KEY) {
            if serde_json::from_str::<ModelConfig>(stored).ok().as_ref() != Some(config) {
                tracing::warn!(
                    path = %path.display(),
                    "Checkpoint config differs from the supplied config; shapes match"
                );
            }
        }

        Ok(Self {
            config: config.clone(),
            weights,
            step: parse_counter(&metadata, STEP_KEY, path)?,
            epoch: parse_counter(&metadata, EPOCH_KEY, path)?,
        })
    }
}

fn deserialize<'a>(data: &'a [u8], path: &Path) -> Result<SafeTensors<'a>> {
    SafeTensors::deserialize(data).map_err(|e| {
        RuneError::Checkpoint(format!("failed to deserialize {}: {e}", path.display()))
    })
}

fn read_metadata(data: &[u8], path: &Path) -> Result<HashMap<String, String>> {
    let (_, metadata) = SafeTensors::read_metadata(data).map_err(|e| {
        RuneError::Checkpoint(format!("failed to read header of {}: {e}", path.display()))
    })?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

fn parse_counter(metadata: &HashMap<String, String>, key: &str, path: &Path) -> Result<usize> {
    match metadata.get(key) {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            RuneError::Checkpoint(format!("bad {key} value {raw:?} in {}", path.display()))
        }),
    }
}

/// Convert a SafeTensors view to an f32 Candle tensor.
fn view_to_tensor(
    name: &str,
    view: &safetensors::tensor::TensorView<'_>,
    device: &Device,
) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    // Byte-wise decoding: the mmap'd buffer carries no alignment guarantee.
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => {
            return Err(RuneError::Checkpoint(format!(
                "unsupported dtype {other:?} for {name}"
            )));
        }
    };

    Ok(Tensor::from_vec(values, shape.as_slice(), device)?)
}

/// Owned little-endian f32 bytes ready for serialization.
struct RawTensor {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl RawTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let bytes = if cfg!(target_endian = "little") {
            bytemuck::cast_slice::<f32, u8>(&values).to_vec()
        } else {
            values.iter().flat_map(|v| v.to_le_bytes()).collect()
        };
        Ok(Self {
            shape: tensor.dims().to_vec(),
            bytes,
        })
    }
}

impl View for RawTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}
