//! Loader for layers-model artifacts: a `model.json` holding a Keras
//! `Sequential` topology plus a weights manifest pointing at binary shards
//! stored next to it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use half::f16;
use log::{debug, info};
use ndarray::{Array1, Array2, Array4, ArrayD, Dimension, IxDyn};
use serde::Deserialize;
use serde_json::Value;

use super::error::{InferenceError, ModelLoadError};
use super::network::{
    Activation, BatchNorm, Conv2D, Dense, Layer, Network, Padding, Pool2D, PoolKind,
};
use super::{Classifier, DEFAULT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelArtifacts {
    #[serde(default)]
    format: Option<String>,
    model_topology: Value,
    #[serde(default)]
    weights_manifest: Vec<WeightGroup>,
}

#[derive(Debug, Deserialize)]
struct WeightGroup {
    paths: Vec<String>,
    weights: Vec<WeightSpec>,
}

#[derive(Debug, Deserialize)]
struct WeightSpec {
    name: String,
    shape: Vec<usize>,
    dtype: String,
    #[serde(default)]
    quantization: Option<Quantization>,
}

#[derive(Debug, Deserialize)]
struct Quantization {
    dtype: String,
    #[serde(default)]
    scale: f32,
    #[serde(default)]
    min: f32,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    class_name: String,
    config: SequentialConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SequentialConfig {
    Named { layers: Vec<LayerSpec> },
    Bare(Vec<LayerSpec>),
}

impl SequentialConfig {
    fn into_layers(self) -> Vec<LayerSpec> {
        match self {
            Self::Named { layers } | Self::Bare(layers) => layers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LayerSpec {
    class_name: String,
    config: Value,
}

/// Keras writes window sizes either as a scalar or as `[h, w]`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Pair {
    One(usize),
    Two([usize; 2]),
}

impl Pair {
    fn get(self) -> (usize, usize) {
        match self {
            Self::One(v) => (v, v),
            Self::Two([h, w]) => (h, w),
        }
    }
}

fn unit_pair() -> Pair {
    Pair::One(1)
}

fn default_pool() -> Pair {
    Pair::One(2)
}

fn yes() -> bool {
    true
}

fn default_epsilon() -> f32 {
    1e-3
}

fn default_axis() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct CommonConfig {
    name: String,
    #[serde(default)]
    batch_input_shape: Option<Vec<Option<usize>>>,
    #[serde(default)]
    batch_shape: Option<Vec<Option<usize>>>,
    #[serde(default)]
    data_format: Option<String>,
}

impl CommonConfig {
    fn input_shape(&self) -> Option<&[Option<usize>]> {
        self.batch_input_shape
            .as_deref()
            .or(self.batch_shape.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct ConvConfig {
    filters: usize,
    kernel_size: Pair,
    #[serde(default = "unit_pair")]
    strides: Pair,
    #[serde(default = "unit_pair")]
    dilation_rate: Pair,
    #[serde(default)]
    padding: Option<String>,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default = "yes")]
    use_bias: bool,
}

#[derive(Debug, Deserialize)]
struct PoolConfig {
    #[serde(default = "default_pool")]
    pool_size: Pair,
    #[serde(default)]
    strides: Option<Pair>,
    #[serde(default)]
    padding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DenseConfig {
    units: usize,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default = "yes")]
    use_bias: bool,
}

#[derive(Debug, Deserialize)]
struct ActivationConfig {
    activation: String,
}

#[derive(Debug, Deserialize)]
struct ReluConfig {
    #[serde(default)]
    max_value: Option<f32>,
    #[serde(default)]
    negative_slope: f32,
    #[serde(default)]
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct SoftmaxConfig {
    #[serde(default = "default_axis")]
    axis: i64,
}

#[derive(Debug, Deserialize)]
struct BatchNormConfig {
    #[serde(default = "last_axis")]
    axis: AxisSpec,
    #[serde(default = "default_epsilon")]
    epsilon: f32,
    #[serde(default = "yes")]
    center: bool,
    #[serde(default = "yes")]
    scale: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AxisSpec {
    One(i64),
    Many(Vec<i64>),
}

fn last_axis() -> AxisSpec {
    AxisSpec::One(-1)
}

impl AxisSpec {
    fn is_channels_last(&self) -> bool {
        match self {
            Self::One(axis) => *axis == -1 || *axis == 3,
            Self::Many(axes) => matches!(axes.as_slice(), [-1] | [3]),
        }
    }
}

/// A sequential network loaded from a layers-model artifact.
#[derive(Debug)]
pub struct LayersModel {
    network: Network,
    channels: usize,
}

impl LayersModel {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let artifacts: ModelArtifacts = serde_json::from_str(&raw)?;
        let model = Self::from_artifacts(artifacts, |shard| {
            let file = shard_path(path, shard);
            fs::read(&file).map_err(|source| ModelLoadError::Io { path: file, source })
        })?;
        info!(
            "Loaded layers model from {} ({} layers, {} channel input)",
            path.display(),
            model.network.depth(),
            model.channels
        );
        Ok(model)
    }

    /// Builds the model from a parsed artifact, fetching shards through
    /// `read_shard`.
    fn from_artifacts<F>(
        artifacts: ModelArtifacts,
        mut read_shard: F,
    ) -> Result<Self, ModelLoadError>
    where
        F: FnMut(&str) -> Result<Vec<u8>, ModelLoadError>,
    {
        if let Some(format) = &artifacts.format {
            if format != "layers-model" {
                return Err(ModelLoadError::UnsupportedFormat(format.clone()));
            }
        }

        let mut weights = WeightStore::default();
        for group in &artifacts.weights_manifest {
            let mut buffer = Vec::new();
            for shard in &group.paths {
                buffer.extend(read_shard(shard)?);
            }
            weights.decode_group(&group.weights, &buffer)?;
        }

        let topology = artifacts
            .model_topology
            .get("model_config")
            .cloned()
            .unwrap_or(artifacts.model_topology);
        let config: ModelConfig = serde_json::from_value(topology)?;
        if config.class_name != "Sequential" {
            return Err(ModelLoadError::UnsupportedTopology(config.class_name));
        }

        let specs = config.config.into_layers();
        if specs.is_empty() {
            return Err(ModelLoadError::UnsupportedTopology("empty Sequential".into()));
        }

        let mut channels = None;
        let mut layers = Vec::with_capacity(specs.len());
        for spec in specs {
            let common: CommonConfig = serde_json::from_value(spec.config.clone())?;
            if let Some(format) = &common.data_format {
                if format != "channels_last" {
                    return Err(ModelLoadError::invalid_config(
                        &common.name,
                        format!("data_format {format} is not supported"),
                    ));
                }
            }
            if channels.is_none() {
                if let Some(shape) = common.input_shape() {
                    channels = Some(input_channels(shape)?);
                }
            }
            let layer = build_layer(&spec.class_name, &common.name, spec.config, &mut weights)?;
            debug!("layer {} ({})", common.name, spec.class_name);
            layers.push(layer);
        }

        Ok(Self {
            network: Network::new(layers),
            channels: channels.unwrap_or(DEFAULT_CHANNELS),
        })
    }
}

impl Classifier for LayersModel {
    fn channels(&self) -> usize {
        self.channels
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let output = self.network.forward(input.clone().into_dyn())?;
        Ok(output.iter().copied().collect())
    }
}

fn input_channels(shape: &[Option<usize>]) -> Result<usize, ModelLoadError> {
    match shape {
        [_, height, width, Some(channels)]
            if height.is_none_or(|h| h == INPUT_HEIGHT)
                && width.is_none_or(|w| w == INPUT_WIDTH)
                && matches!(*channels, 1 | 3 | 4) =>
        {
            Ok(*channels)
        }
        _ => Err(ModelLoadError::InputShape(shape.to_vec())),
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(
    layer: &str,
    config: Value,
) -> Result<T, ModelLoadError> {
    serde_json::from_value(config).map_err(|e| ModelLoadError::invalid_config(layer, e.to_string()))
}

fn parse_activation(layer: &str, name: Option<&str>) -> Result<Activation, ModelLoadError> {
    let name = name.unwrap_or("linear");
    Activation::parse(name)
        .ok_or_else(|| ModelLoadError::invalid_config(layer, format!("activation {name}")))
}

fn parse_padding(layer: &str, padding: Option<&str>) -> Result<Padding, ModelLoadError> {
    match padding.unwrap_or("valid") {
        "valid" => Ok(Padding::Valid),
        "same" => Ok(Padding::Same),
        other => Err(ModelLoadError::invalid_config(layer, format!("padding {other}"))),
    }
}

fn build_layer(
    class_name: &str,
    name: &str,
    config: Value,
    weights: &mut WeightStore,
) -> Result<Layer, ModelLoadError> {
    let layer = match class_name {
        "InputLayer" | "Dropout" | "SpatialDropout2D" | "GaussianNoise" => Layer::Identity,
        "Conv2D" | "Convolution2D" => {
            let config: ConvConfig = parse_config(name, config)?;
            let (kh, kw) = config.kernel_size.get();
            let (sh, sw) = config.strides.get();
            let (dh, dw) = config.dilation_rate.get();
            if kh == 0 || kw == 0 || sh == 0 || sw == 0 || dh == 0 || dw == 0 {
                return Err(ModelLoadError::invalid_config(name, "zero-sized window"));
            }
            let kernel: Array4<f32> = weights.take(name, "kernel", None)?;
            let (kkh, kkw, _, filters) = kernel.dim();
            if (kkh, kkw, filters) != (kh, kw, config.filters) {
                return Err(ModelLoadError::WeightShape {
                    name: format!("{name}/kernel"),
                    expected: vec![kh, kw, kernel.dim().2, config.filters],
                    actual: kernel.shape().to_vec(),
                });
            }
            let bias = if config.use_bias {
                Some(weights.take(name, "bias", Some(config.filters))?)
            } else {
                None
            };
            Layer::Conv2D(Conv2D {
                name: name.to_string(),
                kernel,
                bias,
                strides: (sh, sw),
                dilation: (dh, dw),
                padding: parse_padding(name, config.padding.as_deref())?,
                activation: parse_activation(name, config.activation.as_deref())?,
            })
        }
        "MaxPooling2D" | "AveragePooling2D" => {
            let config: PoolConfig = parse_config(name, config)?;
            let pool = config.pool_size.get();
            let strides = config.strides.map(Pair::get).unwrap_or(pool);
            if pool.0 == 0 || pool.1 == 0 || strides.0 == 0 || strides.1 == 0 {
                return Err(ModelLoadError::invalid_config(name, "zero-sized window"));
            }
            Layer::Pool2D(Pool2D {
                name: name.to_string(),
                kind: if class_name == "MaxPooling2D" {
                    PoolKind::Max
                } else {
                    PoolKind::Average
                },
                pool,
                strides,
                padding: parse_padding(name, config.padding.as_deref())?,
            })
        }
        "GlobalAveragePooling2D" => Layer::GlobalPool {
            name: name.to_string(),
            kind: PoolKind::Average,
        },
        "GlobalMaxPooling2D" => Layer::GlobalPool {
            name: name.to_string(),
            kind: PoolKind::Max,
        },
        "Flatten" => Layer::Flatten {
            name: name.to_string(),
        },
        "Dense" => {
            let config: DenseConfig = parse_config(name, config)?;
            let kernel: Array2<f32> = weights.take(name, "kernel", None)?;
            if kernel.ncols() != config.units {
                return Err(ModelLoadError::WeightShape {
                    name: format!("{name}/kernel"),
                    expected: vec![kernel.nrows(), config.units],
                    actual: kernel.shape().to_vec(),
                });
            }
            let bias = if config.use_bias {
                Some(weights.take(name, "bias", Some(config.units))?)
            } else {
                None
            };
            Layer::Dense(Dense {
                name: name.to_string(),
                kernel,
                bias,
                activation: parse_activation(name, config.activation.as_deref())?,
            })
        }
        "Activation" => {
            let config: ActivationConfig = parse_config(name, config)?;
            Layer::Activation(parse_activation(name, Some(&config.activation))?)
        }
        "ReLU" => {
            let config: ReluConfig = parse_config(name, config)?;
            if config.negative_slope != 0.0 || config.threshold != 0.0 {
                return Err(ModelLoadError::invalid_config(
                    name,
                    "leaky or thresholded ReLU is not supported",
                ));
            }
            match config.max_value {
                None => Layer::Activation(Activation::Relu),
                Some(max) if max == 6.0 => Layer::Activation(Activation::Relu6),
                Some(max) => {
                    return Err(ModelLoadError::invalid_config(
                        name,
                        format!("max_value {max}"),
                    ));
                }
            }
        }
        "Softmax" => {
            let config: SoftmaxConfig = parse_config(name, config)?;
            if config.axis != -1 {
                return Err(ModelLoadError::invalid_config(
                    name,
                    format!("softmax axis {}", config.axis),
                ));
            }
            Layer::Activation(Activation::Softmax)
        }
        "BatchNormalization" => {
            let config: BatchNormConfig = parse_config(name, config)?;
            if !config.axis.is_channels_last() {
                return Err(ModelLoadError::invalid_config(
                    name,
                    "only the channel axis is supported",
                ));
            }
            let mean: Array1<f32> = weights.take(name, "moving_mean", None)?;
            let len = Some(mean.len());
            let variance = weights.take(name, "moving_variance", len)?;
            let gamma = if config.scale {
                Some(weights.take(name, "gamma", len)?)
            } else {
                None
            };
            let beta = if config.center {
                Some(weights.take(name, "beta", len)?)
            } else {
                None
            };
            Layer::BatchNorm(BatchNorm::new(
                name.to_string(),
                gamma,
                beta,
                mean,
                variance,
                config.epsilon,
            ))
        }
        other => return Err(ModelLoadError::UnsupportedLayer(other.to_string())),
    };
    Ok(layer)
}

/// Decoded weights keyed by their manifest name.
#[derive(Debug, Default)]
struct WeightStore {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightStore {
    fn decode_group(&mut self, specs: &[WeightSpec], buffer: &[u8]) -> Result<(), ModelLoadError> {
        let mut offset: usize = 0;
        for spec in specs {
            let width = element_width(spec)?;
            let overflow = || ModelLoadError::ShardSize {
                expected: usize::MAX,
                actual: buffer.len(),
            };
            let count = spec
                .shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(overflow)?;
            let end = count
                .checked_mul(width)
                .and_then(|len| offset.checked_add(len))
                .ok_or_else(overflow)?;
            let bytes = buffer.get(offset..end).ok_or(ModelLoadError::ShardSize {
                expected: end,
                actual: buffer.len(),
            })?;
            let values = decode_values(spec, bytes)?;
            let tensor = ArrayD::from_shape_vec(IxDyn(&spec.shape), values).map_err(|_| {
                ModelLoadError::WeightShape {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: vec![count],
                }
            })?;
            self.tensors.insert(spec.name.clone(), tensor);
            offset = end;
        }
        Ok(())
    }

    /// Finds `<layer>/<param>`, allowing an enclosing scope such as
    /// `sequential/dense/kernel`.
    fn lookup(&mut self, layer: &str, param: &str) -> Option<(String, ArrayD<f32>)> {
        let key = format!("{layer}/{param}");
        if let Some(tensor) = self.tensors.remove(&key) {
            return Some((key, tensor));
        }
        let suffix = format!("/{key}");
        let scoped = self.tensors.keys().find(|name| name.ends_with(&suffix))?.clone();
        self.tensors.remove(&scoped).map(|tensor| (scoped, tensor))
    }

    fn take<D: Dimension>(
        &mut self,
        layer: &str,
        param: &str,
        len: Option<usize>,
    ) -> Result<ndarray::Array<f32, D>, ModelLoadError> {
        let (name, tensor) = self
            .lookup(layer, param)
            .ok_or_else(|| ModelLoadError::MissingWeight(format!("{layer}/{param}")))?;
        let actual = tensor.shape().to_vec();
        if len.is_some_and(|len| actual.as_slice() != [len]) {
            return Err(ModelLoadError::WeightShape {
                name,
                expected: len.into_iter().collect(),
                actual,
            });
        }
        if actual.iter().any(|&d| d == 0) {
            return Err(ModelLoadError::WeightShape {
                name,
                expected: Vec::new(),
                actual,
            });
        }
        tensor
            .into_dimensionality::<D>()
            .map_err(|_| ModelLoadError::WeightShape {
                name,
                expected: Vec::new(),
                actual,
            })
    }
}

fn element_width(spec: &WeightSpec) -> Result<usize, ModelLoadError> {
    if let Some(quantization) = &spec.quantization {
        return match quantization.dtype.as_str() {
            "uint8" => Ok(1),
            "uint16" | "float16" => Ok(2),
            other => Err(ModelLoadError::UnsupportedDtype(format!("quantized {other}"))),
        };
    }
    match spec.dtype.as_str() {
        "float32" | "int32" => Ok(4),
        other => Err(ModelLoadError::UnsupportedDtype(other.to_string())),
    }
}

fn decode_values(spec: &WeightSpec, bytes: &[u8]) -> Result<Vec<f32>, ModelLoadError> {
    if let Some(q) = &spec.quantization {
        let values = match q.dtype.as_str() {
            "uint8" => bytes.iter().map(|&b| f32::from(b) * q.scale + q.min).collect(),
            "uint16" => bytes
                .chunks_exact(2)
                .map(|c| f32::from(u16::from_le_bytes([c[0], c[1]])) * q.scale + q.min)
                .collect(),
            "float16" => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            other => return Err(ModelLoadError::UnsupportedDtype(format!("quantized {other}"))),
        };
        return Ok(values);
    }
    let words = bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]);
    match spec.dtype.as_str() {
        "float32" => Ok(words.map(f32::from_le_bytes).collect()),
        "int32" => Ok(words.map(|w| i32::from_le_bytes(w) as f32).collect()),
        other => Err(ModelLoadError::UnsupportedDtype(other.to_string())),
    }
}

/// Where a model directory keeps its shards.
pub fn shard_path(model_path: &Path, shard: &str) -> PathBuf {
    model_path
        .parent()
        .map(|dir| dir.join(shard))
        .unwrap_or_else(|| PathBuf::from(shard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn artifacts(topology: Value, manifest: Value) -> ModelArtifacts {
        serde_json::from_value(json!({
            "format": "layers-model",
            "modelTopology": topology,
            "weightsManifest": manifest,
        }))
        .unwrap()
    }

    fn dense_only(bias: [f32; 6]) -> (ModelArtifacts, Vec<u8>) {
        let topology = json!({
            "class_name": "Sequential",
            "config": {
                "name": "sequential",
                "layers": [
                    {"class_name": "Flatten", "config": {"name": "flatten", "batch_input_shape": [null, 28, 28, 1]}},
                    {"class_name": "Dense", "config": {"name": "dense", "units": 6, "activation": "linear"}}
                ]
            }
        });
        let manifest = json!([{
            "paths": ["group1-shard1of1.bin"],
            "weights": [
                {"name": "dense/kernel", "shape": [784, 6], "dtype": "float32"},
                {"name": "dense/bias", "shape": [6], "dtype": "float32"}
            ]
        }]);
        let mut bytes = f32_bytes(&vec![0.0; 784 * 6]);
        bytes.extend(f32_bytes(&bias));
        (artifacts(topology, manifest), bytes)
    }

    #[test]
    fn dense_model_outputs_bias_for_blank_input() {
        let bias = [0.1, 0.2, 0.9, 0.0, 0.3, 0.4];
        let (artifacts, bytes) = dense_only(bias);
        let model = LayersModel::from_artifacts(artifacts, |_| Ok(bytes.clone())).unwrap();
        assert_eq!(model.channels(), 1);

        let input = ndarray::Array4::<f32>::zeros((1, 28, 28, 1));
        let scores = model.predict(&input).unwrap();
        assert_eq!(scores, bias.to_vec());
    }

    #[test]
    fn nested_model_config_and_scoped_weight_names() {
        let topology = json!({
            "keras_version": "2.15.0",
            "backend": "tensorflow",
            "model_config": {
                "class_name": "Sequential",
                "config": [
                    {"class_name": "Flatten", "config": {"name": "flatten", "batch_input_shape": [null, 28, 28, 3]}},
                    {"class_name": "Dropout", "config": {"name": "dropout", "rate": 0.5}},
                    {"class_name": "Dense", "config": {"name": "out", "units": 6, "activation": "softmax", "use_bias": false}}
                ]
            }
        });
        let manifest = json!([{
            "paths": ["a.bin", "b.bin"],
            "weights": [
                {"name": "sequential/out/kernel", "shape": [2352, 6], "dtype": "float32"}
            ]
        }]);
        let bytes = f32_bytes(&vec![0.0; 2352 * 6]);
        let (head, tail) = bytes.split_at(1000);
        let model = LayersModel::from_artifacts(artifacts(topology, manifest), |shard| {
            Ok(if shard == "a.bin" { head.to_vec() } else { tail.to_vec() })
        })
        .unwrap();
        assert_eq!(model.channels(), 3);

        let scores = model
            .predict(&ndarray::Array4::zeros((1, 28, 28, 3)))
            .unwrap();
        assert_eq!(scores.len(), 6);
        assert!(scores.iter().all(|&s| (s - 1.0 / 6.0).abs() < 1e-6));
    }

    #[test]
    fn conv_pool_stack_runs_end_to_end() {
        let topology = json!({
            "class_name": "Sequential",
            "config": {"layers": [
                {"class_name": "InputLayer", "config": {"name": "input", "batch_shape": [null, 28, 28, 3]}},
                {"class_name": "Conv2D", "config": {"name": "conv2d", "filters": 2, "kernel_size": [3, 3], "padding": "same", "activation": "relu", "data_format": "channels_last"}},
                {"class_name": "BatchNormalization", "config": {"name": "bn", "axis": [3], "epsilon": 0.001}},
                {"class_name": "MaxPooling2D", "config": {"name": "pool", "pool_size": [2, 2]}},
                {"class_name": "GlobalAveragePooling2D", "config": {"name": "gap"}},
                {"class_name": "Dense", "config": {"name": "dense", "units": 6}},
                {"class_name": "Softmax", "config": {"name": "softmax"}}
            ]}
        });
        let manifest = json!([{
            "paths": ["w.bin"],
            "weights": [
                {"name": "conv2d/kernel", "shape": [3, 3, 3, 2], "dtype": "float32"},
                {"name": "conv2d/bias", "shape": [2], "dtype": "float32"},
                {"name": "bn/gamma", "shape": [2], "dtype": "float32"},
                {"name": "bn/beta", "shape": [2], "dtype": "float32"},
                {"name": "bn/moving_mean", "shape": [2], "dtype": "float32"},
                {"name": "bn/moving_variance", "shape": [2], "dtype": "float32"},
                {"name": "dense/kernel", "shape": [2, 6], "dtype": "float32",
                 "quantization": {"dtype": "uint8", "scale": 0.5, "min": -1.0}},
                {"name": "dense/bias", "shape": [6], "dtype": "float32"}
            ]
        }]);
        let mut bytes = f32_bytes(&[0.01; 54]);
        bytes.extend(f32_bytes(&[0.0, 0.0]));
        bytes.extend(f32_bytes(&[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]));
        bytes.extend([2u8; 12]);
        bytes.extend(f32_bytes(&[0.0; 6]));

        let model =
            LayersModel::from_artifacts(artifacts(topology, manifest), |_| Ok(bytes.clone()))
                .unwrap();
        let input = ndarray::Array4::from_elem((1, 28, 28, 3), 0.5);
        let scores = model.predict(&input).unwrap();
        assert_eq!(scores.len(), 6);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn short_shards_are_rejected() {
        let (artifacts, bytes) = dense_only([0.0; 6]);
        let err = LayersModel::from_artifacts(artifacts, |_| Ok(bytes[..100].to_vec()))
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::ShardSize { .. }));
    }

    #[test]
    fn float16_weights_are_widened() {
        let spec: WeightSpec = serde_json::from_value(json!({
            "name": "dense/bias",
            "shape": [3],
            "dtype": "float32",
            "quantization": {"dtype": "float16"}
        }))
        .unwrap();
        assert_eq!(element_width(&spec).unwrap(), 2);

        let bytes: Vec<u8> = [0x3c00_u16, 0xc000, 0x3800]
            .iter()
            .flat_map(|bits| bits.to_le_bytes())
            .collect();
        assert_eq!(decode_values(&spec, &bytes).unwrap(), vec![1.0, -2.0, 0.5]);
    }

    #[test]
    fn oversized_manifest_shapes_are_rejected() {
        let spec: WeightSpec = serde_json::from_value(json!({
            "name": "dense/kernel",
            "shape": [usize::MAX, 4],
            "dtype": "float32"
        }))
        .unwrap();
        let err = WeightStore::default()
            .decode_group(&[spec], &[0; 16])
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::ShardSize { actual: 16, .. }));
    }

    #[test]
    fn missing_weight_is_reported() {
        let topology = json!({"class_name": "Sequential", "config": {"layers": [
            {"class_name": "Dense", "config": {"name": "dense", "units": 6}}
        ]}});
        let err = LayersModel::from_artifacts(artifacts(topology, json!([])), |_| Ok(Vec::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::MissingWeight(ref name) if name == "dense/kernel"));
    }

    #[test]
    fn functional_models_and_unknown_layers_are_rejected() {
        let functional = json!({"class_name": "Functional", "config": {"layers": []}});
        let err = LayersModel::from_artifacts(artifacts(functional, json!([])), |_| Ok(Vec::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::UnsupportedTopology(_)));

        let lstm = json!({"class_name": "Sequential", "config": {"layers": [
            {"class_name": "LSTM", "config": {"name": "lstm"}}
        ]}});
        let err = LayersModel::from_artifacts(artifacts(lstm, json!([])), |_| Ok(Vec::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::UnsupportedLayer(ref name) if name == "LSTM"));
    }

    #[test]
    fn input_must_be_28_by_28() {
        assert_eq!(input_channels(&[None, Some(28), Some(28), Some(1)]).unwrap(), 1);
        assert_eq!(input_channels(&[None, None, None, Some(3)]).unwrap(), 3);
        assert!(input_channels(&[None, Some(32), Some(32), Some(3)]).is_err());
        assert!(input_channels(&[None, Some(28), Some(28), Some(2)]).is_err());
        assert!(input_channels(&[None, Some(784)]).is_err());
    }

    #[test]
    fn shard_paths_are_relative_to_model() {
        assert_eq!(
            shard_path(Path::new("modelo_js/model.json"), "group1-shard1of1.bin"),
            PathBuf::from("modelo_js/group1-shard1of1.bin")
        );
    }
}
