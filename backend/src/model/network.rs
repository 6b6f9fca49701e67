//! Forward pass for sequential channels-last networks on `ndarray`.
//!
//! Tensors flow between layers as `ArrayD<f32>`: NHWC for the image part of
//! the network and `(batch, features)` after flattening.

use ndarray::{Array1, Array2, Array4, ArrayD, Axis, Ix2, Ix4, s};

use super::error::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    Softmax,
    Elu,
    Softplus,
}

impl Activation {
    pub fn parse(name: &str) -> Option<Self> {
        let activation = match name {
            "linear" | "identity" => Self::Linear,
            "relu" => Self::Relu,
            "relu6" => Self::Relu6,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "softmax" => Self::Softmax,
            "elu" => Self::Elu,
            "softplus" => Self::Softplus,
            _ => return None,
        };
        Some(activation)
    }

    pub fn apply(self, mut x: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Self::Linear => {}
            Self::Relu => x.mapv_inplace(|v| v.max(0.0)),
            Self::Relu6 => x.mapv_inplace(|v| v.clamp(0.0, 6.0)),
            Self::Sigmoid => x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Self::Tanh => x.mapv_inplace(f32::tanh),
            Self::Elu => x.mapv_inplace(|v| if v > 0.0 { v } else { v.exp() - 1.0 }),
            Self::Softplus => x.mapv_inplace(|v| v.max(0.0) + (-v.abs()).exp().ln_1p()),
            Self::Softmax => softmax_last_axis(&mut x),
        }
        x
    }
}

fn softmax_last_axis(x: &mut ArrayD<f32>) {
    if x.ndim() == 0 {
        return;
    }
    let last = Axis(x.ndim() - 1);
    for mut lane in x.lanes_mut(last) {
        let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
}

impl Padding {
    /// Output length and leading pad for one spatial axis.
    fn output(self, input: usize, window: usize, stride: usize) -> (usize, usize) {
        match self {
            Self::Valid if input < window => (0, 0),
            Self::Valid => ((input - window) / stride + 1, 0),
            Self::Same => {
                let out = input.div_ceil(stride);
                let total = ((out.saturating_sub(1)) * stride + window).saturating_sub(input);
                (out, total / 2)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
}

#[derive(Debug, Clone)]
pub struct Conv2D {
    pub name: String,
    /// `[kernel_h, kernel_w, in_channels, filters]`
    pub kernel: Array4<f32>,
    pub bias: Option<Array1<f32>>,
    pub strides: (usize, usize),
    pub dilation: (usize, usize),
    pub padding: Padding,
    pub activation: Activation,
}

impl Conv2D {
    fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let shape = x.shape().to_vec();
        let x = x
            .into_dimensionality::<Ix4>()
            .map_err(|_| InferenceError::shape(&self.name, &shape))?;
        let (batch, height, width, channels) = x.dim();
        let (kh, kw, cin, filters) = self.kernel.dim();
        if channels != cin {
            return Err(InferenceError::shape(&self.name, &shape));
        }

        let (sh, sw) = self.strides;
        let (dh, dw) = self.dilation;
        let (out_h, pad_top) = self.padding.output(height, (kh - 1) * dh + 1, sh);
        let (out_w, pad_left) = self.padding.output(width, (kw - 1) * dw + 1, sw);
        if out_h == 0 || out_w == 0 {
            return Err(InferenceError::shape(&self.name, &shape));
        }

        let mut out = Array4::<f32>::zeros((batch, out_h, out_w, filters));
        for b in 0..batch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = out.slice_mut(s![b, oy, ox, ..]);
                    for ky in 0..kh {
                        let Some(iy) = source_index(oy * sh + ky * dh, pad_top, height) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = source_index(ox * sw + kx * dw, pad_left, width)
                            else {
                                continue;
                            };
                            let pixel = x.slice(s![b, iy, ix, ..]);
                            let weights = self.kernel.slice(s![ky, kx, .., ..]);
                            acc += &pixel.dot(&weights);
                        }
                    }
                }
            }
        }
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(self.activation.apply(out.into_dyn()))
    }
}

/// Maps a padded coordinate back into the input, `None` when it falls in
/// the padding.
fn source_index(padded: usize, pad: usize, len: usize) -> Option<usize> {
    padded.checked_sub(pad).filter(|&i| i < len)
}

#[derive(Debug, Clone)]
pub struct Pool2D {
    pub name: String,
    pub kind: PoolKind,
    pub pool: (usize, usize),
    pub strides: (usize, usize),
    pub padding: Padding,
}

impl Pool2D {
    fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let shape = x.shape().to_vec();
        let x = x
            .into_dimensionality::<Ix4>()
            .map_err(|_| InferenceError::shape(&self.name, &shape))?;
        let (batch, height, width, channels) = x.dim();
        let (ph, pw) = self.pool;
        let (sh, sw) = self.strides;
        let (out_h, pad_top) = self.padding.output(height, ph, sh);
        let (out_w, pad_left) = self.padding.output(width, pw, sw);
        if out_h == 0 || out_w == 0 {
            return Err(InferenceError::shape(&self.name, &shape));
        }

        let mut out = Array4::<f32>::zeros((batch, out_h, out_w, channels));
        for b in 0..batch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    for c in 0..channels {
                        let mut max = f32::NEG_INFINITY;
                        let mut sum = 0.0;
                        let mut count = 0usize;
                        for ky in 0..ph {
                            let Some(iy) = source_index(oy * sh + ky, pad_top, height) else {
                                continue;
                            };
                            for kx in 0..pw {
                                let Some(ix) = source_index(ox * sw + kx, pad_left, width)
                                else {
                                    continue;
                                };
                                let v = x[[b, iy, ix, c]];
                                max = max.max(v);
                                sum += v;
                                count += 1;
                            }
                        }
                        out[[b, oy, ox, c]] = match self.kind {
                            PoolKind::Max => max,
                            PoolKind::Average => sum / count.max(1) as f32,
                        };
                    }
                }
            }
        }
        Ok(out.into_dyn())
    }
}

#[derive(Debug, Clone)]
pub struct Dense {
    pub name: String,
    /// `[input_features, units]`
    pub kernel: Array2<f32>,
    pub bias: Option<Array1<f32>>,
    pub activation: Activation,
}

impl Dense {
    fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let shape = x.shape().to_vec();
        let x = x
            .into_dimensionality::<Ix2>()
            .map_err(|_| InferenceError::shape(&self.name, &shape))?;
        if x.ncols() != self.kernel.nrows() {
            return Err(InferenceError::shape(&self.name, &shape));
        }
        let mut out = x.dot(&self.kernel);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(self.activation.apply(out.into_dyn()))
    }
}

/// Batch normalization folded into a per-channel affine transform.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub name: String,
    pub scale: Array1<f32>,
    pub offset: Array1<f32>,
}

impl BatchNorm {
    pub fn new(
        name: String,
        gamma: Option<Array1<f32>>,
        beta: Option<Array1<f32>>,
        mean: Array1<f32>,
        variance: Array1<f32>,
        epsilon: f32,
    ) -> Self {
        let mut scale = variance.mapv(|v| 1.0 / (v + epsilon).sqrt());
        if let Some(gamma) = gamma {
            scale *= &gamma;
        }
        let mut offset = -(&mean * &scale);
        if let Some(beta) = beta {
            offset += &beta;
        }
        Self {
            name,
            scale,
            offset,
        }
    }

    fn forward(&self, mut x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        if x.shape().last() != Some(&self.scale.len()) {
            return Err(InferenceError::shape(&self.name, x.shape()));
        }
        x *= &self.scale;
        x += &self.offset;
        Ok(x)
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2D(Conv2D),
    Pool2D(Pool2D),
    GlobalPool { name: String, kind: PoolKind },
    Flatten { name: String },
    Dense(Dense),
    BatchNorm(BatchNorm),
    Activation(Activation),
    /// Input markers and dropout.
    Identity,
}

impl Layer {
    pub fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        match self {
            Self::Conv2D(conv) => conv.forward(x),
            Self::Pool2D(pool) => pool.forward(x),
            Self::GlobalPool { name, kind } => global_pool(name, *kind, x),
            Self::Flatten { name } => flatten(name, x),
            Self::Dense(dense) => dense.forward(x),
            Self::BatchNorm(norm) => norm.forward(x),
            Self::Activation(activation) => Ok(activation.apply(x)),
            Self::Identity => Ok(x),
        }
    }
}

fn global_pool(name: &str, kind: PoolKind, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
    let shape = x.shape().to_vec();
    let x = x
        .into_dimensionality::<Ix4>()
        .map_err(|_| InferenceError::shape(name, &shape))?;
    let (_, height, width, _) = x.dim();
    if height == 0 || width == 0 {
        return Err(InferenceError::shape(name, &shape));
    }
    let pooled = match kind {
        PoolKind::Max => x
            .fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b))
            .fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b)),
        PoolKind::Average => x.sum_axis(Axis(1)).sum_axis(Axis(1)) / (height * width) as f32,
    };
    Ok(pooled.into_dyn())
}

fn flatten(name: &str, x: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
    let Some(&batch) = x.shape().first() else {
        return Err(InferenceError::shape(name, x.shape()));
    };
    let features = x.shape()[1..].iter().product::<usize>();
    let values: Vec<f32> = x.iter().copied().collect();
    let flat = Array2::from_shape_vec((batch, features), values)
        .map_err(|_| InferenceError::shape(name, x.shape()))?;
    Ok(flat.into_dyn())
}

#[derive(Debug, Clone, Default)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        self.layers
            .iter()
            .try_fold(input, |x, layer| layer.forward(x))
    }
}
