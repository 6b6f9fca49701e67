use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),
    #[error("unsupported model topology: {0}")]
    UnsupportedTopology(String),
    #[error("unsupported layer type {0}")]
    UnsupportedLayer(String),
    #[error("invalid config for layer {layer}: {reason}")]
    InvalidLayerConfig { layer: String, reason: String },
    #[error("weight {0} not found in manifest")]
    MissingWeight(String),
    #[error("weight {name} has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("unsupported weight dtype {0}")]
    UnsupportedDtype(String),
    #[error("weight shards are {actual} bytes, manifest needs {expected}")]
    ShardSize { expected: usize, actual: usize },
    #[error("model input {0:?} is not compatible with 28x28 images")]
    InputShape(Vec<Option<usize>>),
    #[error("model produces {actual} scores but there are {expected} labels")]
    LabelMismatch { expected: usize, actual: usize },
    #[error("dry run failed: {0}")]
    Inference(#[from] InferenceError),
    #[cfg(feature = "torch")]
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl ModelLoadError {
    pub fn invalid_config(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLayerConfig {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("layer {layer} got input of shape {shape:?}")]
    Shape { layer: String, shape: Vec<usize> },
    #[error("model returned no scores")]
    EmptyOutput,
    #[error("model returned no finite score")]
    InvalidOutput,
    #[error("model returned {actual} scores for {expected} labels")]
    LabelMismatch { expected: usize, actual: usize },
    #[error("backend failure: {0}")]
    Backend(String),
    #[cfg(feature = "torch")]
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl InferenceError {
    pub fn shape(layer: impl Into<String>, shape: &[usize]) -> Self {
        Self::Shape {
            layer: layer.into(),
            shape: shape.to_vec(),
        }
    }
}
