pub mod error;
pub mod layers;
pub mod network;
#[cfg(feature = "torch")]
pub mod torch;

use std::path::Path;
use std::sync::Arc;

use log::{error, info};
use ndarray::Array4;
use shared::{FruitClass, PredictionResponse};

pub use error::{InferenceError, ModelLoadError};

/// Spatial size every input is resized to before inference.
pub const INPUT_HEIGHT: usize = 28;
pub const INPUT_WIDTH: usize = 28;
pub const DEFAULT_CHANNELS: usize = 3;

/// A loaded, read-only classifier. Implementations must tolerate
/// concurrent `predict` calls from different workers.
pub trait Classifier: Send + Sync {
    /// Number of colour channels the model expects in the last axis.
    fn channels(&self) -> usize;

    /// Runs a forward pass over an NHWC batch and returns the flat scores.
    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// Shared handle to the startup model. Empty when loading failed and the
/// server was allowed to start anyway.
#[derive(Clone, Default)]
pub struct ModelHandle {
    inner: Option<Arc<dyn Classifier>>,
}

impl ModelHandle {
    pub fn loaded(model: Arc<dyn Classifier>) -> Self {
        Self { inner: Some(model) }
    }

    pub fn empty() -> Self {
        Self { inner: None }
    }

    pub fn get(&self) -> Option<&Arc<dyn Classifier>> {
        self.inner.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_some()
    }

    /// Loads the startup model. A failure is returned when `require_model`
    /// is set, otherwise it is logged and the handle stays empty.
    pub fn from_startup(path: &Path, require_model: bool) -> Result<Self, ModelLoadError> {
        info!("Loading model from {}", path.display());
        match load_model(path) {
            Ok(model) => {
                info!("Model loaded");
                Ok(Self::loaded(model))
            }
            Err(e) if require_model => Err(e),
            Err(e) => {
                error!("Failed to load model, serving without it: {}", e);
                Ok(Self::empty())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: FruitClass,
    pub probability: f32,
}

impl Prediction {
    /// Picks the highest score. The first index wins ties and NaN never wins.
    pub fn from_scores(scores: &[f32]) -> Result<Self, InferenceError> {
        if scores.is_empty() {
            return Err(InferenceError::EmptyOutput);
        }
        if scores.len() != FruitClass::LEN {
            return Err(InferenceError::LabelMismatch {
                expected: FruitClass::LEN,
                actual: scores.len(),
            });
        }
        let (index, probability) = argmax(scores).ok_or(InferenceError::InvalidOutput)?;
        let label = FruitClass::from_index(index).ok_or(InferenceError::LabelMismatch {
            expected: FruitClass::LEN,
            actual: scores.len(),
        })?;
        Ok(Self { label, probability })
    }

    pub fn to_response(&self) -> PredictionResponse {
        PredictionResponse {
            prediction: self.label,
            probability: format_probability(self.probability),
        }
    }
}

pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((i, score)),
        }
    }
    best
}

/// Two decimals, rounding exact halves away from zero the way
/// `Number.prototype.toFixed` does.
pub fn format_probability(score: f32) -> String {
    let value = f64::from(score);
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 {
        return "0.00".to_string();
    }

    let magnitude = value.abs();
    // Every f32 has at most 149 fractional decimal digits, so this is exact.
    let exact = format!("{magnitude:.149}");
    let fraction = exact.split_once('.').map_or("", |(_, fraction)| fraction);
    let tie = fraction.get(2..3) == Some("5") && fraction[3..].bytes().all(|b| b == b'0');
    let rounded = if tie {
        format!("{:.2}", magnitude + 0.001)
    } else {
        format!("{magnitude:.2}")
    };
    if value < 0.0 { format!("-{rounded}") } else { rounded }
}

/// Loads the model at `path` and checks it against the label set with a
/// dry run on a blank image.
pub fn load_model(path: &Path) -> Result<Arc<dyn Classifier>, ModelLoadError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let model: Arc<dyn Classifier> = match extension.as_str() {
        "json" => Arc::new(layers::LayersModel::load(path)?),
        #[cfg(feature = "torch")]
        "pt" | "pth" | "ts" => Arc::new(torch::TorchModel::load(path)?),
        #[cfg(not(feature = "torch"))]
        "pt" | "pth" | "ts" => {
            return Err(ModelLoadError::UnsupportedFormat(format!(
                "{} needs the `torch` feature",
                path.display()
            )));
        }
        other => {
            return Err(ModelLoadError::UnsupportedFormat(format!(
                "unknown extension {other:?} for {}",
                path.display()
            )));
        }
    };

    validate_output(model.as_ref())?;
    Ok(model)
}

fn validate_output(model: &dyn Classifier) -> Result<(), ModelLoadError> {
    let blank = Array4::<f32>::zeros((1, INPUT_HEIGHT, INPUT_WIDTH, model.channels()));
    let scores = model.predict(&blank)?;
    if scores.len() != FruitClass::LEN {
        return Err(ModelLoadError::LabelMismatch {
            expected: FruitClass::LEN,
            actual: scores.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn unique_maximum_selects_its_label() {
        for class in FruitClass::iter() {
            let mut scores = vec![0.1_f32; FruitClass::LEN];
            scores[class.index()] = 0.5;
            let prediction = Prediction::from_scores(&scores).unwrap();
            assert_eq!(prediction.label, class);
            assert_eq!(prediction.probability, 0.5);
        }
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let scores = [0.1, 0.4, 0.0, 0.4, 0.1, 0.4];
        let prediction = Prediction::from_scores(&scores).unwrap();
        assert_eq!(prediction.label, FruitClass::FreshBanana);
    }

    #[test]
    fn nan_scores_are_skipped() {
        let scores = [f32::NAN, 0.2, 0.3, f32::NAN, 0.1, 0.0];
        assert_eq!(argmax(&scores), Some((2, 0.3)));
        assert!(matches!(
            Prediction::from_scores(&[f32::NAN; 6]),
            Err(InferenceError::InvalidOutput)
        ));
    }

    #[test]
    fn rejects_empty_and_wrong_width_output() {
        assert!(matches!(
            Prediction::from_scores(&[]),
            Err(InferenceError::EmptyOutput)
        ));
        assert!(matches!(
            Prediction::from_scores(&[0.5, 0.5]),
            Err(InferenceError::LabelMismatch {
                expected: 6,
                actual: 2
            })
        ));
    }

    #[test]
    fn probability_has_two_decimals() {
        assert_eq!(format_probability(0.8734), "0.87");
        assert_eq!(format_probability(0.8), "0.80");
        assert_eq!(format_probability(1.0), "1.00");
        assert_eq!(format_probability(0.0), "0.00");
        assert_eq!(format_probability(0.996), "1.00");
    }

    #[test]
    fn exact_halves_round_up() {
        assert_eq!(format_probability(0.125), "0.13");
        assert_eq!(format_probability(0.625), "0.63");
        assert_eq!(format_probability(0.375), "0.38");
        assert_eq!(format_probability(-0.125), "-0.13");
        // Neither is an exact half once stored as f32.
        assert_eq!(format_probability(0.005), "0.00");
        assert_eq!(format_probability(0.015), "0.01");
    }

    #[test]
    fn oranges_scenario() {
        let scores = [0.05, 0.02, 0.8, 0.05, 0.03, 0.05];
        let response = Prediction::from_scores(&scores).unwrap().to_response();
        assert_eq!(response.prediction, FruitClass::FreshOranges);
        assert_eq!(response.probability, "0.80");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load_model(Path::new("model.onnx")).err().unwrap();
        assert!(matches!(err, ModelLoadError::UnsupportedFormat(_)));
    }

    #[cfg(not(feature = "torch"))]
    #[test]
    fn torchscript_needs_feature() {
        let err = load_model(Path::new("model.pt")).err().unwrap();
        assert!(err.to_string().contains("torch"));
    }

    #[test]
    fn startup_policy_decides_on_missing_model() {
        let path = Path::new("does/not/exist/model.json");
        assert!(ModelHandle::from_startup(path, true).is_err());
        let handle = ModelHandle::from_startup(path, false).unwrap();
        assert!(!handle.is_loaded());
    }

    #[test]
    fn missing_layers_model_is_io_error() {
        let err = load_model(Path::new("does/not/exist/model.json")).err().unwrap();
        assert!(matches!(err, ModelLoadError::Io { .. }));
    }
}
