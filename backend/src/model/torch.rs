use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;
use ndarray::Array4;
use tch::{CModule, Device, Kind, Tensor};

use super::error::{InferenceError, ModelLoadError};
use super::{Classifier, DEFAULT_CHANNELS};

/// TorchScript classifier. The module receives the same NHWC batch as the
/// layers backend, so any layout change belongs inside the exported graph.
#[derive(Clone)]
pub struct TorchModel {
    model: Arc<Mutex<CModule>>,
    device: Device,
}

impl TorchModel {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device)?;
        info!("Loaded TorchScript model from {} on {:?}", path.display(), device);
        Ok(Self {
            model: Arc::new(Mutex::new(module)),
            device,
        })
    }
}

impl Classifier for TorchModel {
    fn channels(&self) -> usize {
        DEFAULT_CHANNELS
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let values: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_slice(&values).view(shape.as_slice()).to_device(self.device);

        let output = {
            let module = self
                .model
                .lock()
                .map_err(|e| InferenceError::Backend(e.to_string()))?;
            module.forward_ts(&[tensor])?
        };
        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);
        Ok(output_vec)
    }
}
