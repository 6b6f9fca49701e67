//! Turns uploaded image bytes into the `[1, 28, 28, C]` tensor the model
//! was trained on.

use image::DynamicImage;
use ndarray::{Array3, Array4, Axis};

use crate::model::{INPUT_HEIGHT, INPUT_WIDTH};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("models with {0} channels are not supported")]
    UnsupportedChannels(usize),
    #[error("decoded image has an invalid shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Decode, stretch to 28x28 with bilinear sampling, scale to `[0, 1]` and
/// add the batch axis.
pub fn preprocess(bytes: &[u8], channels: usize) -> Result<Array4<f32>, PreprocessError> {
    let decoded = image::load_from_memory(bytes)?;
    let pixels = to_array(&decoded, channels)?;
    let mut resized = resize_bilinear(&pixels, INPUT_HEIGHT, INPUT_WIDTH);
    resized.mapv_inplace(|v| v / 255.0);
    Ok(resized.insert_axis(Axis(0)))
}

fn to_array(image: &DynamicImage, channels: usize) -> Result<Array3<f32>, PreprocessError> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let raw = match channels {
        1 => image.to_luma8().into_raw(),
        3 => image.to_rgb8().into_raw(),
        4 => image.to_rgba8().into_raw(),
        other => return Err(PreprocessError::UnsupportedChannels(other)),
    };
    let values = raw.into_iter().map(f32::from).collect();
    Ok(Array3::from_shape_vec((height, width, channels), values)?)
}

/// Bilinear resize without corner alignment or half-pixel centres: output
/// pixel `d` samples source coordinate `d * in / out`, clamping the far
/// neighbour to the last row or column.
pub fn resize_bilinear(input: &Array3<f32>, out_height: usize, out_width: usize) -> Array3<f32> {
    let (in_height, in_width, channels) = input.dim();
    let mut out = Array3::<f32>::zeros((out_height, out_width, channels));
    if in_height == 0 || in_width == 0 {
        return out;
    }
    let scale_y = in_height as f32 / out_height as f32;
    let scale_x = in_width as f32 / out_width as f32;

    for y in 0..out_height {
        let (y0, y1, dy) = sample(y, scale_y, in_height);
        for x in 0..out_width {
            let (x0, x1, dx) = sample(x, scale_x, in_width);
            for c in 0..channels {
                let top_left = input[[y0, x0, c]];
                let top_right = input[[y0, x1, c]];
                let bottom_left = input[[y1, x0, c]];
                let bottom_right = input[[y1, x1, c]];
                let top = top_left + (top_right - top_left) * dx;
                let bottom = bottom_left + (bottom_right - bottom_left) * dx;
                out[[y, x, c]] = top + (bottom - top) * dy;
            }
        }
    }
    out
}

fn sample(index: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let source = index as f32 * scale;
    let low = (source.floor() as usize).min(len - 1);
    let high = (low + 1).min(len - 1);
    (low, high, source - low as f32)
}
