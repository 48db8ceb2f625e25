use anyhow::Result;
use image::RgbImage;
use ndarray::{Array4, ArrayView4};

use crate::error::VisionError;

/// RGB8 image to a [1, 3, H, W] tensor in [0, 1].
pub fn image_to_tensor(img: &RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();
    let mut out = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, px) in img.enumerate_pixels() {
        for c in 0..3 {
            out[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
        }
    }
    out
}

/// [1, 3, H, W] tensor in [0, 1] back to RGB8. Values are clamped first.
pub fn tensor_to_image(tensor: ArrayView4<f32>) -> Result<RgbImage> {
    let shape = tensor.shape();
    if shape[0] != 1 || shape[1] != 3 {
        return Err(VisionError::BadModelOutput(format!(
            "expected a [1, 3, H, W] image tensor, got {:?}",
            shape
        ))
        .into());
    }
    let (height, width) = (shape[2] as u32, shape[3] as u32);

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let channel = |c: usize| {
            let v = tensor[[0, c, y as usize, x as usize]];
            let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
            (v * 255.0).round() as u8
        };
        image::Rgb([channel(0), channel(1), channel(2)])
    }))
}
