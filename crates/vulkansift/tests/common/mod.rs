//! Shared helpers for the GPU integration tests.
//!
//! Tests skip (pass trivially) when no Vulkan runtime or device is
//! available, so they stay green on machines without a GPU.

use vulkansift::{SiftConfig, SiftInstance};

/// Try to build an instance; `None` means the environment has no usable
/// Vulkan device and the test should skip.
pub fn gpu_instance(config: &SiftConfig) -> Option<SiftInstance> {
    if vulkansift::load_vulkan().is_err() {
        eprintln!("skipping: Vulkan runtime not available");
        return None;
    }
    match SiftInstance::new(config) {
        Ok(instance) => Some(instance),
        Err(e) => {
            eprintln!("skipping: no usable GPU ({e})");
            None
        }
    }
}

/// A black image with a Gaussian blob at `(cx, cy)`.
pub fn gaussian_blob(width: u32, height: u32, cx: f32, cy: f32, sigma: f32) -> Vec<u8> {
    let mut image = vec![0u8; (width * height) as usize];
    let inv_denom = 1.0 / (2.0 * sigma * sigma);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let value = 200.0 * (-(dx * dx + dy * dy) * inv_denom).exp();
            image[(y * width + x) as usize] = value.round() as u8;
        }
    }
    image
}

/// Deterministic high-texture noise image (xorshift).
pub fn noise_image(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    let mut image = vec![0u8; (width * height) as usize];
    for pixel in &mut image {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *pixel = (state >> 24) as u8;
    }
    image
}

/// Translate an image by whole pixels, filling vacated space with black.
pub fn translate(image: &[u8], width: u32, height: u32, dx: i32, dy: i32) -> Vec<u8> {
    let mut shifted = vec![0u8; image.len()];
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let src_x = x - dx;
            let src_y = y - dy;
            if src_x >= 0 && src_x < width as i32 && src_y >= 0 && src_y < height as i32 {
                shifted[(y * width as i32 + x) as usize] =
                    image[(src_y * width as i32 + src_x) as usize];
            }
        }
    }
    shifted
}
