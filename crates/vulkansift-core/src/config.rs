//! User configuration.
//!
//! A [`SiftConfig`] is immutable after instance creation: buffer counts,
//! descriptor format and pyramid precision are baked into the GPU pipelines.

use crate::error::{SiftError, SiftResult};

/// Storage format of the 128-element descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptorFormat {
    /// Unnormalized bytes in `0..=255` (Lowe/UBC convention).
    #[default]
    Ubc1,
    /// Unit-norm floats in `[0, 1]`.
    Ubc2,
}

/// Floating-point precision of the Gaussian and DoG pyramids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PyramidPrecision {
    Float16,
    #[default]
    Float32,
}

/// A width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Callback invoked when a void-returning API call fails.
pub type ErrorCallback = fn(SiftError);

/// Instance configuration.
#[derive(Debug, Clone)]
pub struct SiftConfig {
    /// Largest accepted input image; staging and pyramid memory are sized
    /// for it at creation time.
    pub input_image_max_size: ImageSize,
    /// Number of GPU feature slots.
    pub sift_buffer_count: u32,
    /// Capacity of one feature slot; detection saturates at this count.
    pub max_nb_sift_per_buffer: u32,
    /// Double the input with bilinear interpolation before octave 0.
    pub use_upsampling: bool,
    /// Scales per octave (S). The pyramid holds S+3 Gaussian and S+2 DoG
    /// images per octave.
    pub nb_scales_per_octave: u32,
    /// Octave count; 0 derives it from the input resolution.
    pub nb_octaves: u32,
    /// Blur assumed to be already present in the input image.
    pub input_blur_level: f32,
    /// Target blur of octave 0 scale 0 (Lowe's sigma_0).
    pub seed_scale_sigma: f32,
    /// DoG contrast rejection threshold.
    pub intensity_threshold: f32,
    /// Principal-curvature ratio bound (r) for edge rejection.
    pub edge_threshold: f32,
    /// Iteration budget of the sub-pixel refinement solver.
    pub max_nb_refinement_steps: u32,
    pub descriptor_format: DescriptorFormat,
    pub pyramid_precision_mode: PyramidPrecision,
    /// Single-pass 1-D blur taps paired through the bilinear sampler.
    pub use_hardware_interpolated_blur: bool,
    /// Index into the device list returned by `available_gpus`; `None`
    /// selects the highest-scoring device.
    pub gpu_device_index: Option<usize>,
    /// Invoked on fatal or invalid-input conditions from void-returning
    /// calls.
    pub on_error_callback: Option<ErrorCallback>,
}

impl Default for SiftConfig {
    fn default() -> Self {
        Self {
            input_image_max_size: ImageSize {
                width: 1920,
                height: 1080,
            },
            sift_buffer_count: 2,
            max_nb_sift_per_buffer: 100_000,
            use_upsampling: true,
            nb_scales_per_octave: 3,
            nb_octaves: 0,
            input_blur_level: 0.5,
            seed_scale_sigma: 1.6,
            intensity_threshold: 0.04,
            edge_threshold: 10.0,
            max_nb_refinement_steps: 5,
            descriptor_format: DescriptorFormat::default(),
            pyramid_precision_mode: PyramidPrecision::default(),
            use_hardware_interpolated_blur: false,
            gpu_device_index: None,
            on_error_callback: None,
        }
    }
}

impl SiftConfig {
    /// Reject configurations the pipelines cannot be built for.
    pub fn validate(&self) -> SiftResult<()> {
        let ImageSize { width, height } = self.input_image_max_size;
        if width == 0 || height == 0 {
            return Err(SiftError::InvalidInput);
        }
        if self.sift_buffer_count == 0 || self.max_nb_sift_per_buffer == 0 {
            return Err(SiftError::InvalidInput);
        }
        if self.nb_scales_per_octave == 0 {
            return Err(SiftError::InvalidInput);
        }
        if self.nb_octaves > crate::constants::MAX_OCTAVES {
            return Err(SiftError::InvalidInput);
        }
        if self.seed_scale_sigma <= 0.0 || self.input_blur_level < 0.0 {
            return Err(SiftError::InvalidInput);
        }
        if self.intensity_threshold < 0.0 || self.edge_threshold < 1.0 {
            return Err(SiftError::InvalidInput);
        }
        Ok(())
    }

    /// Pyramid base resolution for an input, accounting for upsampling.
    pub fn base_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if self.use_upsampling {
            (width * 2, height * 2)
        } else {
            (width, height)
        }
    }

    /// Octave count used for an input of the given size.
    ///
    /// A configured value of 0 derives `floor(log2(min_dim)) - 3`, clamped
    /// to at least one octave. Explicit values are capped so the smallest
    /// octave keeps at least 8 pixels per side.
    pub fn octave_count(&self, width: u32, height: u32) -> u32 {
        let (base_w, base_h) = self.base_dimensions(width, height);
        let min_dim = base_w.min(base_h).max(1);
        let log2 = 31 - min_dim.leading_zeros();
        if self.nb_octaves == 0 {
            log2.saturating_sub(3)
                .max(1)
                .min(crate::constants::MAX_OCTAVES)
        } else {
            let cap = log2.saturating_sub(2).max(1);
            self.nb_octaves.min(cap).min(crate::constants::MAX_OCTAVES)
        }
    }

    /// Resolution of one octave's images for an input of the given size.
    pub fn octave_resolution(&self, width: u32, height: u32, octave: u32) -> (u32, u32) {
        let (base_w, base_h) = self.base_dimensions(width, height);
        ((base_w >> octave).max(1), (base_h >> octave).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SiftConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = SiftConfig {
            sift_buffer_count: 0,
            ..SiftConfig::default()
        };
        assert_eq!(config.validate(), Err(SiftError::InvalidInput));

        config.sift_buffer_count = 1;
        config.nb_scales_per_octave = 0;
        assert_eq!(config.validate(), Err(SiftError::InvalidInput));

        config.nb_scales_per_octave = 3;
        config.edge_threshold = 0.5;
        assert_eq!(config.validate(), Err(SiftError::InvalidInput));
    }

    #[test]
    fn auto_octave_count_follows_min_dimension() {
        let config = SiftConfig {
            use_upsampling: false,
            ..SiftConfig::default()
        };
        // 256x256 -> log2 = 8 -> 5 octaves
        assert_eq!(config.octave_count(256, 256), 5);
        // 640x480 -> min 480, log2 = 8 -> 5 octaves
        assert_eq!(config.octave_count(640, 480), 5);
        // Tiny inputs still get one octave
        assert_eq!(config.octave_count(8, 8), 1);
    }

    #[test]
    fn upsampling_doubles_base_resolution() {
        let config = SiftConfig::default();
        assert_eq!(config.base_dimensions(640, 480), (1280, 960));
        // One extra octave relative to the non-upsampled case
        assert_eq!(config.octave_count(256, 256), 6);
    }

    #[test]
    fn explicit_octave_count_is_capped() {
        let config = SiftConfig {
            use_upsampling: false,
            nb_octaves: 12,
            ..SiftConfig::default()
        };
        // 64 -> log2 = 6 -> cap at 4 so the last octave keeps 8px per side
        assert_eq!(config.octave_count(64, 64), 4);
    }

    #[test]
    fn octave_resolution_halves_per_level() {
        let config = SiftConfig {
            use_upsampling: false,
            ..SiftConfig::default()
        };
        assert_eq!(config.octave_resolution(640, 480, 0), (640, 480));
        assert_eq!(config.octave_resolution(640, 480, 2), (160, 120));
    }
}
