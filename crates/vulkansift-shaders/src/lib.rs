//! Compute kernels for VulkanSift.
//!
//! GLSL sources are compiled to SPIR-V at build time and embedded; the
//! accessors hand out 4-byte-aligned words ready for shader module
//! creation. Kernels touching pyramid storage images exist in one variant
//! per precision, descriptor and match kernels in one variant per
//! descriptor format.

use std::sync::OnceLock;

/// Pyramid precision variant of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidFormat {
    F32,
    F16,
}

/// Descriptor format variant of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Ubc1,
    Ubc2,
}

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    assert!(
        bytes.len() % 4 == 0,
        "SPIR-V bytecode must be 4-byte aligned"
    );
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

macro_rules! embedded_spirv {
    ($file:literal) => {{
        static BYTES: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/", $file));
        static WORDS: OnceLock<Vec<u32>> = OnceLock::new();
        WORDS.get_or_init(|| bytes_to_spirv(BYTES)).as_slice()
    }};
}

/// Input conversion and optional 2x upsample into octave 0.
pub fn convert_input(format: PyramidFormat) -> &'static [u32] {
    match format {
        PyramidFormat::F32 => embedded_spirv!("convert_input_f32.spv"),
        PyramidFormat::F16 => embedded_spirv!("convert_input_f16.spv"),
    }
}

/// Separable Gaussian blur pass with discrete taps.
pub fn gaussian_blur(format: PyramidFormat) -> &'static [u32] {
    match format {
        PyramidFormat::F32 => embedded_spirv!("gaussian_blur_f32.spv"),
        PyramidFormat::F16 => embedded_spirv!("gaussian_blur_f16.spv"),
    }
}

/// Blur pass with linear-sampling paired taps.
pub fn gaussian_blur_interpolated(format: PyramidFormat) -> &'static [u32] {
    match format {
        PyramidFormat::F32 => embedded_spirv!("gaussian_blur_interpolated_f32.spv"),
        PyramidFormat::F16 => embedded_spirv!("gaussian_blur_interpolated_f16.spv"),
    }
}

/// Nearest-neighbour 2x decimation seeding the next octave.
pub fn downsample(format: PyramidFormat) -> &'static [u32] {
    match format {
        PyramidFormat::F32 => embedded_spirv!("downsample_f32.spv"),
        PyramidFormat::F16 => embedded_spirv!("downsample_f16.spv"),
    }
}

/// Difference of Gaussians over one octave.
pub fn difference_of_gaussian(format: PyramidFormat) -> &'static [u32] {
    match format {
        PyramidFormat::F32 => embedded_spirv!("difference_of_gaussian_f32.spv"),
        PyramidFormat::F16 => embedded_spirv!("difference_of_gaussian_f16.spv"),
    }
}

/// Extremum detection, sub-pixel refinement and rejection tests.
pub fn extract_keypoints() -> &'static [u32] {
    embedded_spirv!("extract_keypoints.spv")
}

/// Counter clamp and indirect dispatch derivation.
pub fn prepare_indirect() -> &'static [u32] {
    embedded_spirv!("prepare_indirect.spv")
}

/// Orientation histogram and multi-peak keypoint emission.
pub fn compute_orientation() -> &'static [u32] {
    embedded_spirv!("compute_orientation.spv")
}

/// Descriptor computation and final feature-record store.
pub fn compute_descriptors(kind: DescriptorKind) -> &'static [u32] {
    match kind {
        DescriptorKind::Ubc1 => embedded_spirv!("compute_descriptors_ubc1.spv"),
        DescriptorKind::Ubc2 => embedded_spirv!("compute_descriptors_ubc2.spv"),
    }
}

/// Brute-force 2-nearest-neighbor descriptor matching.
pub fn match_nearest_neighbors(kind: DescriptorKind) -> &'static [u32] {
    match kind {
        DescriptorKind::Ubc1 => embedded_spirv!("match_nearest_neighbors_ubc1.spv"),
        DescriptorKind::Ubc2 => embedded_spirv!("match_nearest_neighbors_ubc2.spv"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn all_kernels_are_valid_spirv() {
        let kernels = [
            convert_input(PyramidFormat::F32),
            convert_input(PyramidFormat::F16),
            gaussian_blur(PyramidFormat::F32),
            gaussian_blur(PyramidFormat::F16),
            gaussian_blur_interpolated(PyramidFormat::F32),
            gaussian_blur_interpolated(PyramidFormat::F16),
            downsample(PyramidFormat::F32),
            downsample(PyramidFormat::F16),
            difference_of_gaussian(PyramidFormat::F32),
            difference_of_gaussian(PyramidFormat::F16),
            extract_keypoints(),
            prepare_indirect(),
            compute_orientation(),
            compute_descriptors(DescriptorKind::Ubc1),
            compute_descriptors(DescriptorKind::Ubc2),
            match_nearest_neighbors(DescriptorKind::Ubc1),
            match_nearest_neighbors(DescriptorKind::Ubc2),
        ];
        for kernel in kernels {
            assert_eq!(kernel[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(kernel.len() > 20, "Kernel suspiciously small");
        }
    }
}
