//! SIFT feature and match records.
//!
//! The `Raw*` structs mirror the std430 layout written by the GPU kernels
//! and must stay field-for-field compatible with the shader structs in
//! `vulkansift-shaders`. The public [`Feature`] type carries the descriptor
//! as a tagged variant so callers never see the packed representation.

use bytemuck::{Pod, Zeroable};

use crate::config::DescriptorFormat;
use crate::constants::{DESCRIPTOR_SIZE, DESCRIPTOR_WORDS};

/// A 128-element SIFT descriptor in its configured storage format.
#[derive(Clone, Copy)]
pub enum Descriptor {
    /// Unnormalized bytes, `0..=255`.
    Ubc1([u8; DESCRIPTOR_SIZE]),
    /// Unit-norm floats, `[0, 1]`.
    Ubc2([f32; DESCRIPTOR_SIZE]),
}

impl Descriptor {
    pub fn format(&self) -> DescriptorFormat {
        match self {
            Self::Ubc1(_) => DescriptorFormat::Ubc1,
            Self::Ubc2(_) => DescriptorFormat::Ubc2,
        }
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ubc1(_) => f.write_str("Descriptor::Ubc1([..])"),
            Self::Ubc2(_) => f.write_str("Descriptor::Ubc2([..])"),
        }
    }
}

/// A detected SIFT feature.
#[derive(Debug, Clone, Copy)]
pub struct Feature {
    /// Refined x coordinate in octave space.
    pub x: f32,
    /// Refined y coordinate in octave space.
    pub y: f32,
    /// X coordinate in the input image's coordinate system.
    pub orig_x: f32,
    /// Y coordinate in the input image's coordinate system.
    pub orig_y: f32,
    /// Scale in input-image pixels.
    pub sigma: f32,
    /// Dominant orientation in radians, `[0, 2*pi)`.
    pub theta: f32,
    /// Pyramid octave the extremum was found in.
    pub octave: u32,
    /// Discrete scale index within the octave.
    pub scale: u32,
    /// Index among the orientations emitted for the same keypoint.
    pub orientation_id: u32,
    pub descriptor: Descriptor,
}

/// GPU-side feature record with a packed byte descriptor (UBC1).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RawFeatureU8 {
    pub x: f32,
    pub y: f32,
    pub orig_x: f32,
    pub orig_y: f32,
    pub sigma: f32,
    pub theta: f32,
    pub octave: u32,
    pub scale: u32,
    pub orientation_id: u32,
    /// 128 descriptor bytes packed little-endian into 32 words.
    pub descriptor: [u32; DESCRIPTOR_WORDS],
}

/// GPU-side feature record with a float descriptor (UBC2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RawFeatureF32 {
    pub x: f32,
    pub y: f32,
    pub orig_x: f32,
    pub orig_y: f32,
    pub sigma: f32,
    pub theta: f32,
    pub octave: u32,
    pub scale: u32,
    pub orientation_id: u32,
    pub descriptor: [f32; DESCRIPTOR_SIZE],
}

/// One 2-nearest-neighbor match record for a feature of slot A.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Match2NN {
    /// Feature index in slot A.
    pub idx_a: u32,
    /// Nearest neighbor index in slot B.
    pub idx_b1: u32,
    /// L2 descriptor distance to the nearest neighbor.
    pub dist_a_b1: f32,
    /// Second-nearest neighbor index in slot B.
    pub idx_b2: u32,
    /// L2 descriptor distance to the second-nearest neighbor.
    pub dist_a_b2: f32,
}

impl From<&RawFeatureU8> for Feature {
    fn from(raw: &RawFeatureU8) -> Self {
        let mut descriptor = [0u8; DESCRIPTOR_SIZE];
        descriptor.copy_from_slice(bytemuck::cast_slice(&raw.descriptor));
        Self {
            x: raw.x,
            y: raw.y,
            orig_x: raw.orig_x,
            orig_y: raw.orig_y,
            sigma: raw.sigma,
            theta: raw.theta,
            octave: raw.octave,
            scale: raw.scale,
            orientation_id: raw.orientation_id,
            descriptor: Descriptor::Ubc1(descriptor),
        }
    }
}

impl From<&RawFeatureF32> for Feature {
    fn from(raw: &RawFeatureF32) -> Self {
        Self {
            x: raw.x,
            y: raw.y,
            orig_x: raw.orig_x,
            orig_y: raw.orig_y,
            sigma: raw.sigma,
            theta: raw.theta,
            octave: raw.octave,
            scale: raw.scale,
            orientation_id: raw.orientation_id,
            descriptor: Descriptor::Ubc2(raw.descriptor),
        }
    }
}

impl Feature {
    /// Convert to the packed UBC1 GPU record.
    ///
    /// Returns `None` when the descriptor variant does not match.
    pub fn to_raw_u8(&self) -> Option<RawFeatureU8> {
        let Descriptor::Ubc1(bytes) = self.descriptor else {
            return None;
        };
        let mut descriptor = [0u32; DESCRIPTOR_WORDS];
        bytemuck::cast_slice_mut::<u32, u8>(&mut descriptor).copy_from_slice(&bytes);
        Some(RawFeatureU8 {
            x: self.x,
            y: self.y,
            orig_x: self.orig_x,
            orig_y: self.orig_y,
            sigma: self.sigma,
            theta: self.theta,
            octave: self.octave,
            scale: self.scale,
            orientation_id: self.orientation_id,
            descriptor,
        })
    }

    /// Convert to the UBC2 GPU record.
    ///
    /// Returns `None` when the descriptor variant does not match.
    pub fn to_raw_f32(&self) -> Option<RawFeatureF32> {
        let Descriptor::Ubc2(descriptor) = self.descriptor else {
            return None;
        };
        Some(RawFeatureF32 {
            x: self.x,
            y: self.y,
            orig_x: self.orig_x,
            orig_y: self.orig_y,
            sigma: self.sigma,
            theta: self.theta,
            octave: self.octave,
            scale: self.scale,
            orientation_id: self.orientation_id,
            descriptor,
        })
    }
}

impl DescriptorFormat {
    /// Byte stride of one feature record in a slot buffer.
    pub fn record_size(self) -> u64 {
        match self {
            Self::Ubc1 => std::mem::size_of::<RawFeatureU8>() as u64,
            Self::Ubc2 => std::mem::size_of::<RawFeatureF32>() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_records_match_std430_strides() {
        // 9 scalars + 32 packed words
        assert_eq!(std::mem::size_of::<RawFeatureU8>(), 164);
        // 9 scalars + 128 floats
        assert_eq!(std::mem::size_of::<RawFeatureF32>(), 548);
        assert_eq!(std::mem::size_of::<Match2NN>(), 20);
    }

    #[test]
    fn ubc1_round_trip_is_byte_identical() {
        let mut raw = RawFeatureU8::zeroed();
        raw.x = 12.5;
        raw.y = 7.25;
        raw.sigma = 1.6;
        raw.theta = 3.0;
        raw.orientation_id = 2;
        for (i, word) in raw.descriptor.iter_mut().enumerate() {
            *word = u32::try_from(i).unwrap() * 0x0101_0101;
        }

        let feature = Feature::from(&raw);
        let back = feature.to_raw_u8().unwrap();
        assert_eq!(bytemuck::bytes_of(&raw), bytemuck::bytes_of(&back));
        assert!(feature.to_raw_f32().is_none());
    }

    #[test]
    fn ubc2_round_trip_is_byte_identical() {
        let mut raw = RawFeatureF32::zeroed();
        raw.orig_x = 320.0;
        raw.orig_y = 240.0;
        raw.sigma = 4.0;
        for (i, v) in raw.descriptor.iter_mut().enumerate() {
            *v = i as f32 / 128.0;
        }

        let feature = Feature::from(&raw);
        let back = feature.to_raw_f32().unwrap();
        assert_eq!(bytemuck::bytes_of(&raw), bytemuck::bytes_of(&back));
        assert!(feature.to_raw_u8().is_none());
    }
}
