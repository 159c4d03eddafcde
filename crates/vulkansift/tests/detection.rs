//! Detection pipeline integration tests.
//!
//! All tests skip when no Vulkan device is present.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::{gaussian_blob, gpu_instance, noise_image, translate};
use vulkansift::{Descriptor, DescriptorFormat, SiftConfig, SiftError};

#[test]
fn synthetic_blob_yields_a_centered_feature() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = gaussian_blob(256, 256, 128.0, 128.0, 4.0);
    instance.detect_features(&image, 256, 256, 0);

    let features = instance.download_features(0);
    assert!(!features.is_empty(), "no features on a synthetic blob");

    let best = features
        .iter()
        .filter(|f| (f.orig_x - 128.0).abs() <= 1.0 && (f.orig_y - 128.0).abs() <= 1.0)
        .min_by(|a, b| {
            (a.sigma - 4.0)
                .abs()
                .partial_cmp(&(b.sigma - 4.0).abs())
                .unwrap()
        });
    let best = best.expect("no feature within a pixel of the blob center");
    assert!(
        (best.sigma - 4.0).abs() <= 1.0,
        "blob scale off: sigma = {}",
        best.sigma
    );
}

#[test]
fn detected_features_satisfy_universal_invariants() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(320, 240, 0x1234_5678);
    instance.detect_features(&image, 320, 240, 0);

    let count = instance.get_features_number(0);
    assert!(count <= config.max_nb_sift_per_buffer);

    for feature in instance.download_features(0) {
        assert!(feature.orig_x >= 0.0 && feature.orig_x < 320.0);
        assert!(feature.orig_y >= 0.0 && feature.orig_y < 240.0);
        assert!(feature.sigma > 0.0);
        assert!(feature.theta >= 0.0 && feature.theta < std::f32::consts::TAU);
    }
}

#[test]
fn detection_is_deterministic() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(256, 256, 42);
    instance.detect_features(&image, 256, 256, 0);
    let mut first = instance.download_features(0);

    instance.detect_features(&image, 256, 256, 0);
    let mut second = instance.download_features(0);

    assert_eq!(first.len(), second.len());

    let key = |f: &vulkansift::Feature| {
        (
            f.octave,
            f.scale,
            f.orig_y.to_bits(),
            f.orig_x.to_bits(),
            f.orientation_id,
        )
    };
    first.sort_by_key(key);
    second.sort_by_key(key);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.orig_x.to_bits(), b.orig_x.to_bits());
        assert_eq!(a.orig_y.to_bits(), b.orig_y.to_bits());
        assert_eq!(a.sigma.to_bits(), b.sigma.to_bits());
        assert_eq!(a.theta.to_bits(), b.theta.to_bits());
    }
}

#[test]
fn translated_input_translates_features() {
    let config = SiftConfig {
        descriptor_format: DescriptorFormat::Ubc2,
        ..SiftConfig::default()
    };
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = gaussian_blob(256, 256, 100.0, 120.0, 5.0);
    let shifted = translate(&image, 256, 256, 10, 0);

    instance.detect_features(&image, 256, 256, 0);
    let original = instance.download_features(0);
    instance.detect_features(&shifted, 256, 256, 1);
    let moved = instance.download_features(1);

    assert!(!original.is_empty() && !moved.is_empty());

    for feature in &original {
        let partner = moved.iter().min_by(|a, b| {
            descriptor_distance(feature, a)
                .partial_cmp(&descriptor_distance(feature, b))
                .unwrap()
        });
        let partner = partner.unwrap();
        assert!(
            descriptor_distance(feature, partner) <= 0.1,
            "descriptor not translation invariant"
        );
        assert!(
            (partner.orig_x - feature.orig_x - 10.0).abs() <= 1.0,
            "feature did not move with the image"
        );
    }
}

fn descriptor_distance(a: &vulkansift::Feature, b: &vulkansift::Feature) -> f32 {
    match (&a.descriptor, &b.descriptor) {
        (Descriptor::Ubc2(da), Descriptor::Ubc2(db)) => da
            .iter()
            .zip(db)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        _ => panic!("expected UBC2 descriptors"),
    }
}

#[test]
fn feature_count_saturates_at_slot_capacity() {
    let config = SiftConfig {
        max_nb_sift_per_buffer: 10,
        ..SiftConfig::default()
    };
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(512, 512, 0xDEAD_BEEF);
    instance.detect_features(&image, 512, 512, 0);

    assert_eq!(instance.get_features_number(0), 10);
    assert_eq!(instance.download_features(0).len(), 10);
}

#[test]
fn slots_are_isolated() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let blob = gaussian_blob(256, 256, 64.0, 64.0, 4.0);
    let noise = noise_image(256, 256, 7);

    instance.detect_features(&blob, 256, 256, 0);
    let before = instance.download_features(0);

    instance.detect_features(&noise, 256, 256, 1);
    let after = instance.download_features(0);

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.orig_x.to_bits(), b.orig_x.to_bits());
        assert_eq!(a.orig_y.to_bits(), b.orig_y.to_bits());
        assert_eq!(a.theta.to_bits(), b.theta.to_bits());
    }
}

#[test]
fn upload_download_round_trips() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = gaussian_blob(256, 256, 128.0, 96.0, 4.0);
    instance.detect_features(&image, 256, 256, 0);
    let features = instance.download_features(0);
    assert!(!features.is_empty());

    instance.upload_features(&features, 1);
    assert_eq!(instance.get_features_number(1), features.len() as u32);

    let round_tripped = instance.download_features(1);
    for (a, b) in features.iter().zip(&round_tripped) {
        assert_eq!(a.orig_x.to_bits(), b.orig_x.to_bits());
        assert_eq!(a.sigma.to_bits(), b.sigma.to_bits());
        assert_eq!(a.orientation_id, b.orientation_id);
        match (&a.descriptor, &b.descriptor) {
            (Descriptor::Ubc1(da), Descriptor::Ubc1(db)) => assert_eq!(da, db),
            _ => panic!("unexpected descriptor format"),
        }
    }
}

static ERROR_COUNT: AtomicU32 = AtomicU32::new(0);

fn count_errors(error: SiftError) {
    assert_eq!(error, SiftError::InvalidInput);
    ERROR_COUNT.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn invalid_slot_reports_and_leaves_instance_usable() {
    let config = SiftConfig {
        on_error_callback: Some(count_errors),
        ..SiftConfig::default()
    };
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let invalid_slot = config.sift_buffer_count;
    ERROR_COUNT.store(0, Ordering::SeqCst);
    assert_eq!(instance.get_features_number(invalid_slot), 0);
    assert_eq!(ERROR_COUNT.load(Ordering::SeqCst), 1);

    // The instance survives the invalid call
    let image = gaussian_blob(128, 128, 64.0, 64.0, 3.0);
    instance.detect_features(&image, 128, 128, 0);
    assert!(instance.get_features_number(0) > 0);
}

#[test]
fn buffer_availability_follows_the_slot_state() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(512, 512, 3);
    instance.detect_features(&image, 512, 512, 0);
    // The detect may or may not have finished; after a blocking call the
    // slot must be available
    let _ = instance.is_buffer_available(0);
    let _ = instance.get_features_number(0);
    assert!(instance.is_buffer_available(0));
}

#[test]
fn scale_space_planes_can_be_downloaded() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = gaussian_blob(256, 256, 128.0, 128.0, 4.0);
    instance.detect_features(&image, 256, 256, 0);

    let nb_octaves = instance.scale_space_nb_octaves();
    assert!(nb_octaves >= 1);

    let (width, height) = instance.scale_space_octave_resolution(0);
    assert_eq!((width, height), (512, 512)); // upsampled base

    let plane = instance.download_scale_space_image(0, 0);
    assert_eq!(plane.len(), (width * height) as usize);
    assert!(plane.iter().all(|v| (-0.01..=1.01).contains(v)));
    assert!(plane.iter().any(|&v| v > 0.1), "blob missing from plane");

    let dog = instance.download_dog_image(0, 0);
    assert_eq!(dog.len(), (width * height) as usize);
}
