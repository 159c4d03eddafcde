//! Matching pipeline integration tests.
//!
//! All tests skip when no Vulkan device is present.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::{gaussian_blob, gpu_instance, noise_image, translate};
use image::{imageops, GrayImage};
use vulkansift::{Match2NN, SiftConfig, SiftError};

#[test]
fn matching_produces_one_record_per_a_feature() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(256, 256, 11);
    let shifted = translate(&image, 256, 256, 4, 2);

    instance.detect_features(&image, 256, 256, 0);
    instance.detect_features(&shifted, 256, 256, 1);
    let count_a = instance.get_features_number(0);
    let count_b = instance.get_features_number(1);
    assert!(count_a > 0 && count_b > 0);

    instance.match_features(0, 1);
    let matches = instance.download_matches();
    assert_eq!(matches.len() as u32, instance.get_matches_number());
    assert_eq!(matches.len() as u32, count_a);

    for (index, record) in matches.iter().enumerate() {
        assert_eq!(record.idx_a as usize, index);
        assert!(record.idx_b1 < count_b);
        assert!(record.dist_a_b1 <= record.dist_a_b2);
    }
}

#[test]
fn mutual_best_matches_agree() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = gaussian_blob(256, 256, 90.0, 140.0, 5.0);
    let shifted = translate(&image, 256, 256, 8, -3);

    instance.detect_features(&image, 256, 256, 0);
    instance.detect_features(&shifted, 256, 256, 1);

    instance.match_features(0, 1);
    let forward: Vec<Match2NN> = instance.download_matches();
    instance.match_features(1, 0);
    let backward: Vec<Match2NN> = instance.download_matches();

    // For the mutual subset, each side's best partner is the other
    let mut mutual = 0;
    for record in &forward {
        let reverse = &backward[record.idx_b1 as usize];
        if reverse.idx_b1 == record.idx_a {
            mutual += 1;
            assert_eq!(record.dist_a_b1.to_bits(), reverse.dist_a_b1.to_bits());
        }
    }
    assert!(mutual > 0, "no mutual matches on a translated pair");
}

#[test]
fn rotated_input_keeps_most_matches() {
    let config = SiftConfig::default();
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    // A textured but structured pattern: several blobs
    let mut pattern = vec![0u8; 256 * 256];
    for (cx, cy, sigma) in [
        (64.0, 64.0, 4.0),
        (180.0, 70.0, 6.0),
        (90.0, 180.0, 5.0),
        (200.0, 200.0, 3.5),
    ] {
        let blob = gaussian_blob(256, 256, cx, cy, sigma);
        for (dst, src) in pattern.iter_mut().zip(&blob) {
            *dst = dst.saturating_add(*src);
        }
    }

    let original = GrayImage::from_raw(256, 256, pattern.clone()).unwrap();
    let rotated = imageops::rotate90(&original);

    instance.detect_features(&pattern, 256, 256, 0);
    instance.detect_features(rotated.as_raw(), 256, 256, 1);

    let count_a = instance.get_features_number(0);
    let count_b = instance.get_features_number(1);
    assert!(count_a > 0 && count_b > 0);

    // Rotation should not change the feature count much
    let smaller = count_a.min(count_b) as f32;
    let larger = count_a.max(count_b) as f32;
    assert!(
        (larger - smaller) / larger <= 0.25,
        "rotation changed feature count too much: {count_a} vs {count_b}"
    );

    instance.match_features(0, 1);
    let forward = instance.download_matches();
    instance.match_features(1, 0);
    let backward = instance.download_matches();

    let mut good = 0;
    for record in &forward {
        let reverse = &backward[record.idx_b1 as usize];
        let ratio = record.dist_a_b1 / record.dist_a_b2.max(f32::MIN_POSITIVE);
        if reverse.idx_b1 == record.idx_a && ratio < 0.8 {
            good += 1;
        }
    }
    assert!(
        good as f32 >= 0.5 * smaller,
        "too few rotation-invariant matches: {good} of {smaller}"
    );
}

static ERROR_COUNT: AtomicU32 = AtomicU32::new(0);

fn count_errors(error: SiftError) {
    assert_eq!(error, SiftError::InvalidInput);
    ERROR_COUNT.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn matching_a_slot_against_itself_is_invalid() {
    let config = SiftConfig {
        on_error_callback: Some(count_errors),
        ..SiftConfig::default()
    };
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    let image = noise_image(128, 128, 5);
    instance.detect_features(&image, 128, 128, 0);

    ERROR_COUNT.store(0, Ordering::SeqCst);
    instance.match_features(0, 0);
    assert_eq!(ERROR_COUNT.load(Ordering::SeqCst), 1);
}

#[test]
fn matching_empty_slots_is_invalid() {
    let config = SiftConfig {
        on_error_callback: Some(count_errors),
        ..SiftConfig::default()
    };
    let Some(mut instance) = gpu_instance(&config) else {
        return;
    };

    // No detection ever ran: both slots are empty
    ERROR_COUNT.store(0, Ordering::SeqCst);
    instance.match_features(0, 1);
    assert_eq!(ERROR_COUNT.load(Ordering::SeqCst), 1);
    assert_eq!(instance.get_matches_number(), 0);
}
