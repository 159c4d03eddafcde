//! GPU-accelerated SIFT feature detection and matching on Vulkan.
//!
//! The library detects SIFT keypoints in grayscale images and computes
//! 128-element orientation-invariant descriptors, then matches feature
//! sets with a brute-force 2-nearest-neighbor search. All heavy work runs
//! as compute workloads; host-visible staging buffers carry uploads and
//! downloads.
//!
//! ```no_run
//! use vulkansift::{SiftConfig, SiftInstance};
//!
//! vulkansift::load_vulkan()?;
//! {
//!     let mut instance = SiftInstance::new(&SiftConfig::default())?;
//!     let image = vec![0u8; 640 * 480];
//!     instance.detect_features(&image, 640, 480, 0);
//!     let features = instance.download_features(0);
//!     println!("{} features", features.len());
//! }
//! vulkansift::unload_vulkan();
//! # Ok::<(), vulkansift::SiftError>(())
//! ```
//!
//! `detect_features` and `match_features` are non-blocking; every download
//! and upload blocks until the touched slot is idle. An instance is not
//! safe for concurrent use from multiple threads.

mod debug_window;
mod detector;
mod instance;
mod matcher;
mod scale_space;
mod staging;

pub use debug_window::ExternalWindowInfo;
pub use instance::SiftInstance;
pub use scale_space::{blur_increments, GaussianKernel};
pub use vulkansift_core::{
    Descriptor, DescriptorFormat, ErrorCallback, Feature, ImageSize, LogLevel, Match2NN,
    PyramidPrecision, SiftConfig, SiftError, SiftResult,
};

use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Load the Vulkan library for the whole process.
///
/// Must be called before the first instance is created; pair it with
/// [`unload_vulkan`] after the last instance is destroyed. Calling it
/// again is a no-op.
pub fn load_vulkan() -> SiftResult<()> {
    vulkansift_gpu::load_vulkan().map_err(|e| {
        tracing::error!("Failed to load Vulkan: {e}");
        SiftError::Vulkan
    })
}

/// Release the process-wide Vulkan library. All instances must already be
/// destroyed. No-op when not loaded.
pub fn unload_vulkan() {
    vulkansift_gpu::unload_vulkan();
}

/// Names of the available Vulkan-capable GPUs, in the order accepted by
/// `SiftConfig::gpu_device_index`.
pub fn available_gpus() -> SiftResult<Vec<String>> {
    vulkansift_gpu::enumerate_gpu_names().map_err(|e| {
        tracing::error!("GPU enumeration failed: {e}");
        SiftError::Vulkan
    })
}

static LOG_FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Set the process-wide log verbosity.
///
/// Installs a `tracing` subscriber on first use; later calls only reload
/// the filter. Has no effect on the filter when the application already
/// installed its own subscriber.
pub fn set_log_level(level: LogLevel) {
    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
        LogLevel::None => "off",
    };

    let handle = LOG_FILTER.get_or_init(|| {
        let (filter, handle) = reload::Layer::new(EnvFilter::new(directive));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        handle
    });
    let _ = handle.reload(EnvFilter::new(directive));
}
