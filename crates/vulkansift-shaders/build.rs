//! Build script compiling the GLSL compute kernels to SPIR-V.
//!
//! Pyramid-precision and descriptor-format variants are produced from the
//! same sources with macro definitions.

use shaderc::{CompileOptions, Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::Path;

/// Kernels that read or write pyramid storage images; compiled once per
/// precision with `PYR_FORMAT` defined.
const PRECISION_KERNELS: &[&str] = &[
    "convert_input",
    "gaussian_blur",
    "gaussian_blur_interpolated",
    "downsample",
    "difference_of_gaussian",
];

/// Kernels independent of precision and descriptor format.
const PLAIN_KERNELS: &[&str] = &[
    "extract_keypoints",
    "prepare_indirect",
    "compute_orientation",
];

/// Kernels whose feature-record layout depends on the descriptor format;
/// compiled once per format, with `DESC_UBC2` selecting float descriptors.
const DESCRIPTOR_KERNELS: &[&str] = &["compute_descriptors", "match_nearest_neighbors"];

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let out_dir = Path::new(&out_dir);
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for name in PRECISION_KERNELS {
        compile_kernel(
            &compiler,
            shader_dir,
            out_dir,
            name,
            "f32",
            &[("PYR_FORMAT", "r32f")],
        );
        compile_kernel(
            &compiler,
            shader_dir,
            out_dir,
            name,
            "f16",
            &[("PYR_FORMAT", "r16f")],
        );
    }

    for name in PLAIN_KERNELS {
        compile_kernel(&compiler, shader_dir, out_dir, name, "", &[]);
    }

    for name in DESCRIPTOR_KERNELS {
        compile_kernel(&compiler, shader_dir, out_dir, name, "ubc1", &[]);
        compile_kernel(
            &compiler,
            shader_dir,
            out_dir,
            name,
            "ubc2",
            &[("DESC_UBC2", "1")],
        );
    }
}

fn compile_kernel(
    compiler: &Compiler,
    shader_dir: &Path,
    out_dir: &Path,
    name: &str,
    variant: &str,
    defines: &[(&str, &str)],
) {
    let input_path = shader_dir.join(format!("{name}.comp"));
    let output_name = if variant.is_empty() {
        format!("{name}.spv")
    } else {
        format!("{name}_{variant}.spv")
    };
    let output_path = out_dir.join(output_name);

    let source = fs::read_to_string(&input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));

    let mut options = CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    for (key, value) in defines {
        options.add_macro_definition(key, Some(value));
    }

    let file_name = input_path.file_name().unwrap().to_str().unwrap();
    let result = compiler
        .compile_into_spirv(
            &source,
            ShaderKind::Compute,
            file_name,
            "main",
            Some(&options),
        )
        .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

    fs::write(
        &output_path,
        bytemuck::cast_slice::<u32, u8>(result.as_binary()),
    )
    .unwrap_or_else(|e| panic!("Failed to write shader {output_path:?}: {e}"));

    println!("Compiled {input_path:?} -> {output_path:?}");
}
