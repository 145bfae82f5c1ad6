use std::{env, error::Error, fs, path::PathBuf};

const SHADERS: &[(&str, shaderc::ShaderKind)] = &[
    ("terrain.vert", shaderc::ShaderKind::Vertex),
    ("terrain.frag", shaderc::ShaderKind::Fragment),
];

fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);
    let src_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("shaders");

    let comp = shaderc::Compiler::new().expect("shaderc compiler");
    let mut opts = shaderc::CompileOptions::new().expect("shaderc options");

    // Render pass path only needs Vulkan 1.0 SPIR-V.
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for &(name, kind) in SHADERS {
        let path = src_dir.join(name);
        println!("cargo:rerun-if-changed={}", path.display());

        let source = fs::read_to_string(&path)?;
        let spv = comp.compile_into_spirv(&source, kind, name, "main", Some(&opts))?;
        if spv.get_num_warnings() > 0 {
            println!("cargo:warning={name}: {}", spv.get_warning_messages());
        }
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
