// SPDX-License-Identifier: CEPL-1.0
use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    let src_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap()).join("../../shaders");
    println!("cargo:rerun-if-changed={}", src_dir.display());

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let mut sources: Vec<PathBuf> = fs::read_dir(&src_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("vert" | "frag")))
        .collect();
    sources.sort();

    // (file name, bytes) table that shaders.rs includes
    let mut table = String::from("&[\n");
    for path in &sources {
        let name = path.file_name().unwrap().to_str().unwrap();
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("vert") => shaderc::ShaderKind::Vertex,
            _ => shaderc::ShaderKind::Fragment,
        };
        let src = fs::read_to_string(path).unwrap();
        let spv = comp
            .compile_into_spirv(&src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("{name}: {e}"));

        let spv_name = format!("{name}.spv");
        fs::write(out.join(&spv_name), spv.as_binary_u8()).unwrap();
        table.push_str(&format!(
            "    ({spv_name:?}, include_bytes!(concat!(env!(\"OUT_DIR\"), \"/{spv_name}\"))),\n"
        ));
        println!("cargo:rerun-if-changed={}", path.display());
    }
    table.push_str("]\n");
    fs::write(out.join("embedded_shaders.rs"), table).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
