// SPDX-License-Identifier: CEPL-1.0

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "builtin-shaders")]
    builtin::compile();
}

#[cfg(feature = "builtin-shaders")]
mod builtin {
    use std::{env, fs, path::PathBuf};

    // (source, kind, output) compiled into OUT_DIR with entry point "main".
    const SHADERS: [(&str, shaderc::ShaderKind, &str); 2] = [
        ("shaders/mesh.vert", shaderc::ShaderKind::Vertex, "mesh.vert.spv"),
        ("shaders/mesh.frag", shaderc::ShaderKind::Fragment, "mesh.frag.spv"),
    ];

    pub fn compile() {
        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR set by cargo"));

        let comp = shaderc::Compiler::new().expect("shaderc compiler");
        let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
        opts.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_1 as u32,
        );
        opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

        for (src_path, kind, out_name) in SHADERS {
            println!("cargo:rerun-if-changed={src_path}");
            let src = fs::read_to_string(src_path)
                .unwrap_or_else(|e| panic!("read {src_path}: {e}"));
            let spv = comp
                .compile_into_spirv(&src, kind, src_path, "main", Some(&opts))
                .unwrap_or_else(|e| panic!("compile {src_path}: {e}"));
            fs::write(out.join(out_name), spv.as_binary_u8())
                .unwrap_or_else(|e| panic!("write {out_name}: {e}"));
        }
    }
}
