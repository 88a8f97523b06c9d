use anyhow::{Context, Result};
use naga::{
    ShaderStage,
    back::spv,
    front::glsl::{Frontend, Options},
    valid::{Capabilities, ValidationFlags, Validator},
};
use std::{env, fs, path::Path};

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=shaders");

    compile_shaders()?;

    Ok(())
}

fn compile_shaders() -> Result<()> {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR")?;
    let out_dir = env::var("OUT_DIR")?;
    let shaders_in_dir = Path::new(&manifest_dir).join("shaders");

    for entry in fs::read_dir(shaders_in_dir)? {
        let path = entry?.path();
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let shader_stage = match ext {
            "vert" => ShaderStage::Vertex,
            "frag" => ShaderStage::Fragment,
            "comp" => ShaderStage::Compute,
            _ => continue,
        };
        println!("cargo:rerun-if-changed={}", path.display());

        let source = fs::read_to_string(&path)?;
        let module = Frontend::default()
            .parse(&Options::from(shader_stage), &source)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {:?}", path.display(), e))?;

        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| anyhow::anyhow!("invalid shader {}: {:?}", path.display(), e))?;

        let words = spv::write_vec(&module, &info, &spv::Options::default(), None)
            .with_context(|| format!("failed to emit SPIR-V for {}", path.display()))?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("shader file name is not valid UTF-8")?;
        let output = Path::new(&out_dir).join(format!("{}.spv", file_name));
        fs::write(output, bytemuck::cast_slice::<u32, u8>(&words))?;
    }

    Ok(())
}
