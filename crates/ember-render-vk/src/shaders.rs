// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V blobs for every pipeline, keyed by module and stage.
//!
//! GLSL sources live in `shaders/` at the repository root. The build script
//! compiles them to `<name>.<vert|frag>.spv` and embeds the result; a
//! directory of blobs can stand in for the embedded set.

use crate::device::Device;
use crate::error::{CheckVk, VkError, VkResult};
use ash::vk;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// `(file name, SPIR-V)` for every stage under `shaders/`.
static EMBEDDED: &[(&str, &[u8])] = include!(concat!(env!("OUT_DIR"), "/embedded_shaders.rs"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderId {
    Basic,
    BasicColorQuad,
    Particle,
    PointParticle,
    NullModel,
    Model,
    Sprite,
    Polygon,
    PolygonLightmap,
    PolygonWarp,
    Beam,
    Skybox,
    DynamicLight,
    Shadows,
    PostProcess,
    WorldWarp,
}

impl ShaderId {
    pub fn stem(self) -> &'static str {
        match self {
            ShaderId::Basic => "basic",
            ShaderId::BasicColorQuad => "basic_color_quad",
            ShaderId::Particle => "particle",
            ShaderId::PointParticle => "point_particle",
            ShaderId::NullModel => "nullmodel",
            ShaderId::Model => "model",
            ShaderId::Sprite => "sprite",
            ShaderId::Polygon => "polygon",
            ShaderId::PolygonLightmap => "polygon_lmap",
            ShaderId::PolygonWarp => "polygon_warp",
            ShaderId::Beam => "beam",
            ShaderId::Skybox => "skybox",
            ShaderId::DynamicLight => "d_light",
            ShaderId::Shadows => "shadows",
            ShaderId::PostProcess => "postprocess",
            ShaderId::WorldWarp => "world_warp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

pub fn file_name(id: ShaderId, stage: ShaderStage) -> String {
    format!("{}.{}.spv", id.stem(), stage.extension())
}

/// Decodes a SPIR-V blob into words, rejecting anything without the magic
/// number (in either byte order).
pub fn decode_spirv(name: &str, bytes: &[u8]) -> VkResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|_| VkError::InvalidShader(name.to_owned()))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        _ => Err(VkError::InvalidShader(name.to_owned())),
    }
}

#[derive(Default)]
pub struct ShaderLibrary {
    blobs: HashMap<(ShaderId, ShaderStage), Vec<u32>>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ShaderId, stage: ShaderStage, bytes: &[u8]) -> VkResult<()> {
        let words = decode_spirv(&file_name(id, stage), bytes)?;
        self.blobs.insert((id, stage), words);
        Ok(())
    }

    /// Loads each required module from `dir`. Any missing or malformed file
    /// fails the whole load.
    pub fn load_dir(
        dir: &Path,
        required: impl IntoIterator<Item = (ShaderId, ShaderStage)>,
    ) -> VkResult<Self> {
        Self::collect(required, |name| {
            let path = dir.join(name);
            std::fs::read(&path)
                .map(Cow::Owned)
                .map_err(|_| VkError::InvalidShader(path.display().to_string()))
        })
    }

    /// Takes each required module from the set compiled into the binary.
    pub fn embedded(required: impl IntoIterator<Item = (ShaderId, ShaderStage)>) -> VkResult<Self> {
        Self::collect(required, |name| {
            EMBEDDED
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, bytes)| Cow::Borrowed(*bytes))
                .ok_or_else(|| VkError::InvalidShader(name.to_owned()))
        })
    }

    fn collect<'b>(
        required: impl IntoIterator<Item = (ShaderId, ShaderStage)>,
        mut read: impl FnMut(&str) -> VkResult<Cow<'b, [u8]>>,
    ) -> VkResult<Self> {
        let mut lib = Self::new();
        for (id, stage) in required {
            if lib.blobs.contains_key(&(id, stage)) {
                continue;
            }
            let name = file_name(id, stage);
            let bytes = read(&name)?;
            lib.insert(id, stage, &bytes)?;
            debug!("vk: loaded shader {}", name);
        }
        Ok(lib)
    }

    pub fn get(&self, id: ShaderId, stage: ShaderStage) -> VkResult<&[u32]> {
        self.blobs
            .get(&(id, stage))
            .map(Vec::as_slice)
            .ok_or_else(|| VkError::InvalidShader(file_name(id, stage)))
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Shader module that is destroyed when dropped; modules only need to live
/// until their pipeline is created.
pub struct ShaderModule<'a> {
    device: &'a Device,
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
}

impl<'a> ShaderModule<'a> {
    pub fn new(
        device: &'a Device,
        lib: &ShaderLibrary,
        id: ShaderId,
        stage: ShaderStage,
    ) -> VkResult<Self> {
        let code = lib.get(id, stage)?;
        let ci = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { device.raw().create_shader_module(&ci, None) }
            .check("vkCreateShaderModule")?;
        Ok(Self {
            device,
            module,
            stage,
        })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn file_names_follow_stem_and_stage() {
        assert_eq!(file_name(ShaderId::PolygonLightmap, ShaderStage::Vertex), "polygon_lmap.vert.spv");
        assert_eq!(file_name(ShaderId::WorldWarp, ShaderStage::Fragment), "world_warp.frag.spv");
    }

    #[test]
    fn spirv_needs_magic_and_whole_words() {
        assert!(decode_spirv("ok", &blob(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0])).is_ok());
        assert!(matches!(
            decode_spirv("text", b"#version 450\n\0\0\0"),
            Err(VkError::InvalidShader(_))
        ));
        assert!(decode_spirv("short", &[0x03, 0x02, 0x23]).is_err());
        assert!(decode_spirv("empty", &[]).is_err());
    }

    #[test]
    fn missing_module_is_named_in_the_error() {
        let lib = ShaderLibrary::new();
        let err = lib.get(ShaderId::Beam, ShaderStage::Vertex).unwrap_err();
        assert!(err.to_string().contains("beam.vert.spv"));
        assert!(err.is_fatal());
    }

    #[test]
    fn every_pipeline_stage_is_embedded() {
        let required = crate::pipeline::required_shaders();
        let lib = ShaderLibrary::embedded(required.iter().copied()).unwrap();
        assert_eq!(lib.len(), required.len());
        for (id, stage) in required {
            assert_eq!(lib.get(id, stage).unwrap()[0], SPIRV_MAGIC);
        }
    }

    #[test]
    fn load_dir_reads_each_pair_once() {
        let dir = std::env::temp_dir().join(format!("ember-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let words = blob(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        std::fs::write(dir.join("basic.vert.spv"), &words).unwrap();
        std::fs::write(dir.join("basic.frag.spv"), &words).unwrap();

        let required = [
            (ShaderId::Basic, ShaderStage::Vertex),
            (ShaderId::Basic, ShaderStage::Fragment),
            (ShaderId::Basic, ShaderStage::Vertex),
        ];
        let lib = ShaderLibrary::load_dir(&dir, required).unwrap();
        assert_eq!(lib.len(), 2);

        let missing = ShaderLibrary::load_dir(&dir, [(ShaderId::Sprite, ShaderStage::Vertex)]);
        assert!(matches!(missing, Err(VkError::InvalidShader(p)) if p.contains("sprite.vert.spv")));
        std::fs::remove_dir_all(&dir).ok();
    }
}
