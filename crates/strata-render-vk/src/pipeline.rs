// SPDX-License-Identifier: CEPL-1.0
//! Shader loading, render pass, graphics pipelines and the on-disk pipeline
//! cache.

use std::ffi::CStr;
use std::fmt::Write as _;
use std::fs;
use std::io::Cursor;
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use strata_render::{RenderError, TileVertex};
use tracing::{debug, info, warn};

const ENTRY_POINT: &CStr = c"main";
const VERT_FILE: &str = "terrain.vert.spv";
const FRAG_FILE: &str = "terrain.frag.spv";

static EMBEDDED_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/terrain.vert.spv"));
static EMBEDDED_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/terrain.frag.spv"));

/// Where the terrain SPIR-V comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ShaderSource {
    /// Compiled by the build script and linked into the binary.
    #[default]
    Embedded,
    /// `terrain.vert.spv` and `terrain.frag.spv` inside this directory.
    Directory(PathBuf),
}

#[derive(Debug)]
pub struct ShaderCode {
    pub vert: Vec<u32>,
    pub frag: Vec<u32>,
}

impl ShaderSource {
    pub fn load(&self) -> Result<ShaderCode> {
        match self {
            ShaderSource::Embedded => Ok(ShaderCode {
                vert: read_spv(&mut Cursor::new(EMBEDDED_VERT)).context("embedded vertex shader")?,
                frag: read_spv(&mut Cursor::new(EMBEDDED_FRAG))
                    .context("embedded fragment shader")?,
            }),
            ShaderSource::Directory(dir) => Ok(ShaderCode {
                vert: load_spirv(&dir.join(VERT_FILE))?,
                frag: load_spirv(&dir.join(FRAG_FILE))?,
            }),
        }
    }
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    if !path.is_file() {
        return Err(RenderError::MissingShader {
            path: path.to_path_buf(),
        }
        .into());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    read_spv(&mut Cursor::new(&bytes[..])).with_context(|| format!("parse SPIR-V {}", path.display()))
}

unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    device
        .create_shader_module(&ci, None)
        .context("create_shader_module")
}

// One colour attachment (cleared, presented) and one depth attachment
// (cleared, discarded) in a single subpass.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };

    // The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT; the layout
    // transition and the depth clear must not start before it.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&rp_info, None)
        .context("create_render_pass")
}

pub struct Pipelines {
    pub layout: vk::PipelineLayout,
    pub surface: vk::Pipeline,
    pub grid: Option<vk::Pipeline>,
}

impl Pipelines {
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if let Some(grid) = self.grid.take() {
            device.destroy_pipeline(grid, None);
        }
        device.destroy_pipeline(self.surface, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.surface = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

/// Surface pipeline (triangle strips) plus, when asked for, the grid
/// pipeline (line strips). Both use primitive restart on `u32::MAX`.
pub unsafe fn create_pipelines(
    device: &ash::Device,
    cache: vk::PipelineCache,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
    shaders: &ShaderSource,
    with_grid: bool,
) -> Result<Pipelines> {
    let code = shaders.load()?;
    let vs = create_shader_module(device, &code.vert)?;
    let fs = create_shader_module(device, &code.frag)?;

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        ..Default::default()
    };
    let built = device
        .create_pipeline_layout(&layout_info, None)
        .context("create_pipeline_layout")
        .and_then(|layout| {
            let modules = (vs, fs);
            let surface = create_pipeline(
                device,
                cache,
                render_pass,
                layout,
                modules,
                vk::PrimitiveTopology::TRIANGLE_STRIP,
                false,
            )?;
            let grid = if with_grid {
                Some(create_pipeline(
                    device,
                    cache,
                    render_pass,
                    layout,
                    modules,
                    vk::PrimitiveTopology::LINE_STRIP,
                    true,
                )?)
            } else {
                None
            };
            Ok(Pipelines {
                layout,
                surface,
                grid,
            })
        });

    device.destroy_shader_module(vs, None);
    device.destroy_shader_module(fs, None);
    built
}

unsafe fn create_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    (vs, fs): (vk::ShaderModule, vk::ShaderModule),
    topology: vk::PrimitiveTopology,
    grid: bool,
) -> Result<vk::Pipeline> {
    // constant_id 0 in both stages selects the grid variant.
    let grid_flag: vk::Bool32 = if grid { vk::TRUE } else { vk::FALSE };
    let spec_entry = vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: size_of::<vk::Bool32>(),
    };
    let spec_info = vk::SpecializationInfo {
        map_entry_count: 1,
        p_map_entries: &spec_entry,
        data_size: size_of::<vk::Bool32>(),
        p_data: (&grid_flag as *const vk::Bool32).cast(),
        ..Default::default()
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: ENTRY_POINT.as_ptr(),
            p_specialization_info: &spec_info,
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: ENTRY_POINT.as_ptr(),
            p_specialization_info: &spec_info,
            ..Default::default()
        },
    ];

    // binding 0: TileVertex { position, color, normal }
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<TileVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(TileVertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(TileVertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(TileVertex, normal) as u32,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &binding,
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology,
        primitive_restart_enable: vk::TRUE,
        ..Default::default()
    };

    // Viewport/scissor are set while recording.
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    // Strips alternate winding, walls face either way: no culling.
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: vk::TRUE,
        depth_write_enable: vk::TRUE,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let pipelines =
        match device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None) {
            Ok(p) => p,
            Err((_, err)) => {
                return Err(anyhow!("create_graphics_pipelines({topology:?}) failed: {err:?}"))
            }
        };
    pipelines
        .into_iter()
        .next()
        .context("create_graphics_pipelines returned nothing")
}

fn hex_bytes(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        let _ = write!(&mut s, "{x:02x}");
    }
    s
}

/// Cache file keyed by vendor, device, driver and the driver's cache UUID,
/// so a driver update never feeds a stale blob back in.
pub fn pipeline_cache_path(dir: &Path, props: &vk::PhysicalDeviceProperties) -> PathBuf {
    dir.join(format!(
        "strata_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid)
    ))
}

pub unsafe fn load_pipeline_cache(
    device: &ash::Device,
    path: Option<&Path>,
) -> Result<vk::PipelineCache> {
    let data = match path.map(fs::read) {
        Some(Ok(bytes)) => {
            info!("vk: pipeline cache loaded ({} bytes)", bytes.len());
            bytes
        }
        Some(Err(e)) => {
            debug!("vk: no pipeline cache on disk: {e}");
            Vec::new()
        }
        None => Vec::new(),
    };

    let ci = vk::PipelineCacheCreateInfo {
        s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
        initial_data_size: data.len(),
        p_initial_data: data.as_ptr().cast(),
        ..Default::default()
    };
    match device.create_pipeline_cache(&ci, None) {
        Ok(cache) => Ok(cache),
        // A corrupt blob is not worth dying over; start empty.
        Err(e) if !data.is_empty() => {
            warn!("vk: pipeline cache rejected ({e:?}), starting empty");
            let empty = vk::PipelineCacheCreateInfo {
                s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
                ..Default::default()
            };
            device
                .create_pipeline_cache(&empty, None)
                .context("create_pipeline_cache")
        }
        Err(e) => Err(e).context("create_pipeline_cache"),
    }
}

/// Failures are logged and ignored.
pub unsafe fn save_pipeline_cache(device: &ash::Device, cache: vk::PipelineCache, path: &Path) {
    let bytes = match device.get_pipeline_cache_data(cache) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("vk: get_pipeline_cache_data: {e:?}");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match fs::write(path, &bytes) {
        Ok(()) => debug!("vk: pipeline cache saved to {}", path.display()),
        Err(e) => warn!("vk: saving pipeline cache to {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strata-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn embedded_shaders_are_spirv() {
        let code = ShaderSource::Embedded.load().unwrap();
        assert_eq!(code.vert[0], SPIRV_MAGIC);
        assert_eq!(code.frag[0], SPIRV_MAGIC);
    }

    #[test]
    fn missing_shader_is_reported_with_path() {
        let dir = scratch_dir("missing-shader");
        let err = ShaderSource::Directory(dir.clone()).load().unwrap_err();
        match err.downcast_ref::<RenderError>() {
            Some(RenderError::MissingShader { path }) => {
                assert_eq!(path, &dir.join(VERT_FILE));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shader_directory_is_read() {
        let dir = scratch_dir("shader-dir");
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        fs::write(dir.join(VERT_FILE), &bytes).unwrap();
        fs::write(dir.join(FRAG_FILE), &bytes).unwrap();

        let code = ShaderSource::Directory(dir).load().unwrap();
        assert_eq!(code.vert, words);
        assert_eq!(code.frag, words);
    }

    #[test]
    fn truncated_spirv_is_an_error() {
        let dir = scratch_dir("bad-spirv");
        let path = dir.join(VERT_FILE);
        fs::write(&path, [0x03, 0x02, 0x23]).unwrap();
        let err = load_spirv(&path).unwrap_err();
        assert!(err.downcast_ref::<RenderError>().is_none());
    }

    #[test]
    fn cache_path_is_keyed_by_device() {
        let props = vk::PhysicalDeviceProperties {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 0x0123_4567,
            pipeline_cache_uuid: [0xab; vk::UUID_SIZE],
            ..Default::default()
        };
        let path = pipeline_cache_path(Path::new("cache"), &props);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("strata_pipeline_cache_10de_2684_01234567_abab"));
        assert!(name.ends_with(".bin"));
        assert_eq!(path.parent(), Some(Path::new("cache")));
    }
}
