// SPDX-License-Identifier: CEPL-1.0
//! Graphics pipeline for the textured mesh.

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use orbit_math::Vertex;
use orbit_render::RenderError;
use std::ffi::{c_void, CString};
use std::io::Cursor;
use std::mem::{offset_of, size_of};
use std::path::Path;
use tracing::debug;

/// SPIR-V for both stages plus their entry points. Both stages may come from
/// one module.
#[derive(Clone, Debug)]
pub struct ShaderStages {
    vertex: Vec<u32>,
    fragment: Vec<u32>,
    vertex_entry: CString,
    fragment_entry: CString,
}

impl ShaderStages {
    pub fn from_spirv(
        vertex: &[u8],
        fragment: &[u8],
        vertex_entry: &str,
        fragment_entry: &str,
    ) -> Result<Self> {
        Ok(Self {
            vertex: read_spv(&mut Cursor::new(vertex)).context("vertex SPIR-V")?,
            fragment: read_spv(&mut Cursor::new(fragment)).context("fragment SPIR-V")?,
            vertex_entry: CString::new(vertex_entry).context("vertex entry name")?,
            fragment_entry: CString::new(fragment_entry).context("fragment entry name")?,
        })
    }

    /// One module exposing both entry points (the Slang layout).
    pub fn from_spirv_file(
        path: impl AsRef<Path>,
        vertex_entry: &str,
        fragment_entry: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| RenderError::asset(path, e))?;
        Self::from_spirv(&bytes, &bytes, vertex_entry, fragment_entry)
            .map_err(|e| RenderError::asset(path, format!("{e:#}")).into())
    }

    /// GLSL sources bundled with the crate, compiled at build time.
    #[cfg(feature = "builtin-shaders")]
    pub fn builtin() -> Result<Self> {
        let vs = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
        let fs = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));
        Self::from_spirv(&vs[..], &fs[..], "main", "main")
    }

    pub fn vertex_entry(&self) -> &str {
        self.vertex_entry.to_str().unwrap_or("")
    }

    pub fn fragment_entry(&self) -> &str {
        self.fragment_entry.to_str().unwrap_or("")
    }
}

/// Where the pipeline's fragments land.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentTarget {
    Dynamic {
        color: vk::Format,
        depth: vk::Format,
    },
    RenderPass(vk::RenderPass),
}

pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// position, color, texcoord at locations 0, 1, 2.
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, pos) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, tex_coord) as u32,
        },
    ]
}

/// binding 0: scene uniforms (vertex), binding 1: texture (fragment).
pub fn descriptor_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 2] {
    [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ]
}

pub struct PipelineState {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    target: AttachmentTarget,
}

impl PipelineState {
    pub fn build(device: &ash::Device, shaders: &ShaderStages, target: AttachmentTarget) -> Result<Self> {
        let bindings = descriptor_bindings();
        let set_info = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_info, None) }
            .map_err(|e| RenderError::driver("vkCreateDescriptorSetLayout", e))?;

        // no push constants
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(l) => l,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(RenderError::driver("vkCreatePipelineLayout", e).into());
            }
        };

        let mut state = Self {
            device: device.clone(),
            set_layout,
            layout,
            pipeline: vk::Pipeline::null(),
            target,
        };
        state.rebuild_pipeline(shaders, target)?;
        Ok(state)
    }

    /// Replaces the pipeline object, keeping both layouts. The old pipeline must
    /// not be in use.
    pub fn rebuild_pipeline(&mut self, shaders: &ShaderStages, target: AttachmentTarget) -> Result<()> {
        let pipeline = unsafe { create_pipeline(&self.device, shaders, self.layout, target) }?;
        if self.pipeline != vk::Pipeline::null() {
            unsafe { self.device.destroy_pipeline(self.pipeline, None) };
        }
        self.pipeline = pipeline;
        self.target = target;
        debug!(?target, "pipeline built");
        Ok(())
    }

    pub fn bind(&self, cb: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, self.pipeline)
        };
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn target(&self) -> AttachmentTarget {
        self.target
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

unsafe fn shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(unsafe { device.create_shader_module(&ci, None) }
        .map_err(|e| RenderError::driver("vkCreateShaderModule", e))?)
}

unsafe fn create_pipeline(
    device: &ash::Device,
    shaders: &ShaderStages,
    layout: vk::PipelineLayout,
    target: AttachmentTarget,
) -> Result<vk::Pipeline> {
    // STRICT: on the dynamic path the color format MUST match the current
    // swapchain format; on a format change the pipeline is rebuilt before recording.

    // --- Shader modules (destroyed before return) ---
    let vs = unsafe { shader_module(device, &shaders.vertex) }?;
    let fs = match unsafe { shader_module(device, &shaders.fragment) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: shaders.vertex_entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: shaders.fragment_entry.as_ptr(),
            ..Default::default()
        },
    ];

    // --- Fixed-function pipeline states ---
    let vb = vertex_binding();
    let va = vertex_attributes();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
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
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
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
        depth_compare_op: vk::CompareOp::LESS,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let (color_format, depth_format, render_pass) = match target {
        AttachmentTarget::Dynamic { color, depth } => (color, depth, vk::RenderPass::null()),
        AttachmentTarget::RenderPass(rp) => {
            (vk::Format::UNDEFINED, vk::Format::UNDEFINED, rp)
        }
    };
    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: 1,
        p_color_attachment_formats: &color_format,
        depth_attachment_format: depth_format,
        ..Default::default()
    };
    let p_next: *const c_void = if render_pass == vk::RenderPass::null() {
        (&rendering as *const vk::PipelineRenderingCreateInfo<'_>).cast()
    } else {
        std::ptr::null()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next,
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

    let created = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    let pipelines = created.map_err(|(_, err)| RenderError::driver("vkCreateGraphicsPipelines", err))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("vkCreateGraphicsPipelines returned no pipeline"))
}
