//! Pipeline creation.

use crate::error::{GpuError, Result};
use ash::vk;
use cinder_core::Vertex;

/// Vertex formats that can feed a graphics pipeline.
pub trait VertexLayout {
    fn bindings() -> Vec<vk::VertexInputBindingDescription>;
    fn attributes() -> Vec<vk::VertexInputAttributeDescription>;
}

impl VertexLayout for Vertex {
    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, normal) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// Push constant range sized for `T` at offset 0.
pub fn push_constant_range<T>(stage_flags: vk::ShaderStageFlags) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags,
        offset: 0,
        size: std::mem::size_of::<T>() as u32,
    }
}

/// # Safety
/// The device must be valid and `code` valid SPIR-V.
unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
    stage: &str,
) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))
}

/// # Safety
/// The device and set layouts must be valid.
unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from SPIR-V.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        shader_code: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let module = unsafe { create_shader_module(device, shader_code, "Compute")? };
        let layout = match unsafe { create_pipeline_layout(device, set_layouts, push_constant_ranges) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { device.destroy_shader_module(module, None) };

        match result {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Graphics pipeline configuration for dynamic rendering.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl GraphicsPipelineConfig {
    /// Opaque triangle rendering of `V` into the given attachments.
    pub fn opaque<V: VertexLayout>(
        vertex_shader: &[u32],
        fragment_shader: &[u32],
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
    ) -> Self {
        Self {
            vertex_shader: vertex_shader.to_vec(),
            fragment_shader: fragment_shader.to_vec(),
            vertex_bindings: V::bindings(),
            vertex_attributes: V::attributes(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: depth_format.is_some(),
            depth_write: depth_format.is_some(),
            depth_compare_op: vk::CompareOp::LESS,
            color_formats: color_formats.to_vec(),
            depth_format,
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline using dynamic rendering.
    ///
    /// Viewport and scissor are dynamic state.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let vert_module = unsafe { create_shader_module(device, &config.vertex_shader, "Vertex")? };
        let frag_module = match unsafe {
            create_shader_module(device, &config.fragment_shader, "Fragment")
        } {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };
        let destroy_modules = || unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        };

        let layout = match unsafe { create_pipeline_layout(device, set_layouts, push_constant_ranges) } {
            Ok(layout) => layout,
            Err(e) => {
                destroy_modules();
                return Err(e);
            }
        };

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .line_width(1.0);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op);

        let color_blend_attachments: Vec<_> = config
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats);
        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        destroy_modules();

        match result {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::CullingPushConstants;

    #[test]
    fn vertex_layout_matches_struct() {
        let bindings = Vertex::bindings();
        assert_eq!(bindings[0].stride, 32);

        let offsets: Vec<u32> = Vertex::attributes().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn push_constant_range_covers_type() {
        let range = push_constant_range::<CullingPushConstants>(vk::ShaderStageFlags::COMPUTE);
        assert_eq!(range.size, 4);
        assert_eq!(range.offset, 0);
    }
}
