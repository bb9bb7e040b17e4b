//! Indirect-count draw of the culled scene.
//!
//! One `vkCmdDrawIndexedIndirectCount` renders every draw the culling pass
//! kept. The vertex shader reads the culled buffer at `gl_DrawIDARB` to find
//! the draw's material, and the fragment shader samples that material's slot
//! of a partially bound texture array. Every slot starts out pointing at a
//! 1x1 white placeholder and is replaced once its texture finishes mip
//! generation.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use cinder_core::{IndirectDrawCommandAndMeshData, Vertex};
use cinder_gpu::descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
use cinder_gpu::pipeline::push_constant_range;
use cinder_gpu::{
    CommandQueueManager, CommandRecorder, GpuContext, GpuError, GraphicsPipeline,
    GraphicsPipelineConfig, ResourceTable, Result, SubmitBatch, Texture, TextureDesc,
};
use cinder_shaders::MAX_MATERIAL_TEXTURES;
use glam::{Mat4, Vec3};

use crate::culling::CullingComputePass;
use crate::scene_upload::SceneBuffers;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

/// Push constants shared by `indirect_draw.vert` and `indirect_draw.frag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub view_projection: [[f32; 4]; 4],
    /// xyz: direction towards the light, w unused
    pub light_direction: [f32; 4],
}

impl DrawPushConstants {
    pub fn new(view_projection: Mat4, light_direction: Vec3) -> Self {
        Self {
            view_projection: view_projection.to_cols_array_2d(),
            light_direction: light_direction.normalize_or_zero().extend(0.0).to_array(),
        }
    }
}

/// Raw handles one indirect draw is recorded against.
#[derive(Clone, Copy, Debug)]
pub struct DrawBindings {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertices: vk::Buffer,
    pub indices: vk::Buffer,
    pub culled_draws: vk::Buffer,
    pub draw_count_buffer: vk::Buffer,
    pub max_draw_count: u32,
}

/// Record the culled scene into `color`.
///
/// `color` is left in `COLOR_ATTACHMENT_OPTIMAL`; the caller moves it on to
/// presentation or sampling.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn record_indirect_draw(
    rec: &mut dyn CommandRecorder,
    bindings: &DrawBindings,
    color: &mut Texture,
    depth: &mut Texture,
    push: &DrawPushConstants,
) {
    rec.begin_label("Indirect Draw", [0.0, 1.0, 0.0, 1.0]);

    color.transition_image_layout(rec, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    record_depth_reuse(rec, depth);

    let extent = color.extent_2d();
    let color_attachment = vk::RenderingAttachmentInfo::default()
        .image_view(color.view())
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        });
    let depth_attachment = vk::RenderingAttachmentInfo::default()
        .image_view(depth.view())
        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .clear_value(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        });
    let rendering_info = vk::RenderingInfo::default()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        })
        .layer_count(1)
        .color_attachments(std::slice::from_ref(&color_attachment))
        .depth_attachment(&depth_attachment);

    rec.begin_rendering(&rendering_info);
    rec.set_viewport_and_scissor(extent);

    rec.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, bindings.pipeline);
    rec.bind_descriptor_sets(
        vk::PipelineBindPoint::GRAPHICS,
        bindings.layout,
        0,
        &[bindings.descriptor_set],
    );
    rec.push_constants(
        bindings.layout,
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        0,
        bytemuck::bytes_of(push),
    );
    rec.bind_vertex_buffer(bindings.vertices, 0);
    rec.bind_index_buffer(bindings.indices, 0, vk::IndexType::UINT32);
    rec.draw_indexed_indirect_count(
        bindings.culled_draws,
        0,
        bindings.draw_count_buffer,
        0,
        bindings.max_draw_count,
        IndirectDrawCommandAndMeshData::STRIDE,
    );

    rec.end_rendering();
    rec.end_label();
}

/// Order this frame's depth clear after the previous frame's depth tests.
///
/// One depth image serves every frame in flight and is cleared on load, so
/// its old contents are discarded.
fn record_depth_reuse(rec: &mut dyn CommandRecorder, depth: &mut Texture) {
    let tests =
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(depth.image())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: depth.aspect_mask(),
            base_mip_level: 0,
            level_count: depth.mip_levels(),
            base_array_layer: 0,
            layer_count: 1,
        });
    rec.pipeline_barrier(tests, tests, &[], &[barrier]);
    depth.set_image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
}

/// Graphics pass drawing whatever [`CullingComputePass`] kept.
pub struct IndirectDrawPass {
    pipeline: GraphicsPipeline,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    sampler: vk::Sampler,
    placeholder: Texture,
    depth: Texture,
    material_textures: Vec<Option<Texture>>,
}

impl IndirectDrawPass {
    /// Build the pipeline and attachments for `color_format` at `extent`.
    ///
    /// The placeholder texture is uploaded through `manager`, a graphics
    /// queue, and waited on before this returns.
    pub fn new(
        context: &GpuContext,
        manager: &mut CommandQueueManager,
        resources: &ResourceTable,
        culling: &CullingComputePass,
        color_format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = context.device();

        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::VERTEX)
                .sampled_image_array(1, MAX_MATERIAL_TEXTURES, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?
        };
        let config = GraphicsPipelineConfig::opaque::<Vertex>(
            cinder_shaders::indirect_draw_vertex_shader(),
            cinder_shaders::indirect_draw_fragment_shader(),
            &[color_format],
            Some(DEPTH_FORMAT),
        );
        let pipeline = unsafe {
            GraphicsPipeline::new(
                device,
                &config,
                &[set_layout],
                &[push_constant_range::<DrawPushConstants>(
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                )],
            )?
        };

        let depth = create_depth(context, extent)?;
        let sampler = context.create_sampler()?;
        let placeholder = upload_placeholder(context, manager)?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(MAX_MATERIAL_TEXTURES),
        ];
        let descriptor_pool = unsafe { DescriptorPool::new(device, 1, &pool_sizes)? };
        let descriptor_set = unsafe { descriptor_pool.allocate(device, &[set_layout])?[0] };

        let culled = resources
            .buffer(culling.culled_draws())
            .ok_or_else(|| GpuError::InvalidState("Culled draw buffer missing".to_string()))?;
        let mut writer = DescriptorWriter::new();
        writer.buffer(descriptor_set, 0, vk::DescriptorType::STORAGE_BUFFER, culled.buffer);
        for slot in 0..MAX_MATERIAL_TEXTURES {
            writer.sampled_image(descriptor_set, 1, slot, placeholder.view(), sampler);
        }
        unsafe { writer.update(device) };

        tracing::info!(
            format = ?color_format,
            width = extent.width,
            height = extent.height,
            "Created indirect draw pass"
        );

        Ok(Self {
            pipeline,
            set_layout,
            descriptor_pool,
            descriptor_set,
            sampler,
            placeholder,
            depth,
            material_textures: (0..MAX_MATERIAL_TEXTURES).map(|_| None).collect(),
        })
    }

    /// Point material slot `slot` at `texture`, taking ownership of it.
    ///
    /// The caller must have waited for every graphics submission that reads
    /// the descriptor set. A texture previously in the slot is destroyed.
    pub fn set_material_texture(
        &mut self,
        context: &GpuContext,
        slot: u32,
        texture: Texture,
    ) -> Result<()> {
        let entry = self
            .material_textures
            .get_mut(slot as usize)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Material slot {slot} exceeds {MAX_MATERIAL_TEXTURES} texture slots"
                ))
            })?;

        let mut writer = DescriptorWriter::new();
        writer.sampled_image(self.descriptor_set, 1, slot, texture.view(), self.sampler);
        unsafe { writer.update(context.device()) };

        tracing::debug!(slot, texture = texture.name(), "Bound material texture");
        if let Some(old) = entry.replace(texture) {
            let mut allocator = context.allocator().lock();
            old.destroy(context.device(), &mut allocator)?;
        }
        Ok(())
    }

    /// Number of slots holding a real texture rather than the placeholder.
    pub fn bound_texture_count(&self) -> usize {
        self.material_textures.iter().flatten().count()
    }

    /// Recreate the depth attachment for a new swapchain extent.
    ///
    /// The device must be idle.
    pub fn resize(&mut self, context: &GpuContext, extent: vk::Extent2D) -> Result<()> {
        let depth = create_depth(context, extent)?;
        let old = std::mem::replace(&mut self.depth, depth);
        let mut allocator = context.allocator().lock();
        old.destroy(context.device(), &mut allocator)
    }

    pub fn bindings(
        &self,
        resources: &ResourceTable,
        scene: &SceneBuffers,
        culling: &CullingComputePass,
    ) -> Result<DrawBindings> {
        let resolve = |handle, what: &str| {
            resources
                .buffer(handle)
                .map(|b| b.buffer)
                .ok_or_else(|| GpuError::InvalidState(format!("{what} buffer retired")))
        };
        Ok(DrawBindings {
            pipeline: self.pipeline.pipeline,
            layout: self.pipeline.layout,
            descriptor_set: self.descriptor_set,
            vertices: resolve(scene.vertices, "Vertex")?,
            indices: resolve(scene.indices, "Index")?,
            culled_draws: resolve(culling.culled_draws(), "Culled draw")?,
            draw_count_buffer: resolve(culling.draw_count_buffer(), "Draw count")?,
            max_draw_count: culling.max_draw_count(),
        })
    }

    /// Record the draw into `color`, which stays in
    /// `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn record(
        &mut self,
        rec: &mut dyn CommandRecorder,
        resources: &ResourceTable,
        scene: &SceneBuffers,
        culling: &CullingComputePass,
        color: &mut Texture,
        push: &DrawPushConstants,
    ) -> Result<()> {
        let bindings = self.bindings(resources, scene, culling)?;
        record_indirect_draw(rec, &bindings, color, &mut self.depth, push);
        Ok(())
    }

    /// # Safety
    /// No pending submission may use the pass.
    pub unsafe fn destroy(self, context: &GpuContext) -> Result<()> {
        let device = context.device();
        unsafe {
            self.pipeline.destroy(device);
            self.descriptor_pool.destroy(device);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
        let mut allocator = context.allocator().lock();
        for texture in self.material_textures.into_iter().flatten() {
            texture.destroy(device, &mut allocator)?;
        }
        self.placeholder.destroy(device, &mut allocator)?;
        self.depth.destroy(device, &mut allocator)
    }
}

fn create_depth(context: &GpuContext, extent: vk::Extent2D) -> Result<Texture> {
    context.create_texture(&TextureDesc::attachment(
        extent.width.max(1),
        extent.height.max(1),
        DEPTH_FORMAT,
        "scene depth",
    ))
}

fn upload_placeholder(
    context: &GpuContext,
    manager: &mut CommandQueueManager,
) -> Result<Texture> {
    const WHITE: [u8; 4] = [255; 4];

    let mut texture = context.create_texture(&TextureDesc::sampled(
        1,
        1,
        vk::Format::R8G8B8A8_UNORM,
        "material placeholder",
    ))?;
    let staging = context.create_staging_buffer(WHITE.len() as u64, "placeholder staging")?;

    let cmd = manager.get_cmd_buffer_to_begin()?;
    let mut encoder = context.encoder(cmd);
    let recorded = texture.upload_only(&mut encoder, &staging, &WHITE);
    texture.transition_image_layout(&mut encoder, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    manager.dispose_when_submit_completes(staging);
    recorded?;

    manager.end_cmd_buffer(cmd)?;
    manager.submit(&SubmitBatch::new(cmd))?;
    manager.wait_until_submit_is_complete()?;
    manager.go_to_next_cmd_buffer();
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use cinder_gpu::testing::{fake_texture_with_image, RecordedCommand, RecordingEncoder};
    use cinder_gpu::MipPolicy;

    fn bindings() -> DrawBindings {
        DrawBindings {
            pipeline: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::from_raw(2),
            descriptor_set: vk::DescriptorSet::from_raw(3),
            vertices: vk::Buffer::from_raw(10),
            indices: vk::Buffer::from_raw(11),
            culled_draws: vk::Buffer::from_raw(40),
            draw_count_buffer: vk::Buffer::from_raw(41),
            max_draw_count: 120,
        }
    }

    fn push() -> DrawPushConstants {
        DrawPushConstants::new(Mat4::IDENTITY, Vec3::new(0.0, 2.0, 0.0))
    }

    #[test]
    fn push_constants_match_the_shader_block() {
        assert_eq!(std::mem::size_of::<DrawPushConstants>(), 80);
        assert_eq!(push().light_direction, [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn draw_uses_the_culled_count() {
        let mut rec = RecordingEncoder::new();
        let mut color = fake_texture_with_image(100, 640, 480, MipPolicy::Single);
        let mut depth = fake_texture_with_image(200, 640, 480, MipPolicy::Single);

        record_indirect_draw(&mut rec, &bindings(), &mut color, &mut depth, &push());

        let commands = rec.without_labels();
        assert_eq!(rec.barrier_count(), 2);
        assert!(commands.contains(&RecordedCommand::BeginRendering {
            extent: (640, 480),
            color_attachments: 1,
            has_depth: true,
        }));
        assert!(commands.contains(&RecordedCommand::SetViewport(640, 480)));
        assert!(commands.contains(&RecordedCommand::BindIndexBuffer(
            vk::Buffer::from_raw(11),
            0,
            vk::IndexType::UINT32
        )));
        assert_eq!(
            commands[commands.len() - 2],
            RecordedCommand::DrawIndexedIndirectCount {
                buffer: vk::Buffer::from_raw(40),
                count_buffer: vk::Buffer::from_raw(41),
                max_draw_count: 120,
                stride: 28,
            }
        );
        assert_eq!(commands.last(), Some(&RecordedCommand::EndRendering));
        assert_eq!(color.layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(depth.layout(), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn every_frame_orders_depth_after_the_previous_frame() {
        let mut color = fake_texture_with_image(100, 64, 64, MipPolicy::Single);
        let mut depth = fake_texture_with_image(200, 64, 64, MipPolicy::Single);
        record_indirect_draw(
            &mut RecordingEncoder::new(),
            &bindings(),
            &mut color,
            &mut depth,
            &push(),
        );

        // presentation hands the image back in PRESENT_SRC
        color.set_image_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        let mut rec = RecordingEncoder::new();
        record_indirect_draw(&mut rec, &bindings(), &mut color, &mut depth, &push());

        let barriers = rec.image_barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].image, vk::Image::from_raw(100));
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let depth_barrier = rec.commands().iter().find_map(|c| match c {
            RecordedCommand::Barrier { src_stages, dst_stages, images, .. }
                if images.iter().any(|i| i.image == vk::Image::from_raw(200)) =>
            {
                Some((*src_stages, *dst_stages, images[0].clone()))
            }
            _ => None,
        });
        let (src_stages, dst_stages, barrier) = depth_barrier.unwrap();
        assert_eq!((src_stages, dst_stages), (tests, tests));
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(
            barrier.src_access,
            u64::from(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw())
        );
        assert_eq!(depth.layout(), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn push_constants_cover_both_stages() {
        let mut rec = RecordingEncoder::new();
        let mut color = fake_texture_with_image(100, 8, 8, MipPolicy::Single);
        let mut depth = fake_texture_with_image(200, 8, 8, MipPolicy::Single);
        record_indirect_draw(&mut rec, &bindings(), &mut color, &mut depth, &push());

        let pushed = rec.commands().iter().find_map(|c| match c {
            RecordedCommand::PushConstants { stages, data, .. } => Some((*stages, data.len())),
            _ => None,
        });
        assert_eq!(
            pushed,
            Some((vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT, 80))
        );
    }
}
