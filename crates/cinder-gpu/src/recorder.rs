//! Command recording seam.
//!
//! Resource helpers (textures, staging buffers, passes) record through
//! [`CommandRecorder`] instead of calling `ash::Device` directly, which keeps
//! barrier and copy logic testable without a GPU.

use ash::vk;

/// Records commands into one command buffer.
pub trait CommandRecorder {
    /// The command buffer being recorded.
    fn command_buffer(&self) -> vk::CommandBuffer;

    /// `vkCmdPipelineBarrier` with buffer and image barriers.
    fn pipeline_barrier(
        &mut self,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    /// `vkCmdPipelineBarrier2` with image barriers only.
    fn image_barrier2(&mut self, image_barriers: &[vk::ImageMemoryBarrier2<'_>]);

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32);

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn begin_rendering(&mut self, info: &vk::RenderingInfo<'_>);

    fn end_rendering(&mut self);

    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D);

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64);

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType);

    #[allow(clippy::too_many_arguments)]
    fn draw_indexed_indirect_count(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        count_buffer: vk::Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    );

    /// Open a named region for debuggers; no-op without debug utils.
    fn begin_label(&mut self, _name: &str, _color: [f32; 4]) {}

    fn end_label(&mut self) {}
}

/// [`CommandRecorder`] backed by a real Vulkan command buffer.
pub struct CommandEncoder<'a> {
    device: &'a ash::Device,
    debug_utils: Option<&'a ash::ext::debug_utils::Device>,
    cmd: vk::CommandBuffer,
}

impl<'a> CommandEncoder<'a> {
    /// Wrap a command buffer in the recording state.
    ///
    /// # Safety
    /// `cmd` must belong to `device` and be between begin and end.
    pub unsafe fn new(
        device: &'a ash::Device,
        debug_utils: Option<&'a ash::ext::debug_utils::Device>,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            debug_utils,
            cmd,
        }
    }
}

impl CommandRecorder for CommandEncoder<'_> {
    fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn pipeline_barrier(
        &mut self,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }

    fn image_barrier2(&mut self, image_barriers: &[vk::ImageMemoryBarrier2<'_>]) {
        let dependency = vk::DependencyInfo::default().image_memory_barriers(image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) };
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.cmd, src, dst, dst_layout, regions);
        }
    }

    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(self.cmd, src, src_layout, dst, dst_layout, regions, filter);
        }
    }

    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        unsafe { self.device.cmd_fill_buffer(self.cmd, buffer, offset, size, data) };
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline) };
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, &[]);
        }
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.cmd, layout, stages, offset, data);
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) };
    }

    fn begin_rendering(&mut self, info: &vk::RenderingInfo<'_>) {
        unsafe { self.device.cmd_begin_rendering(self.cmd, info) };
    }

    fn end_rendering(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.cmd) };
    }

    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[scissor]);
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, 0, &[buffer], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
        }
    }

    fn draw_indexed_indirect_count(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        count_buffer: vk::Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed_indirect_count(
                self.cmd,
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
            );
        }
    }

    fn begin_label(&mut self, name: &str, color: [f32; 4]) {
        let Some(debug_utils) = self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default()
            .label_name(&name)
            .color(color);
        unsafe { debug_utils.cmd_begin_debug_utils_label(self.cmd, &label) };
    }

    fn end_label(&mut self) {
        if let Some(debug_utils) = self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(self.cmd) };
        }
    }
}
