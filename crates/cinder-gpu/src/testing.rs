//! In-memory stand-ins for the device and command buffers.
//!
//! Available to this crate's tests and, with the `testing` feature, to
//! downstream crates.

use crate::device::{FenceWait, QueueDevice, QueueHandle, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage};
use crate::recorder::CommandRecorder;
use crate::texture::{MipPolicy, Texture, TextureDesc};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// A buffer with a fake handle and no backing memory.
pub fn fake_buffer(
    raw: u64,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> GpuBuffer {
    GpuBuffer {
        buffer: vk::Buffer::from_raw(raw),
        allocation: None,
        size,
        usage,
        location,
    }
}

/// An RGBA8 texture with image handle `1`.
pub fn fake_texture(width: u32, height: u32, mips: MipPolicy) -> Texture {
    fake_texture_with_image(1, width, height, mips)
}

pub fn fake_texture_with_image(raw: u64, width: u32, height: u32, mips: MipPolicy) -> Texture {
    let desc = TextureDesc::sampled(width, height, vk::Format::R8G8B8A8_UNORM, format!("fake-{raw}"))
        .with_mips(mips);
    let image = GpuImage {
        image: vk::Image::from_raw(raw),
        allocation: None,
        format: desc.format,
        extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    };
    Texture::from_allocated(image, vk::ImageView::from_raw(raw + 1000), &desc, true)
}

/// Image barrier fields the tests inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: u64,
    pub dst_access: u64,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub base_mip_level: u32,
    pub level_count: u32,
}

impl From<&vk::ImageMemoryBarrier<'_>> for ImageBarrierRecord {
    fn from(b: &vk::ImageMemoryBarrier<'_>) -> Self {
        Self {
            image: b.image,
            old_layout: b.old_layout,
            new_layout: b.new_layout,
            src_access: u64::from(b.src_access_mask.as_raw()),
            dst_access: u64::from(b.dst_access_mask.as_raw()),
            src_queue_family: b.src_queue_family_index,
            dst_queue_family: b.dst_queue_family_index,
            base_mip_level: b.subresource_range.base_mip_level,
            level_count: b.subresource_range.level_count,
        }
    }
}

impl From<&vk::ImageMemoryBarrier2<'_>> for ImageBarrierRecord {
    fn from(b: &vk::ImageMemoryBarrier2<'_>) -> Self {
        Self {
            image: b.image,
            old_layout: b.old_layout,
            new_layout: b.new_layout,
            src_access: b.src_access_mask.as_raw(),
            dst_access: b.dst_access_mask.as_raw(),
            src_queue_family: b.src_queue_family_index,
            dst_queue_family: b.dst_queue_family_index,
            base_mip_level: b.subresource_range.base_mip_level,
            level_count: b.subresource_range.level_count,
        }
    }
}

/// Buffer barrier fields the tests inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrierRecord {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlitRecord {
    pub src_mip: u32,
    pub dst_mip: u32,
    pub src_extent: (i32, i32),
    pub dst_extent: (i32, i32),
}

/// One command captured by [`RecordingEncoder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCommand {
    Barrier {
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffers: Vec<BufferBarrierRecord>,
        images: Vec<ImageBarrierRecord>,
    },
    ImageBarrier2 {
        images: Vec<ImageBarrierRecord>,
    },
    /// Regions as `(src_offset, dst_offset, size)`.
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<(u64, u64, u64)>,
    },
    /// Regions as `(mip_level, buffer_offset, (width, height))`.
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<(u32, u64, (u32, u32))>,
    },
    Blit(Vec<BlitRecord>),
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindDescriptorSets(vk::PipelineBindPoint, Vec<vk::DescriptorSet>),
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch(u32, u32, u32),
    BeginRendering {
        extent: (u32, u32),
        color_attachments: usize,
        has_depth: bool,
    },
    EndRendering,
    SetViewport(u32, u32),
    BindVertexBuffer(vk::Buffer, u64),
    BindIndexBuffer(vk::Buffer, u64, vk::IndexType),
    DrawIndexedIndirectCount {
        buffer: vk::Buffer,
        count_buffer: vk::Buffer,
        max_draw_count: u32,
        stride: u32,
    },
    BeginLabel(String),
    EndLabel,
}

/// [`CommandRecorder`] that keeps every command in a list.
#[derive(Debug, Default)]
pub struct RecordingEncoder {
    cmd: vk::CommandBuffer,
    commands: Vec<RecordedCommand>,
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_command_buffer(cmd: vk::CommandBuffer) -> Self {
        Self {
            cmd,
            commands: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Number of barrier commands of either kind.
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    RecordedCommand::Barrier { .. } | RecordedCommand::ImageBarrier2 { .. }
                )
            })
            .count()
    }

    /// Every image barrier, in recording order.
    pub fn image_barriers(&self) -> Vec<ImageBarrierRecord> {
        self.commands
            .iter()
            .flat_map(|c| match c {
                RecordedCommand::Barrier { images, .. }
                | RecordedCommand::ImageBarrier2 { images } => images.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn blits(&self) -> Vec<BlitRecord> {
        self.commands
            .iter()
            .flat_map(|c| match c {
                RecordedCommand::Blit(blits) => blits.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Commands with debug labels filtered out.
    pub fn without_labels(&self) -> Vec<RecordedCommand> {
        self.commands
            .iter()
            .filter(|c| {
                !matches!(
                    c,
                    RecordedCommand::BeginLabel(_) | RecordedCommand::EndLabel
                )
            })
            .cloned()
            .collect()
    }
}

impl CommandRecorder for RecordingEncoder {
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
        self.commands.push(RecordedCommand::Barrier {
            src_stages,
            dst_stages,
            buffers: buffer_barriers
                .iter()
                .map(|b| BufferBarrierRecord {
                    buffer: b.buffer,
                    src_access: b.src_access_mask,
                    dst_access: b.dst_access_mask,
                    src_queue_family: b.src_queue_family_index,
                    dst_queue_family: b.dst_queue_family_index,
                })
                .collect(),
            images: image_barriers.iter().map(ImageBarrierRecord::from).collect(),
        });
    }

    fn image_barrier2(&mut self, image_barriers: &[vk::ImageMemoryBarrier2<'_>]) {
        self.commands.push(RecordedCommand::ImageBarrier2 {
            images: image_barriers.iter().map(ImageBarrierRecord::from).collect(),
        });
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.commands.push(RecordedCommand::CopyBuffer {
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
        });
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(RecordedCommand::CopyBufferToImage {
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| {
                    (
                        r.image_subresource.mip_level,
                        r.buffer_offset,
                        (r.image_extent.width, r.image_extent.height),
                    )
                })
                .collect(),
        });
    }

    fn blit_image(
        &mut self,
        _src: vk::Image,
        _src_layout: vk::ImageLayout,
        _dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.commands.push(RecordedCommand::Blit(
            regions
                .iter()
                .map(|r| BlitRecord {
                    src_mip: r.src_subresource.mip_level,
                    dst_mip: r.dst_subresource.mip_level,
                    src_extent: (r.src_offsets[1].x, r.src_offsets[1].y),
                    dst_extent: (r.dst_offsets[1].x, r.dst_offsets[1].y),
                })
                .collect(),
        ));
    }

    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        self.commands.push(RecordedCommand::FillBuffer {
            buffer,
            offset,
            size,
            data,
        });
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.commands
            .push(RecordedCommand::BindPipeline(bind_point, pipeline));
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.commands
            .push(RecordedCommand::BindDescriptorSets(bind_point, sets.to_vec()));
    }

    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.commands.push(RecordedCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch(x, y, z));
    }

    fn begin_rendering(&mut self, info: &vk::RenderingInfo<'_>) {
        self.commands.push(RecordedCommand::BeginRendering {
            extent: (info.render_area.extent.width, info.render_area.extent.height),
            color_attachments: info.color_attachment_count as usize,
            has_depth: !info.p_depth_attachment.is_null(),
        });
    }

    fn end_rendering(&mut self) {
        self.commands.push(RecordedCommand::EndRendering);
    }

    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D) {
        self.commands
            .push(RecordedCommand::SetViewport(extent.width, extent.height));
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.commands
            .push(RecordedCommand::BindVertexBuffer(buffer, offset));
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        self.commands
            .push(RecordedCommand::BindIndexBuffer(buffer, offset, index_type));
    }

    fn draw_indexed_indirect_count(
        &mut self,
        buffer: vk::Buffer,
        _offset: u64,
        count_buffer: vk::Buffer,
        _count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexedIndirectCount {
            buffer,
            count_buffer,
            max_draw_count,
            stride,
        });
    }

    fn begin_label(&mut self, name: &str, _color: [f32; 4]) {
        self.commands.push(RecordedCommand::BeginLabel(name.to_string()));
    }

    fn end_label(&mut self) {
        self.commands.push(RecordedCommand::EndLabel);
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FenceState {
    signaled: bool,
    /// Submitted and not yet observed as complete.
    pending: bool,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    fences: HashMap<u64, FenceState>,
    hang: bool,
    submits: Vec<SubmitBatch>,
    fence_waits: usize,
    fence_resets: usize,
    begun: Vec<vk::CommandBuffer>,
    released_buffers: Vec<vk::Buffer>,
    released_textures: Vec<String>,
    destroyed: bool,
}

impl FakeState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// [`QueueDevice`] that completes every submission instantly.
///
/// A fence that is neither signaled nor pending never signals, so waiting on
/// it times out, as a real device would after a lost submission. With
/// [`FakeQueueDevice::set_hang`] every wait times out.
#[derive(Default)]
pub struct FakeQueueDevice {
    state: Mutex<FakeState>,
}

impl FakeQueueDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue handle for this device.
    pub fn queue(&self, family: u32) -> QueueHandle {
        let raw = self.state.lock().next();
        QueueHandle::new(vk::Queue::from_raw(raw), family)
    }

    /// Make every following fence wait time out.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submits.len()
    }

    pub fn submits(&self) -> Vec<SubmitBatch> {
        self.state.lock().submits.clone()
    }

    pub fn fence_wait_count(&self) -> usize {
        self.state.lock().fence_waits
    }

    pub fn fence_reset_count(&self) -> usize {
        self.state.lock().fence_resets
    }

    /// Command buffers passed to `begin_command_buffer`, in order.
    pub fn begun(&self) -> Vec<vk::CommandBuffer> {
        self.state.lock().begun.clone()
    }

    pub fn released_buffers(&self) -> Vec<vk::Buffer> {
        self.state.lock().released_buffers.clone()
    }

    pub fn released_textures(&self) -> Vec<String> {
        self.state.lock().released_textures.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// True if `fence` has a submission the device has not reported done.
    pub fn is_pending(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .is_some_and(|f| f.pending)
    }
}

impl QueueDevice for FakeQueueDevice {
    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(self.state.lock().next()))
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.next()))
            .collect())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.next();
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<FenceWait> {
        let mut state = self.state.lock();
        state.fence_waits += 1;
        let hang = state.hang;
        let entry = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown fence {fence:?}")))?;
        if hang || !(entry.signaled || entry.pending) {
            return Ok(FenceWait::TimedOut);
        }
        entry.signaled = true;
        entry.pending = false;
        Ok(FenceWait::Signaled)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        state.fence_resets += 1;
        let entry = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown fence {fence:?}")))?;
        assert!(!entry.pending, "Fence {fence:?} reset while in flight");
        entry.signaled = false;
        Ok(())
    }

    fn reset_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.state.lock().begun.push(cmd);
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: &QueueHandle,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> Result<()> {
        queue.with_lock(|_| {
            let mut state = self.state.lock();
            let entry = state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or_else(|| GpuError::InvalidState(format!("Unknown fence {fence:?}")))?;
            assert!(
                !entry.signaled && !entry.pending,
                "Fence {fence:?} submitted without reset"
            );
            entry.pending = true;
            state.submits.push(batch.clone());
            Ok(())
        })
    }

    fn release_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        self.state.lock().released_buffers.push(buffer.buffer);
        Ok(())
    }

    fn release_texture(&self, texture: Texture) -> Result<()> {
        self.state
            .lock()
            .released_textures
            .push(texture.name().to_string());
        Ok(())
    }

    fn destroy_queue_objects(
        &self,
        _pool: vk::CommandPool,
        _command_buffers: &[vk::CommandBuffer],
        fences: &[vk::Fence],
    ) {
        let mut state = self.state.lock();
        for fence in fences {
            state.fences.remove(&fence.as_raw());
        }
        state.destroyed = true;
    }
}
