//! GPU frustum culling feeding indirect-count draws.
//!
//! Each frame the camera frustum is written into that frame's uniform slot,
//! the draw count is zeroed and `gpu_culling.comp` appends every visible
//! mesh's draw command to the culled buffer. The culled buffers are shared by
//! all frames, so culling first waits for the previous frame's indirect reads.
//! A buffer barrier then hands the culled buffer and its count from compute
//! writes to indirect reads.

use ash::vk;
use cinder_core::constants::CULLING_WORKGROUP_SIZE;
use cinder_core::{
    CullingPushConstants, Frustum, FrustumUniform, IndirectDrawCommandAndMeshData,
    MeshBoundingBox,
};
use cinder_gpu::descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
use cinder_gpu::pipeline::{push_constant_range, ComputePipeline};
use cinder_gpu::{
    BufferHandle, CommandRecorder, GpuContext, GpuError, ResourceTable, Result, RingBuffer,
};
use rayon::prelude::*;

use crate::scene_upload::SceneBuffers;

/// Culling pass setup.
#[derive(Clone, Copy, Debug)]
pub struct CullingConfig {
    /// One frustum uniform per frame in flight
    pub frames_in_flight: usize,
    pub compute_queue_family: u32,
    pub graphics_queue_family: u32,
}

/// Handles the culling commands are recorded against.
#[derive(Clone, Copy, Debug)]
pub struct CullingBindings {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub storage_set: vk::DescriptorSet,
    pub culled_draws: vk::Buffer,
    pub draw_count_buffer: vk::Buffer,
}

/// Workgroups dispatched for `draw_count` draws.
///
/// Always at least one, so the count buffer is touched even for an empty
/// scene; threads past `draw_count` exit immediately.
pub fn workgroup_count(draw_count: u32) -> u32 {
    draw_count / CULLING_WORKGROUP_SIZE + 1
}

/// Stages and accesses through which the previous frame read the culled
/// buffers, as seen from the queue recording culling.
///
/// Reads on another family are ordered by the frame semaphores instead, so
/// only an empty execution dependency remains.
pub fn previous_culled_reads(
    compute_family: u32,
    graphics_family: u32,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    if compute_family == graphics_family {
        (
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
            vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
        )
    } else {
        (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
    }
}

/// Record the count reset and the culling dispatch.
///
/// `previous_reads` are the stages and accesses of the last frame's draw
/// reading the culled buffers; see [`previous_culled_reads`].
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn record_culling(
    rec: &mut dyn CommandRecorder,
    bindings: &CullingBindings,
    frustum_set: vk::DescriptorSet,
    draw_count: u32,
    previous_reads: (vk::PipelineStageFlags, vk::AccessFlags),
) {
    rec.begin_label("GPU Culling", [1.0, 0.0, 0.0, 1.0]);

    let (read_stages, read_access) = previous_reads;
    let reuse = [bindings.culled_draws, bindings.draw_count_buffer].map(|buffer| {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(read_access)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .size(vk::WHOLE_SIZE)
    });
    rec.pipeline_barrier(
        read_stages,
        vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
        &reuse,
        &[],
    );

    rec.fill_buffer(bindings.draw_count_buffer, 0, vk::WHOLE_SIZE, 0);
    let reset = vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(bindings.draw_count_buffer)
        .size(vk::WHOLE_SIZE);
    rec.pipeline_barrier(
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        &[reset],
        &[],
    );

    rec.bind_pipeline(vk::PipelineBindPoint::COMPUTE, bindings.pipeline);
    rec.bind_descriptor_sets(
        vk::PipelineBindPoint::COMPUTE,
        bindings.layout,
        0,
        &[bindings.storage_set, frustum_set],
    );
    rec.push_constants(
        bindings.layout,
        vk::ShaderStageFlags::COMPUTE,
        0,
        bytemuck::bytes_of(&CullingPushConstants { draw_count }),
    );
    rec.dispatch(workgroup_count(draw_count), 1, 1);

    rec.end_label();
}

fn culled_buffer_barriers(
    bindings: &CullingBindings,
    src_access: vk::AccessFlags,
    compute_family: u32,
    graphics_family: u32,
) -> [vk::BufferMemoryBarrier<'static>; 2] {
    [bindings.culled_draws, bindings.draw_count_buffer].map(|buffer| {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ)
            .src_queue_family_index(compute_family)
            .dst_queue_family_index(graphics_family)
            .buffer(buffer)
            .size(vk::WHOLE_SIZE)
    })
}

/// Make the culled buffers readable as indirect commands and by the draw
/// shaders.
///
/// Recorded on the compute queue's command buffer after [`record_culling`].
/// With distinct families this is the release half of an ownership transfer:
/// it ends at `BOTTOM_OF_PIPE` since `dst_stage` may not exist on the compute
/// queue, and the graphics queue must record [`record_culled_buffers_acquire`].
pub fn record_culled_buffers_barrier(
    rec: &mut dyn CommandRecorder,
    bindings: &CullingBindings,
    dst_stage: vk::PipelineStageFlags,
    compute_family: u32,
    graphics_family: u32,
) {
    let barriers = culled_buffer_barriers(
        bindings,
        vk::AccessFlags::SHADER_WRITE,
        compute_family,
        graphics_family,
    );
    let dst_stage = if compute_family == graphics_family {
        dst_stage
    } else {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    };
    rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, dst_stage, &barriers, &[]);
}

/// Acquire half of the culled-buffer transfer, on the graphics queue.
/// Nothing is recorded when both passes share a family.
pub fn record_culled_buffers_acquire(
    rec: &mut dyn CommandRecorder,
    bindings: &CullingBindings,
    compute_family: u32,
    graphics_family: u32,
) {
    if compute_family == graphics_family {
        return;
    }
    let barriers = culled_buffer_barriers(
        bindings,
        vk::AccessFlags::empty(),
        compute_family,
        graphics_family,
    );
    rec.pipeline_barrier(
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
        &barriers,
        &[],
    );
}

/// The draws `gpu_culling.comp` keeps, in input order.
///
/// The shader appends survivors in whatever order its invocations win the
/// atomic, so compare against GPU output as a set.
pub fn cull_on_cpu(
    frustum: &Frustum,
    draws: &[IndirectDrawCommandAndMeshData],
    boxes: &[MeshBoundingBox],
) -> Vec<IndirectDrawCommandAndMeshData> {
    draws
        .par_iter()
        .filter(|draw| {
            let bbox = &boxes[draw.mesh_id as usize];
            frustum.is_box_visible(bbox.center(), bbox.extents())
        })
        .copied()
        .collect()
}

/// Compute pass that frustum-culls a scene's draws every frame.
pub struct CullingComputePass {
    pipeline: ComputePipeline,
    storage_layout: vk::DescriptorSetLayout,
    frustum_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    storage_set: vk::DescriptorSet,
    frustum_sets: Vec<vk::DescriptorSet>,
    frustum_ring: RingBuffer,
    culled_draws: BufferHandle,
    draw_count_buffer: BufferHandle,
    draw_count: u32,
    config: CullingConfig,
}

impl CullingComputePass {
    /// Build the pipeline and output buffers for `scene`.
    ///
    /// The culled draw buffer has the capacity of the scene's draw buffer;
    /// both outputs are inserted into `resources`.
    pub fn new(
        context: &GpuContext,
        resources: &mut ResourceTable,
        scene: &SceneBuffers,
        config: CullingConfig,
    ) -> Result<Self> {
        let device = context.device();
        let missing = |what: &str| GpuError::InvalidState(format!("Scene {what} buffer missing"));
        let boxes = resources
            .buffer(scene.bounding_boxes)
            .ok_or_else(|| missing("bounding box"))?
            .buffer;
        let input_draws = resources.buffer(scene.draws).ok_or_else(|| missing("draw"))?;
        let (input_draws, culled_size) = (input_draws.buffer, input_draws.size);

        let storage_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(3, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };
        let frustum_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };

        let pipeline = unsafe {
            ComputePipeline::new(
                device,
                cinder_shaders::gpu_culling_shader(),
                &[storage_layout, frustum_layout],
                &[push_constant_range::<CullingPushConstants>(
                    vk::ShaderStageFlags::COMPUTE,
                )],
            )?
        };

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER;
        let culled = context.create_gpu_only_buffer(culled_size, usage, "culled indirect draws")?;
        let count = context.create_gpu_only_buffer(
            std::mem::size_of::<u32>() as u64,
            usage,
            "culled draw count",
        )?;
        let (culled_raw, count_raw) = (culled.buffer, count.buffer);
        let culled_draws = resources.insert_buffer(culled);
        let draw_count_buffer = resources.insert_buffer(count);

        let frames = config.frames_in_flight.max(1);
        let frustum_ring = RingBuffer::new(
            context,
            frames,
            std::mem::size_of::<FrustumUniform>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "frustum planes",
        )?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(4),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(frames as u32),
        ];
        let descriptor_pool = unsafe { DescriptorPool::new(device, 1 + frames as u32, &pool_sizes)? };
        let storage_set = unsafe { descriptor_pool.allocate(device, &[storage_layout])?[0] };
        let frustum_sets =
            unsafe { descriptor_pool.allocate(device, &vec![frustum_layout; frames])? };

        let mut writer = DescriptorWriter::new();
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        writer
            .buffer(storage_set, 0, storage, boxes)
            .buffer(storage_set, 1, storage, input_draws)
            .buffer(storage_set, 2, storage, culled_raw)
            .buffer(storage_set, 3, storage, count_raw);
        for (set, buffer) in frustum_sets.iter().zip(frustum_ring.buffers()) {
            writer.buffer(*set, 0, vk::DescriptorType::UNIFORM_BUFFER, buffer.buffer);
        }
        unsafe { writer.update(device) };

        tracing::info!(
            draws = scene.draw_count,
            frames,
            workgroups = workgroup_count(scene.draw_count),
            "Created culling pass"
        );

        Ok(Self {
            pipeline,
            storage_layout,
            frustum_layout,
            descriptor_pool,
            storage_set,
            frustum_sets,
            frustum_ring,
            culled_draws,
            draw_count_buffer,
            draw_count: scene.draw_count,
            config,
        })
    }

    pub fn bindings(&self, resources: &ResourceTable) -> Result<CullingBindings> {
        let resolve = |handle| {
            resources
                .buffer(handle)
                .map(|b| b.buffer)
                .ok_or_else(|| GpuError::InvalidState("Culling output buffer retired".to_string()))
        };
        Ok(CullingBindings {
            pipeline: self.pipeline.pipeline,
            layout: self.pipeline.layout,
            storage_set: self.storage_set,
            culled_draws: resolve(self.culled_draws)?,
            draw_count_buffer: resolve(self.draw_count_buffer)?,
        })
    }

    /// Write the frustum for `frame_index` and record the culling dispatch.
    pub fn cull(
        &mut self,
        rec: &mut dyn CommandRecorder,
        resources: &ResourceTable,
        frustum: &Frustum,
        frame_index: usize,
    ) -> Result<()> {
        self.frustum_ring.set_frame(frame_index);
        self.frustum_ring
            .write_current(std::slice::from_ref(&FrustumUniform::from(frustum)))?;

        let bindings = self.bindings(resources)?;
        let frustum_set = self.frustum_sets[self.frustum_ring.current_index()];
        let previous_reads = previous_culled_reads(
            self.config.compute_queue_family,
            self.config.graphics_queue_family,
        );
        record_culling(rec, &bindings, frustum_set, self.draw_count, previous_reads);
        Ok(())
    }

    /// Barrier from the culling writes to `dst_stage` indirect reads.
    pub fn add_barrier_for_culled_buffers(
        &self,
        rec: &mut dyn CommandRecorder,
        resources: &ResourceTable,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let bindings = self.bindings(resources)?;
        record_culled_buffers_barrier(
            rec,
            &bindings,
            dst_stage,
            self.config.compute_queue_family,
            self.config.graphics_queue_family,
        );
        Ok(())
    }

    /// Acquire the culled buffers on the graphics command buffer before
    /// drawing. Records nothing when culling runs on the graphics family.
    pub fn add_acquire_for_culled_buffers(
        &self,
        rec: &mut dyn CommandRecorder,
        resources: &ResourceTable,
    ) -> Result<()> {
        let bindings = self.bindings(resources)?;
        record_culled_buffers_acquire(
            rec,
            &bindings,
            self.config.compute_queue_family,
            self.config.graphics_queue_family,
        );
        Ok(())
    }

    pub fn culled_draws(&self) -> BufferHandle {
        self.culled_draws
    }

    pub fn draw_count_buffer(&self) -> BufferHandle {
        self.draw_count_buffer
    }

    /// Upper bound for the indirect-count draw.
    pub fn max_draw_count(&self) -> u32 {
        self.draw_count
    }

    /// Free every object owned by the pass.
    ///
    /// # Safety
    /// No pending submission may use the pass.
    pub unsafe fn destroy(self, context: &GpuContext, resources: &mut ResourceTable) -> Result<()> {
        let device = context.device();
        unsafe {
            self.pipeline.destroy(device);
            self.descriptor_pool.destroy(device);
            device.destroy_descriptor_set_layout(self.storage_layout, None);
            device.destroy_descriptor_set_layout(self.frustum_layout, None);
        }

        let mut allocator = context.allocator().lock();
        for handle in [self.culled_draws, self.draw_count_buffer] {
            if let Some(mut buffer) = resources.remove_buffer(handle) {
                allocator.free_buffer(&mut buffer)?;
            }
        }
        self.frustum_ring.destroy(&mut allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use cinder_gpu::testing::{BufferBarrierRecord, RecordedCommand, RecordingEncoder};
    use glam::{Mat4, Vec3, Vec4};

    fn bindings() -> CullingBindings {
        CullingBindings {
            pipeline: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::from_raw(2),
            storage_set: vk::DescriptorSet::from_raw(3),
            culled_draws: vk::Buffer::from_raw(40),
            draw_count_buffer: vk::Buffer::from_raw(41),
        }
    }

    fn camera_frustum() -> Frustum {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 50.0);
        Frustum::from_view_projection(projection * view)
    }

    fn draw(mesh_id: u32) -> IndirectDrawCommandAndMeshData {
        IndirectDrawCommandAndMeshData {
            index_count: 36,
            instance_count: 1,
            first_index: mesh_id * 36,
            mesh_id,
            ..Default::default()
        }
    }

    /// Tiny deterministic generator so the property test needs no extra crate.
    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self, range: f32) -> f32 {
            self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((self.0 >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * range
        }
    }

    fn same_queue_reads() -> (vk::PipelineStageFlags, vk::AccessFlags) {
        previous_culled_reads(0, 0)
    }

    fn axis_box(half: f32) -> Frustum {
        Frustum::from_planes([
            Vec4::new(1.0, 0.0, 0.0, half),
            Vec4::new(-1.0, 0.0, 0.0, half),
            Vec4::new(0.0, 1.0, 0.0, half),
            Vec4::new(0.0, -1.0, 0.0, half),
            Vec4::new(0.0, 0.0, 1.0, half),
            Vec4::new(0.0, 0.0, -1.0, half),
        ])
    }

    #[test]
    fn workgroups_round_up_past_the_count() {
        assert_eq!(workgroup_count(0), 1);
        assert_eq!(workgroup_count(10), 1);
        assert_eq!(workgroup_count(255), 1);
        assert_eq!(workgroup_count(256), 2);
        assert_eq!(workgroup_count(1000), 4);
    }

    #[test]
    fn culling_resets_count_before_dispatch() {
        let mut rec = RecordingEncoder::new();
        let frustum_set = vk::DescriptorSet::from_raw(9);
        record_culling(&mut rec, &bindings(), frustum_set, 300, same_queue_reads());

        let commands = rec.without_labels();
        assert_eq!(
            commands[1],
            RecordedCommand::FillBuffer {
                buffer: vk::Buffer::from_raw(41),
                offset: 0,
                size: vk::WHOLE_SIZE,
                data: 0,
            }
        );
        assert!(matches!(
            &commands[2],
            RecordedCommand::Barrier { src_stages, dst_stages, .. }
                if *src_stages == vk::PipelineStageFlags::TRANSFER
                    && *dst_stages == vk::PipelineStageFlags::COMPUTE_SHADER
        ));
        assert_eq!(
            commands[4],
            RecordedCommand::BindDescriptorSets(
                vk::PipelineBindPoint::COMPUTE,
                vec![vk::DescriptorSet::from_raw(3), frustum_set]
            )
        );
        assert_eq!(
            commands[5],
            RecordedCommand::PushConstants {
                stages: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                data: 300u32.to_ne_bytes().to_vec(),
            }
        );
        assert_eq!(commands.last(), Some(&RecordedCommand::Dispatch(2, 1, 1)));
        assert_eq!(rec.commands().first(), Some(&RecordedCommand::BeginLabel("GPU Culling".into())));
    }

    #[test]
    fn culling_waits_for_previous_indirect_reads_before_reset() {
        let mut rec = RecordingEncoder::new();
        record_culling(
            &mut rec,
            &bindings(),
            vk::DescriptorSet::from_raw(9),
            10,
            same_queue_reads(),
        );

        let commands = rec.without_labels();
        let fill = commands
            .iter()
            .position(|c| matches!(c, RecordedCommand::FillBuffer { .. }))
            .unwrap();
        let reuse = |raw| BufferBarrierRecord {
            buffer: vk::Buffer::from_raw(raw),
            src_access: vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
            dst_access: vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_WRITE,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        };
        let expected = RecordedCommand::Barrier {
            src_stages: vk::PipelineStageFlags::DRAW_INDIRECT
                | vk::PipelineStageFlags::VERTEX_SHADER,
            dst_stages: vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
            buffers: vec![reuse(40), reuse(41)],
            images: vec![],
        };
        let barrier = commands.iter().position(|c| *c == expected).unwrap();
        assert!(barrier < fill);
    }

    #[test]
    fn reads_on_another_family_need_no_access_scope() {
        assert_eq!(
            previous_culled_reads(2, 0),
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        );
    }

    #[test]
    fn culled_buffers_move_from_compute_to_graphics() {
        let mut rec = RecordingEncoder::new();
        record_culled_buffers_barrier(
            &mut rec,
            &bindings(),
            vk::PipelineStageFlags::DRAW_INDIRECT,
            2,
            0,
        );

        let expected = |raw| BufferBarrierRecord {
            buffer: vk::Buffer::from_raw(raw),
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
            src_queue_family: 2,
            dst_queue_family: 0,
        };
        // Release half: graphics stages may not exist on the compute queue.
        assert_eq!(
            rec.commands(),
            &[RecordedCommand::Barrier {
                src_stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stages: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                buffers: vec![expected(40), expected(41)],
                images: vec![],
            }]
        );
    }

    #[test]
    fn culled_buffers_within_one_family_keep_the_draw_stage() {
        let mut rec = RecordingEncoder::new();
        let dst = vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER;
        record_culled_buffers_barrier(&mut rec, &bindings(), dst, 0, 0);

        assert!(matches!(
            rec.commands(),
            [RecordedCommand::Barrier { src_stages, dst_stages, buffers, .. }]
                if *src_stages == vk::PipelineStageFlags::COMPUTE_SHADER
                    && *dst_stages == dst
                    && buffers.iter().all(|b| b.src_queue_family == 0 && b.dst_queue_family == 0)
        ));
    }

    #[test]
    fn acquire_is_skipped_within_one_family() {
        let mut rec = RecordingEncoder::new();
        record_culled_buffers_acquire(&mut rec, &bindings(), 0, 0);
        assert!(rec.commands().is_empty());

        record_culled_buffers_acquire(&mut rec, &bindings(), 2, 0);
        assert_eq!(rec.barrier_count(), 1);
    }

    #[test]
    fn ten_boxes_three_outside() {
        let frustum = camera_frustum();
        let mut boxes: Vec<MeshBoundingBox> = (0..7)
            .map(|i| MeshBoundingBox::new(Vec3::new(i as f32 - 3.0, 0.0, 0.0), Vec3::splat(0.4)))
            .collect();
        // behind the camera, past the far plane, far to the left
        boxes.push(MeshBoundingBox::new(Vec3::new(0.0, 0.0, 30.0), Vec3::splat(0.4)));
        boxes.push(MeshBoundingBox::new(Vec3::new(0.0, 0.0, -200.0), Vec3::splat(0.4)));
        boxes.push(MeshBoundingBox::new(Vec3::new(-500.0, 0.0, 0.0), Vec3::splat(0.4)));

        // shuffle the draw order so mesh ids are not positions
        let draws: Vec<_> = [9, 3, 0, 7, 5, 1, 8, 2, 6, 4].into_iter().map(draw).collect();
        let survivors = cull_on_cpu(&frustum, &draws, &boxes);

        assert_eq!(survivors.len(), 7);
        let mut ids: Vec<u32> = survivors.iter().map(|d| d.mesh_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn culling_keeps_exactly_the_visible_draws() {
        let frustum = camera_frustum();
        let mut rng = Lcg(0x5eed);
        let boxes: Vec<MeshBoundingBox> = (0..500)
            .map(|_| {
                let center = Vec3::new(rng.next_f32(60.0), rng.next_f32(60.0), rng.next_f32(60.0));
                let extents = Vec3::splat(rng.next_f32(2.0).abs() + 0.01);
                MeshBoundingBox::new(center, extents)
            })
            .collect();
        let draws: Vec<_> = (0..500).map(draw).collect();

        let survivors = cull_on_cpu(&frustum, &draws, &boxes);

        assert!(survivors.len() <= draws.len());
        assert!(!survivors.is_empty());
        assert!(survivors.len() < draws.len());
        for d in &draws {
            let b = &boxes[d.mesh_id as usize];
            let kept = survivors.iter().any(|s| s.mesh_id == d.mesh_id);
            assert_eq!(kept, frustum.is_box_visible(b.center(), b.extents()));
        }
    }

    #[test]
    fn boxes_inside_the_frustum_are_all_kept() {
        let frustum = camera_frustum();
        let boxes: Vec<MeshBoundingBox> = (0..12)
            .map(|i| {
                let x = (i % 4) as f32 - 1.5;
                let y = (i / 4) as f32 - 1.0;
                MeshBoundingBox::new(Vec3::new(x, y, 0.0), Vec3::splat(0.25))
            })
            .collect();
        let draws: Vec<_> = (0..12).map(draw).collect();

        assert_eq!(cull_on_cpu(&frustum, &draws, &boxes).len(), draws.len());
    }

    #[test]
    fn boxes_outside_the_frustum_are_all_rejected() {
        let frustum = camera_frustum();
        let boxes = vec![
            MeshBoundingBox::new(Vec3::new(0.0, 0.0, 20.0), Vec3::splat(0.5)),
            MeshBoundingBox::new(Vec3::new(0.0, 0.0, -100.0), Vec3::splat(0.5)),
            MeshBoundingBox::new(Vec3::new(300.0, 0.0, 0.0), Vec3::splat(0.5)),
            MeshBoundingBox::new(Vec3::new(0.0, -300.0, 0.0), Vec3::splat(0.5)),
        ];
        let draws: Vec<_> = (0..4).map(draw).collect();

        assert!(cull_on_cpu(&frustum, &draws, &boxes).is_empty());
    }

    #[test]
    fn box_touching_a_plane_is_kept() {
        let frustum = axis_box(10.0);
        // distance -1 to the left plane, radius 1
        let touching = MeshBoundingBox::new(Vec3::new(-11.0, 0.0, 0.0), Vec3::ONE);
        let beyond = MeshBoundingBox::new(Vec3::new(-11.5, 0.0, 0.0), Vec3::ONE);
        let draws: Vec<_> = (0..2).map(draw).collect();

        let survivors = cull_on_cpu(&frustum, &draws, &[touching, beyond]);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].mesh_id, 0);
    }

    #[test]
    fn empty_scene_yields_no_draws() {
        assert!(cull_on_cpu(&camera_frustum(), &[], &[]).is_empty());
    }
}
