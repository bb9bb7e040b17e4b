//! Flattening a [`Model`] into GPU buffers.

use ash::vk;
use cinder_core::{IndirectDrawCommandAndMeshData, MeshBoundingBox, Model};
use cinder_gpu::{
    BufferHandle, CommandQueueManager, CommandRecorder, GpuContext, GpuError, ResourceTable,
    Result, SubmitBatch,
};

/// Byte contents and usage of one scene buffer.
pub struct SceneBufferData {
    pub name: &'static str,
    pub usage: vk::BufferUsageFlags,
    pub bytes: Vec<u8>,
}

/// CPU-side contents of every scene buffer, in upload order: vertices,
/// indices, indirect draws, bounding boxes.
pub struct SceneData {
    pub buffers: [SceneBufferData; 4],
    pub draw_count: u32,
    pub index_count: u32,
}

impl SceneData {
    /// Flatten `model`. A model without meshes or indices has nothing to
    /// draw and is rejected, as is one with dangling references.
    pub fn from_model(model: &Model) -> Result<Self> {
        model.validate()?;
        if model.meshes.is_empty() || model.index_count() == 0 {
            return Err(GpuError::InvalidState(
                "Scene has no meshes to upload".to_string(),
            ));
        }

        let draws = model.indirect_draw_commands();
        let boxes = model.mesh_bounding_boxes();
        let draw_usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER;

        Ok(Self {
            draw_count: draws.len() as u32,
            index_count: model.index_count() as u32,
            buffers: [
                SceneBufferData {
                    name: "scene vertices",
                    usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                    bytes: bytemuck::cast_slice(&model.merged_vertices()).to_vec(),
                },
                SceneBufferData {
                    name: "scene indices",
                    usage: vk::BufferUsageFlags::INDEX_BUFFER,
                    bytes: bytemuck::cast_slice(&model.merged_indices()).to_vec(),
                },
                SceneBufferData {
                    name: "scene indirect draws",
                    usage: draw_usage,
                    bytes: bytemuck::cast_slice::<IndirectDrawCommandAndMeshData, u8>(&draws)
                        .to_vec(),
                },
                SceneBufferData {
                    name: "scene bounding boxes",
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    bytes: bytemuck::cast_slice::<MeshBoundingBox, u8>(&boxes).to_vec(),
                },
            ],
        })
    }
}

/// Handles of the uploaded scene buffers.
#[derive(Clone, Copy, Debug)]
pub struct SceneBuffers {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
    pub draws: BufferHandle,
    pub bounding_boxes: BufferHandle,
    pub draw_count: u32,
    pub index_count: u32,
}

impl SceneBuffers {
    /// Create GPU-only scene buffers in `resources` and fill them through
    /// staging buffers.
    ///
    /// Records into the manager's next command buffer, submits and waits, so
    /// the staging memory is freed before this returns.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload(
        context: &GpuContext,
        manager: &mut CommandQueueManager,
        resources: &mut ResourceTable,
        model: &Model,
    ) -> Result<Self> {
        let data = SceneData::from_model(model)?;

        let mut handles = Vec::with_capacity(data.buffers.len());
        let cmd = manager.get_cmd_buffer_to_begin()?;
        for buffer in &data.buffers {
            let gpu_buffer =
                context.create_gpu_only_buffer(buffer.bytes.len() as u64, buffer.usage, buffer.name)?;
            let mut encoder = context.encoder(cmd);
            let upload = context.upload_to_gpu_buffer(manager, &mut encoder, &gpu_buffer, &buffer.bytes);
            handles.push(resources.insert_buffer(gpu_buffer));
            upload?;
        }

        let barriers: Vec<vk::BufferMemoryBarrier<'_>> = handles
            .iter()
            .filter_map(|&handle| resources.buffer(handle))
            .map(|buffer| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(
                        vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                            | vk::AccessFlags::INDEX_READ
                            | vk::AccessFlags::INDIRECT_COMMAND_READ
                            | vk::AccessFlags::SHADER_READ,
                    )
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.buffer)
                    .size(vk::WHOLE_SIZE)
            })
            .collect();
        context.encoder(cmd).pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::DRAW_INDIRECT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            &barriers,
            &[],
        );

        manager.end_cmd_buffer(cmd)?;
        manager.submit(&SubmitBatch::new(cmd))?;
        manager.wait_until_submit_is_complete()?;
        manager.go_to_next_cmd_buffer();

        tracing::info!(
            meshes = data.draw_count,
            indices = data.index_count,
            bytes = data.buffers.iter().map(|b| b.bytes.len()).sum::<usize>(),
            "Uploaded scene"
        );

        Ok(Self {
            vertices: handles[0],
            indices: handles[1],
            draws: handles[2],
            bounding_boxes: handles[3],
            draw_count: data.draw_count,
            index_count: data.index_count,
        })
    }

    /// Hand the scene buffers to `manager` for fence-gated disposal.
    pub fn retire<D: cinder_gpu::QueueDevice>(
        self,
        resources: &mut ResourceTable,
        manager: &mut CommandQueueManager<D>,
    ) {
        for handle in [self.vertices, self.indices, self.draws, self.bounding_boxes] {
            resources.retire_buffer(handle, manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{Material, Mesh, Vertex};

    fn quad(x: f32, material: i32) -> Mesh {
        let v = |px: f32, py: f32| Vertex::new([x + px, py, 0.0], [0.0, 0.0, 1.0], [px, py]);
        Mesh {
            vertices: vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)],
            indices: vec![0, 1, 2, 0, 2, 3],
            material,
        }
    }

    #[test]
    fn buffer_sizes_follow_the_model() {
        let model = Model {
            meshes: vec![quad(0.0, 0), quad(4.0, -1), quad(8.0, 1)],
            materials: vec![Material::default(); 2],
            ..Default::default()
        };
        let data = SceneData::from_model(&model).unwrap();

        assert_eq!(data.draw_count, 3);
        assert_eq!(data.index_count, 18);
        let sizes: Vec<usize> = data.buffers.iter().map(|b| b.bytes.len()).collect();
        assert_eq!(sizes, vec![12 * 32, 18 * 4, 3 * 28, 3 * 32]);
    }

    #[test]
    fn draw_buffer_is_indirect_and_storage() {
        let model = Model {
            meshes: vec![quad(0.0, 0)],
            materials: vec![Material::default()],
            ..Default::default()
        };
        let data = SceneData::from_model(&model).unwrap();
        let draws = &data.buffers[2];
        assert!(draws.usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
        assert!(draws.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));

        let first: IndirectDrawCommandAndMeshData =
            bytemuck::pod_read_unaligned(&draws.bytes[..28]);
        assert_eq!(first.index_count, 6);
        assert_eq!(first.instance_count, 1);
    }

    #[test]
    fn empty_model_is_rejected() {
        assert!(SceneData::from_model(&Model::default()).is_err());
    }

    #[test]
    fn dangling_material_is_rejected() {
        let model = Model {
            meshes: vec![quad(0.0, 2)],
            ..Default::default()
        };
        assert!(matches!(
            SceneData::from_model(&model),
            Err(GpuError::Model(_))
        ));
    }
}
