//! Host-visible staging buffers bound to a GPU-only destination.

use crate::error::Result;
use crate::memory::GpuBuffer;
use crate::recorder::CommandRecorder;
use ash::vk;

/// A host-visible buffer whose contents are copied into one GPU-only buffer.
///
/// The destination relationship is fixed at construction. Once the copy is
/// recorded, hand [`StagingBuffer::into_buffer`] to the queue manager so the
/// staging memory is freed only after the submission completes.
pub struct StagingBuffer {
    buffer: GpuBuffer,
    destination: vk::Buffer,
    destination_size: u64,
}

impl StagingBuffer {
    /// Bind `buffer` as the staging source for `destination`.
    ///
    /// # Panics
    /// If `destination` is not GPU-only with `TRANSFER_DST` usage, or if
    /// `buffer` cannot be mapped as a transfer source.
    pub fn new(buffer: GpuBuffer, destination: &GpuBuffer) -> Self {
        assert!(
            destination.is_gpu_only(),
            "Staging destination must be GPU-only, found {:?}",
            destination.location
        );
        assert!(
            destination
                .usage
                .contains(vk::BufferUsageFlags::TRANSFER_DST),
            "Staging destination must have TRANSFER_DST usage, found {:?}",
            destination.usage
        );
        assert!(
            !buffer.is_gpu_only() && buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC),
            "Staging buffer must be host-visible with TRANSFER_SRC usage"
        );

        Self {
            buffer,
            destination: destination.buffer,
            destination_size: destination.size,
        }
    }

    /// Size of the staging memory in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.size
    }

    /// The destination buffer handle.
    pub fn destination(&self) -> vk::Buffer {
        self.destination
    }

    /// Copy host data into the mapped staging memory.
    pub fn copy_data_to_buffer(&self, data: &[u8]) -> Result<()> {
        self.buffer.copy_data_to_buffer(data)
    }

    /// Record a copy of the staging contents into the destination.
    ///
    /// Copies from `src_offset` to the end of the staging buffer, clamped to
    /// the space left in the destination after `dst_offset`.
    pub fn upload_staging_buffer_to_gpu(
        &self,
        rec: &mut dyn CommandRecorder,
        src_offset: u64,
        dst_offset: u64,
    ) {
        assert!(
            src_offset < self.buffer.size,
            "Staging source offset {src_offset} out of range ({} bytes)",
            self.buffer.size
        );
        assert!(
            dst_offset < self.destination_size,
            "Staging destination offset {dst_offset} out of range ({} bytes)",
            self.destination_size
        );

        let size = (self.buffer.size - src_offset).min(self.destination_size - dst_offset);
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        rec.copy_buffer(self.buffer.buffer, self.destination, &[region]);
    }

    /// Release the staging memory for deferred disposal.
    pub fn into_buffer(self) -> GpuBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_buffer, RecordedCommand, RecordingEncoder};
    use gpu_allocator::MemoryLocation;

    fn destination(size: u64) -> GpuBuffer {
        fake_buffer(
            2,
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
    }

    fn staging(size: u64) -> GpuBuffer {
        fake_buffer(
            1,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
    }

    #[test]
    fn records_copy_into_destination() {
        let dst = destination(256);
        let staging = StagingBuffer::new(staging(128), &dst);
        let mut rec = RecordingEncoder::new();

        staging.upload_staging_buffer_to_gpu(&mut rec, 0, 64);

        assert_eq!(staging.destination(), dst.buffer);
        assert_eq!(
            rec.commands(),
            &[RecordedCommand::CopyBuffer {
                src: staging.into_buffer().buffer,
                dst: dst.buffer,
                regions: vec![(0, 64, 128)],
            }]
        );
    }

    #[test]
    fn copy_is_clamped_to_destination() {
        let dst = destination(100);
        let staging = StagingBuffer::new(staging(128), &dst);
        let mut rec = RecordingEncoder::new();

        staging.upload_staging_buffer_to_gpu(&mut rec, 16, 60);

        match &rec.commands()[0] {
            RecordedCommand::CopyBuffer { regions, .. } => assert_eq!(regions, &vec![(16, 60, 40)]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "GPU-only")]
    fn host_visible_destination_is_rejected() {
        let dst = fake_buffer(
            2,
            64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::CpuToGpu,
        );
        let _ = StagingBuffer::new(staging(64), &dst);
    }

    #[test]
    #[should_panic(expected = "TRANSFER_DST")]
    fn destination_without_transfer_dst_is_rejected() {
        let dst = fake_buffer(
            2,
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        );
        let _ = StagingBuffer::new(staging(64), &dst);
    }
}
