//! One host-visible buffer per frame in flight.

use crate::context::GpuContext;
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;

/// A ring of equally sized, persistently mapped buffers.
///
/// The CPU writes the current frame's slot while the GPU may still read
/// the others, so per-frame data never needs a CPU/GPU barrier.
pub struct RingBuffer {
    buffers: Vec<GpuBuffer>,
    index: usize,
}

impl RingBuffer {
    /// Allocate `frames` host-visible buffers of `size` bytes.
    pub fn new(
        context: &GpuContext,
        frames: usize,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let buffers = (0..frames)
            .map(|i| context.create_buffer(size, usage, MemoryLocation::CpuToGpu, &format!("{name} {i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_buffers(buffers))
    }

    /// # Panics
    /// If `buffers` is empty.
    pub fn from_buffers(buffers: Vec<GpuBuffer>) -> Self {
        assert!(!buffers.is_empty(), "ring buffer needs at least one slot");
        Self { buffers, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &GpuBuffer {
        &self.buffers[self.index]
    }

    /// Slot for `frame`, wrapping.
    pub fn slot(&self, frame: usize) -> &GpuBuffer {
        &self.buffers[frame % self.buffers.len()]
    }

    pub fn buffers(&self) -> &[GpuBuffer] {
        &self.buffers
    }

    /// Move to the next slot and return it.
    pub fn advance(&mut self) -> &GpuBuffer {
        self.index = (self.index + 1) % self.buffers.len();
        &self.buffers[self.index]
    }

    /// Select the slot for `frame`.
    pub fn set_frame(&mut self, frame: usize) {
        self.index = frame % self.buffers.len();
    }

    pub fn write_current<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.current().write(data)
    }

    /// Hand the buffers back, for example to a queue manager's deferred
    /// disposal list.
    pub fn into_buffers(self) -> Vec<GpuBuffer> {
        self.buffers
    }

    /// Free every slot now. No submission may still read them.
    pub fn destroy(self, allocator: &mut GpuAllocator) -> Result<()> {
        for mut buffer in self.buffers {
            allocator.free_buffer(&mut buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_buffer;
    use ash::vk::Handle;

    fn ring(n: u64) -> RingBuffer {
        RingBuffer::from_buffers(
            (0..n)
                .map(|i| {
                    fake_buffer(
                        100 + i,
                        96,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                        MemoryLocation::CpuToGpu,
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn advance_wraps() {
        let mut ring = ring(3);
        let seen: Vec<u64> = (0..5).map(|_| ring.advance().buffer.as_raw()).collect();
        assert_eq!(seen, vec![101, 102, 100, 101, 102]);
        assert_eq!(ring.current_index(), 2);
    }

    #[test]
    fn frame_slots_wrap() {
        let mut ring = ring(2);
        assert_eq!(ring.slot(5).buffer.as_raw(), 101);
        ring.set_frame(4);
        assert_eq!(ring.current().buffer.as_raw(), 100);
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn empty_ring_panics() {
        RingBuffer::from_buffers(Vec::new());
    }
}
