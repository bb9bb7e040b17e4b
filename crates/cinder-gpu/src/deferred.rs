//! Resources waiting on a fence slot.
//!
//! Each fence slot of a [`crate::command::CommandQueueManager`] owns one
//! [`SlotDisposals`]. Everything registered while the slot is current is
//! released together, once, after that slot's fence has been observed
//! signaled.

use crate::device::QueueDevice;
use crate::memory::GpuBuffer;
use crate::texture::Texture;

/// Cleanup work that runs after a submission completes.
pub type DeferredCallback = Box<dyn FnOnce() + Send>;

/// Buffers, textures and callbacks gated on one fence slot.
#[derive(Default)]
pub struct SlotDisposals {
    buffers: Vec<GpuBuffer>,
    textures: Vec<Texture>,
    callbacks: Vec<DeferredCallback>,
}

impl SlotDisposals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_buffer(&mut self, buffer: GpuBuffer) {
        self.buffers.push(buffer);
    }

    pub fn push_texture(&mut self, texture: Texture) {
        self.textures.push(texture);
    }

    pub fn push_callback(&mut self, callback: DeferredCallback) {
        self.callbacks.push(callback);
    }

    /// Number of pending buffers, textures and callbacks.
    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free every resource and run every callback, leaving the slot empty.
    ///
    /// Release failures are logged and do not stop the rest of the slot
    /// from being drained.
    pub fn release<D: QueueDevice + ?Sized>(&mut self, device: &D, queue_name: &str) {
        if self.is_empty() {
            return;
        }
        tracing::debug!(
            queue = queue_name,
            buffers = self.buffers.len(),
            textures = self.textures.len(),
            callbacks = self.callbacks.len(),
            "Releasing completed submission resources"
        );

        for buffer in self.buffers.drain(..) {
            if let Err(e) = device.release_buffer(buffer) {
                tracing::warn!("{queue_name}: failed to free buffer: {e}");
            }
        }
        for texture in self.textures.drain(..) {
            let name = texture.name().to_string();
            if let Err(e) = device.release_texture(texture) {
                tracing::warn!("{queue_name}: failed to free texture {name}: {e}");
            }
        }
        for callback in self.callbacks.drain(..) {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_buffer, fake_texture, FakeQueueDevice};
    use crate::texture::MipPolicy;
    use ash::vk;
    use gpu_allocator::MemoryLocation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn release_drains_everything_once() {
        let device = FakeQueueDevice::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut slot = SlotDisposals::new();

        slot.push_buffer(fake_buffer(
            5,
            64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ));
        slot.push_texture(fake_texture(4, 4, MipPolicy::Single));
        let counter = Arc::clone(&calls);
        slot.push_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(slot.len(), 3);

        slot.release(&device, "test");
        slot.release(&device, "test");

        assert!(slot.is_empty());
        assert_eq!(device.released_buffers().len(), 1);
        assert_eq!(device.released_textures(), vec!["fake-1".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
