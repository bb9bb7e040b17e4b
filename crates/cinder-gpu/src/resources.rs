//! Generational handle arena for buffers and textures.
//!
//! Passes keep [`BufferHandle`]s and [`TextureHandle`]s instead of the
//! resources. Removing a resource invalidates every copy of its handle, so a
//! stale handle resolves to `None` rather than to a freed buffer.

use crate::command::CommandQueueManager;
use crate::device::QueueDevice;
use crate::memory::GpuBuffer;
use crate::texture::Texture;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle to a buffer in a [`ResourceTable`].
    pub struct BufferHandle;
    /// Handle to a texture in a [`ResourceTable`].
    pub struct TextureHandle;
}

#[derive(Default)]
pub struct ResourceTable {
    buffers: SlotMap<BufferHandle, GpuBuffer>,
    textures: SlotMap<TextureHandle, Texture>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_buffer(&mut self, buffer: GpuBuffer) -> BufferHandle {
        self.buffers.insert(buffer)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&GpuBuffer> {
        self.buffers.get(handle)
    }

    /// Take the buffer out of the table.
    ///
    /// The caller owns it from here; if in-flight work may still read it,
    /// use [`Self::retire_buffer`] instead.
    pub fn remove_buffer(&mut self, handle: BufferHandle) -> Option<GpuBuffer> {
        self.buffers.remove(handle)
    }

    pub fn insert_texture(&mut self, texture: Texture) -> TextureHandle {
        self.textures.insert(texture)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut Texture> {
        self.textures.get_mut(handle)
    }

    pub fn remove_texture(&mut self, handle: TextureHandle) -> Option<Texture> {
        self.textures.remove(handle)
    }

    /// Remove a buffer and free it once the manager's current submission
    /// completes. Returns false for a stale handle.
    pub fn retire_buffer<D: QueueDevice>(
        &mut self,
        handle: BufferHandle,
        manager: &mut CommandQueueManager<D>,
    ) -> bool {
        match self.buffers.remove(handle) {
            Some(buffer) => {
                manager.dispose_when_submit_completes(buffer);
                true
            }
            None => false,
        }
    }

    pub fn retire_texture<D: QueueDevice>(
        &mut self,
        handle: TextureHandle,
        manager: &mut CommandQueueManager<D>,
    ) -> bool {
        match self.textures.remove(handle) {
            Some(texture) => {
                manager.dispose_texture_when_submit_completes(texture);
                true
            }
            None => false,
        }
    }

    /// Hand every resource to `manager` for fence-gated disposal.
    pub fn retire_all<D: QueueDevice>(&mut self, manager: &mut CommandQueueManager<D>) {
        let buffers = self.buffers.len();
        let textures = self.textures.len();
        for (_, buffer) in self.buffers.drain() {
            manager.dispose_when_submit_completes(buffer);
        }
        for (_, texture) in self.textures.drain() {
            manager.dispose_texture_when_submit_completes(texture);
        }
        tracing::debug!(buffers, textures, queue = manager.name(), "Retired resource table");
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandQueueConfig;
    use crate::testing::{fake_buffer, fake_texture, FakeQueueDevice};
    use crate::texture::MipPolicy;
    use ash::vk;
    use ash::vk::Handle;
    use gpu_allocator::MemoryLocation;
    use std::sync::Arc;

    fn vertex_buffer(raw: u64) -> GpuBuffer {
        fake_buffer(
            raw,
            1024,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
    }

    #[test]
    fn removed_handle_is_invalidated() {
        let mut table = ResourceTable::new();
        let handle = table.insert_buffer(vertex_buffer(10));
        let stale = handle;

        let removed = table.remove_buffer(handle).unwrap();
        assert_eq!(removed.buffer, vk::Buffer::from_raw(10));
        assert!(table.buffer(stale).is_none());
        assert!(table.remove_buffer(stale).is_none());

        // the slot is reused under a new generation
        let fresh = table.insert_buffer(vertex_buffer(11));
        assert_ne!(fresh, stale);
        assert!(table.buffer(stale).is_none());
        assert_eq!(table.buffer(fresh).unwrap().buffer, vk::Buffer::from_raw(11));
    }

    #[test]
    fn retire_defers_to_the_manager() {
        let device = Arc::new(FakeQueueDevice::new());
        let mut mgr = CommandQueueManager::new(
            Arc::clone(&device),
            device.queue(0),
            CommandQueueConfig::new(2, 1, "resources"),
        )
        .unwrap();

        let mut table = ResourceTable::new();
        let buffer = table.insert_buffer(vertex_buffer(20));
        let texture = table.insert_texture(fake_texture(4, 4, MipPolicy::Single));

        assert!(table.retire_buffer(buffer, &mut mgr));
        assert!(table.retire_texture(texture, &mut mgr));
        assert!(!table.retire_buffer(buffer, &mut mgr));
        assert!(table.is_empty());
        assert_eq!(mgr.pending_disposals(), 2);
        assert!(device.released_buffers().is_empty());

        mgr.wait_until_all_submits_are_complete().unwrap();
        assert_eq!(device.released_buffers(), vec![vk::Buffer::from_raw(20)]);
        assert_eq!(device.released_textures(), vec!["fake-1".to_string()]);
    }
}
