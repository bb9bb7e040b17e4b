//! Descriptor set layouts, pools and batched writes.

use crate::error::Result;
use ash::vk;

/// Descriptor set layout builder.
///
/// Bindings added with [`Self::sampled_image_array`] are partially bound, so
/// a texture array can be filled while textures stream in.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
    flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorSetLayoutBuilder<'_> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    #[must_use]
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// A combined image sampler array whose elements may be left unwritten.
    #[must_use]
    pub fn sampled_image_array(
        mut self,
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage_flags,
        );
        if let Some(last) = self.flags.last_mut() {
            *last = vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'_>] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let mut binding_flags =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings)
            .push_next(&mut binding_flags);

        Ok(unsafe { device.create_descriptor_set_layout(&layout_info, None)? })
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a pool with room for `max_sets` sets of the given sizes.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
        Ok(Self { pool })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        Ok(unsafe { device.allocate_descriptor_sets(&alloc_info)? })
    }

    /// # Safety
    /// The device must be valid and no set from the pool may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

enum PendingInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

struct PendingWrite {
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    descriptor_type: vk::DescriptorType,
    info: PendingInfo,
}

/// Collects descriptor writes and applies them in one
/// `vkUpdateDescriptorSets` call.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the whole of `buffer` to `binding` of `set`.
    pub fn buffer(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
    ) -> &mut Self {
        self.buffer_range(set, binding, descriptor_type, buffer, 0, vk::WHOLE_SIZE)
    }

    pub fn buffer_range(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            set,
            binding,
            array_element: 0,
            descriptor_type,
            info: PendingInfo::Buffer(vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            }),
        });
        self
    }

    /// Write element `array_element` of a combined image sampler binding.
    pub fn sampled_image(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            set,
            binding,
            array_element,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: PendingInfo::Image(vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply and clear every pending write.
    ///
    /// # Safety
    /// The device, sets and bound resources must be valid, and no set may be
    /// in use by a pending submission unless its binding is update-after-bind.
    pub unsafe fn update(&mut self, device: &ash::Device) {
        if self.writes.is_empty() {
            return;
        }
        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .map(|w| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.descriptor_type);
                match &w.info {
                    PendingInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                    PendingInfo::Image(info) => write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };
        drop(writes);
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_array_binding_is_partially_bound() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image_array(1, 64, vk::ShaderStageFlags::FRAGMENT);

        assert_eq!(builder.bindings().len(), 2);
        assert_eq!(builder.bindings()[1].descriptor_count, 64);
        assert_eq!(builder.flags[0], vk::DescriptorBindingFlags::empty());
        assert_eq!(builder.flags[1], vk::DescriptorBindingFlags::PARTIALLY_BOUND);
    }

    #[test]
    fn writer_batches_until_update() {
        let mut writer = DescriptorWriter::new();
        writer
            .buffer(
                vk::DescriptorSet::null(),
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::Buffer::null(),
            )
            .sampled_image(
                vk::DescriptorSet::null(),
                1,
                3,
                vk::ImageView::null(),
                vk::Sampler::null(),
            );
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.writes[1].array_element, 3);
    }
}
