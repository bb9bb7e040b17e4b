//! Textures with tracked image layout.
//!
//! A [`Texture`] owns one image and its primary view and remembers the layout
//! the image will be in once every command recorded so far has executed. All
//! layout changes go through [`Texture::transition_image_layout`]; changes made
//! outside the command stream (presentation, render pass final layouts) are
//! reported with [`Texture::set_image_layout`].

use crate::error::{GpuError, Result};
use crate::format;
use crate::layout;
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use crate::ownership::QueueOwnershipTransfer;
use crate::recorder::CommandRecorder;
use ash::vk;

/// Number of levels in a full mip chain for a `width x height` image.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).max(1).leading_zeros()
}

/// Extent of `level` in a chain starting at `extent`, never below one texel.
pub fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
        depth: (extent.depth >> level).max(1),
    }
}

/// How a texture gets its mip levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MipPolicy {
    /// Level 0 only.
    Single,
    /// Levels supplied by the caller, tightly packed after level 0.
    Explicit(u32),
    /// A full chain generated from level 0 with linear blits.
    Generate,
}

/// Parameters for [`crate::context::GpuContext::create_texture`].
#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub usage: vk::ImageUsageFlags,
    pub mips: MipPolicy,
    pub name: String,
}

impl TextureDesc {
    /// A sampled RGBA texture filled by staging uploads.
    pub fn sampled(width: u32, height: u32, format: vk::Format, name: impl Into<String>) -> Self {
        Self {
            format,
            width,
            height,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            mips: MipPolicy::Single,
            name: name.into(),
        }
    }

    /// A render target written by attachments.
    pub fn attachment(width: u32, height: u32, format: vk::Format, name: impl Into<String>) -> Self {
        let attachment_usage = if format::is_depth(format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        Self {
            format,
            width,
            height,
            usage: attachment_usage | vk::ImageUsageFlags::SAMPLED,
            mips: MipPolicy::Single,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn with_mips(mut self, mips: MipPolicy) -> Self {
        self.mips = mips;
        self
    }

    /// Levels the image is created with.
    pub fn mip_levels(&self) -> u32 {
        match self.mips {
            MipPolicy::Single => 1,
            MipPolicy::Explicit(levels) => levels.clamp(1, mip_level_count(self.width, self.height)),
            MipPolicy::Generate => mip_level_count(self.width, self.height),
        }
    }

    /// Usage flags including the transfer bits mip generation needs.
    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        match self.mips {
            MipPolicy::Generate => {
                self.usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
            }
            _ => self.usage,
        }
    }
}

/// A GPU image, its primary view and its tracked layout.
pub struct Texture {
    image: GpuImage,
    view: vk::ImageView,
    mip_levels: u32,
    generate_mips: bool,
    supports_linear_blit: bool,
    layout: vk::ImageLayout,
    owns_image: bool,
    name: String,
}

impl Texture {
    /// Assemble a texture from an image this crate allocated.
    pub(crate) fn from_allocated(
        image: GpuImage,
        view: vk::ImageView,
        desc: &TextureDesc,
        supports_linear_blit: bool,
    ) -> Self {
        Self {
            image,
            view,
            mip_levels: desc.mip_levels(),
            generate_mips: desc.mips == MipPolicy::Generate,
            supports_linear_blit,
            layout: vk::ImageLayout::UNDEFINED,
            owns_image: true,
            name: desc.name.clone(),
        }
    }

    /// Wrap an image owned elsewhere, such as a swapchain image.
    ///
    /// [`Texture::destroy`] leaves both the image and the view alone.
    pub fn wrap_external(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        name: impl Into<String>,
    ) -> Self {
        Self {
            image: GpuImage {
                image,
                allocation: None,
                format,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            },
            view,
            mip_levels: 1,
            generate_mips: false,
            supports_linear_blit: false,
            layout: vk::ImageLayout::UNDEFINED,
            owns_image: false,
            name: name.into(),
        }
    }

    pub fn image(&self) -> vk::Image {
        self.image.image
    }

    /// The primary view covering every mip level.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.image.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.image.extent
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.image.extent.width,
            height: self.image.extent.height,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last layout recorded for the image.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a layout change that happened outside this texture's barriers.
    pub fn set_image_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    pub fn is_depth(&self) -> bool {
        format::is_depth(self.image.format)
    }

    pub fn is_stencil(&self) -> bool {
        format::is_stencil(self.image.format)
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        format::aspect_mask(self.image.format)
    }

    /// Bytes needed to stage level 0.
    pub fn device_size(&self) -> u64 {
        let bpp = format::bytes_per_pixel(self.image.format)
            .unwrap_or_else(|| panic!("No texel size for format {:?}", self.image.format));
        u64::from(self.image.extent.width) * u64::from(self.image.extent.height) * u64::from(bpp)
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect_mask(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Record one barrier moving every mip level to `new_layout`.
    ///
    /// No-op when the tracked layout already matches.
    ///
    /// # Panics
    /// If either layout has no entry in the transition table.
    pub fn transition_image_layout(
        &mut self,
        rec: &mut dyn CommandRecorder,
        new_layout: vk::ImageLayout,
    ) {
        if self.layout == new_layout {
            return;
        }

        let transition = layout::transition(self.layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(transition.src.access)
            .dst_access_mask(transition.dst.access)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.image)
            .subresource_range(self.full_range());

        rec.pipeline_barrier(transition.src.stages, transition.dst.stages, &[], &[barrier]);
        self.layout = new_layout;
    }

    /// Copy `data` through `staging` into the image, leaving it in
    /// `TRANSFER_DST_OPTIMAL`.
    ///
    /// `data` holds level 0, or every level tightly packed for
    /// [`MipPolicy::Explicit`] textures.
    pub fn upload_only(
        &mut self,
        rec: &mut dyn CommandRecorder,
        staging: &GpuBuffer,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 > staging.size {
            return Err(GpuError::InvalidState(format!(
                "{}: {} bytes do not fit the {} byte staging buffer",
                self.name,
                data.len(),
                staging.size
            )));
        }
        staging.copy_data_to_buffer(data)?;
        self.record_upload(rec, staging.buffer, data.len() as u64);
        Ok(())
    }

    /// Record the transition and buffer-to-image copy for `byte_len` bytes
    /// already written to `staging`.
    pub fn record_upload(&mut self, rec: &mut dyn CommandRecorder, staging: vk::Buffer, byte_len: u64) {
        rec.begin_label("Upload texture", [0.0, 0.0, 1.0, 1.0]);
        self.transition_image_layout(rec, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let regions = self.copy_regions(byte_len);
        rec.copy_buffer_to_image(
            staging,
            self.image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        rec.end_label();
    }

    /// Upload level 0, then fill the rest of the chain and end in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_and_gen_mips(
        &mut self,
        rec: &mut dyn CommandRecorder,
        staging: &GpuBuffer,
        data: &[u8],
    ) -> Result<()> {
        self.upload_only(rec, staging, data)?;
        self.generate_mips(rec)?;
        self.transition_image_layout(rec, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(())
    }

    fn copy_regions(&self, available: u64) -> Vec<vk::BufferImageCopy> {
        let bpp = u64::from(format::bytes_per_pixel(self.image.format).unwrap_or(4));
        let mut regions = Vec::new();
        let mut offset = 0u64;
        for level in 0..self.mip_levels {
            let extent = mip_extent(self.image.extent, level);
            let size = u64::from(extent.width) * u64::from(extent.height) * bpp;
            if level > 0 && (self.generate_mips || offset + size > available) {
                break;
            }
            regions.push(vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect_mask(),
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: extent,
            });
            offset += size;
        }
        regions
    }

    /// Build levels `1..N` from level 0 with linear blits.
    ///
    /// Expects the whole image in `TRANSFER_DST_OPTIMAL` and leaves it in
    /// `SHADER_READ_ONLY_OPTIMAL`. Does nothing for textures created without
    /// [`MipPolicy::Generate`].
    pub fn generate_mips(&mut self, rec: &mut dyn CommandRecorder) -> Result<()> {
        if !self.generate_mips {
            return Ok(());
        }
        if !self.supports_linear_blit {
            return Err(GpuError::Unsupported(format!(
                "{}: format {:?} lacks linear blit support, cannot generate mips",
                self.name, self.image.format
            )));
        }
        assert_eq!(
            self.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "{}: mip generation starts from TRANSFER_DST_OPTIMAL",
            self.name
        );

        rec.begin_label("Generate mips", [0.0, 1.0, 0.0, 1.0]);
        let aspect_mask = self.aspect_mask();
        let image = self.image.image;

        let mut width = self.image.extent.width as i32;
        let mut height = self.image.extent.height as i32;

        for level in 1..=self.mip_levels {
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: level - 1,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            rec.pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[barrier],
            );

            if level == self.mip_levels {
                break;
            }

            let next_width = if width > 1 { width >> 1 } else { width };
            let next_height = if height > 1 { height >> 1 } else { height };

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: width,
                        y: height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };
            rec.blit_image(
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            width = next_width;
            height = next_height;
        }

        let final_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: 1,
            });
        rec.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[],
            &[final_barrier],
        );
        rec.end_label();

        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    /// Record the release half of a queue family ownership transfer.
    ///
    /// Must be recorded on a queue of `src_queue_family`; the returned token
    /// goes to [`Texture::acquire_ownership`] on `dst_queue_family`.
    pub fn release_ownership(
        &self,
        rec: &mut dyn CommandRecorder,
        src_queue_family: u32,
        dst_queue_family: u32,
    ) -> QueueOwnershipTransfer {
        let transfer = QueueOwnershipTransfer {
            image: self.image.image,
            src_queue_family,
            dst_queue_family,
            layout: self.layout,
            subresource_range: self.full_range(),
        };
        let (src_family, dst_family) = transfer.barrier_families();

        let release = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::NONE)
            .dst_access_mask(vk::AccessFlags2::NONE)
            .old_layout(transfer.layout)
            .new_layout(transfer.layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(transfer.image)
            .subresource_range(transfer.subresource_range);
        rec.image_barrier2(&[release]);

        transfer
    }

    /// Record the acquire half of a transfer started by
    /// [`Texture::release_ownership`].
    ///
    /// # Panics
    /// If the token was released for a different image.
    pub fn acquire_ownership(
        &mut self,
        rec: &mut dyn CommandRecorder,
        transfer: QueueOwnershipTransfer,
    ) {
        assert_eq!(
            transfer.image, self.image.image,
            "{}: ownership transfer belongs to another image",
            self.name
        );
        let (src_family, dst_family) = transfer.barrier_families();

        let acquire = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(
                vk::PipelineStageFlags2::TRANSFER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            )
            .dst_access_mask(
                vk::AccessFlags2::TRANSFER_READ
                    | vk::AccessFlags2::TRANSFER_WRITE
                    | vk::AccessFlags2::SHADER_SAMPLED_READ,
            )
            .old_layout(transfer.layout)
            .new_layout(transfer.layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(transfer.image)
            .subresource_range(transfer.subresource_range);
        rec.image_barrier2(&[acquire]);

        self.layout = transfer.layout;
    }

    /// Destroy the view and free the image, unless it is externally owned.
    pub fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        if !self.owns_image {
            return Ok(());
        }
        unsafe {
            device.destroy_image_view(self.view, None);
        }
        allocator.free_image(&mut self.image)
    }
}

/// Create a 2D view over `range` of `image`.
///
/// # Safety
/// The device and image must be valid.
pub(crate) unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(range);
    Ok(unsafe { device.create_image_view(&view_info, None)? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_texture, RecordedCommand, RecordingEncoder};

    const STAGING: u64 = 7;

    fn staging_handle() -> vk::Buffer {
        use ash::vk::Handle;
        vk::Buffer::from_raw(STAGING)
    }

    #[test]
    fn mip_counts() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 200), 9);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(2, 1), 2);
        for size in [1u32, 3, 17, 255, 256, 257, 4096] {
            let expected = (f64::from(size).log2().floor() as u32) + 1;
            assert_eq!(mip_level_count(size, 1), expected, "size {size}");
        }
    }

    #[test]
    fn repeated_transition_records_one_barrier() {
        let mut texture = fake_texture(64, 64, MipPolicy::Single);
        let mut rec = RecordingEncoder::new();

        texture.transition_image_layout(&mut rec, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        texture.transition_image_layout(&mut rec, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        assert_eq!(rec.barrier_count(), 1);
        assert_eq!(texture.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let barrier = &rec.image_barriers()[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn external_layout_change_emits_no_barrier() {
        let mut texture = fake_texture(64, 64, MipPolicy::Single);
        let mut rec = RecordingEncoder::new();

        texture.set_image_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        texture.transition_image_layout(&mut rec, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        assert_eq!(rec.barrier_count(), 1);
        assert_eq!(
            rec.image_barriers()[0].old_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    #[should_panic(expected = "Unknown image layout transition")]
    fn transition_to_undefined_panics() {
        let mut texture = fake_texture(8, 8, MipPolicy::Single);
        let mut rec = RecordingEncoder::new();
        texture.transition_image_layout(&mut rec, vk::ImageLayout::GENERAL);
        texture.transition_image_layout(&mut rec, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn upload_and_generate_full_chain() {
        let mut texture = fake_texture(256, 256, MipPolicy::Generate);
        let data = vec![0u8; 256 * 256 * 4];
        let mut rec = RecordingEncoder::new();

        texture.record_upload(&mut rec, staging_handle(), data.len() as u64);
        texture.generate_mips(&mut rec).unwrap();
        texture.transition_image_layout(&mut rec, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let blits = rec.blits();
        assert_eq!(blits.len(), 8);
        assert_eq!(blits[0].dst_extent, (128, 128));
        assert_eq!(blits[7].dst_mip, 8);
        assert_eq!(blits[7].dst_extent, (1, 1));
        // upload transition + one per level + the final whole-chain barrier
        assert_eq!(rec.barrier_count(), 1 + 9 + 1);
        let last = rec.image_barriers().last().unwrap().clone();
        assert_eq!(last.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(last.level_count, vk::REMAINING_MIP_LEVELS);
    }

    #[test]
    fn non_square_chain_clamps_to_one_texel() {
        let mut texture = fake_texture(300, 200, MipPolicy::Generate);
        let data = vec![0u8; 300 * 200 * 4];
        let mut rec = RecordingEncoder::new();

        texture.record_upload(&mut rec, staging_handle(), data.len() as u64);
        texture.generate_mips(&mut rec).unwrap();

        let extents: Vec<_> = rec.blits().iter().map(|b| b.dst_extent).collect();
        assert_eq!(
            extents,
            vec![
                (150, 100),
                (75, 50),
                (37, 25),
                (18, 12),
                (9, 6),
                (4, 3),
                (2, 1),
                (1, 1)
            ]
        );
    }

    #[test]
    fn generate_without_linear_blit_is_unsupported() {
        let mut texture = fake_texture(16, 16, MipPolicy::Generate);
        texture.supports_linear_blit = false;
        texture.set_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let mut rec = RecordingEncoder::new();

        let err = texture.generate_mips(&mut rec).unwrap_err();
        assert!(matches!(err, GpuError::Unsupported(_)));
        assert!(rec.commands().is_empty());
    }

    #[test]
    fn explicit_mips_upload_every_level() {
        let mut texture = fake_texture(4, 4, MipPolicy::Explicit(3));
        // 4x4 + 2x2 + 1x1 RGBA texels
        let data = vec![0u8; (16 + 4 + 1) * 4];
        let mut rec = RecordingEncoder::new();

        texture.record_upload(&mut rec, staging_handle(), data.len() as u64);

        let copy = rec
            .commands()
            .iter()
            .find_map(|c| match c {
                RecordedCommand::CopyBufferToImage { regions, .. } => Some(regions.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy, vec![(0, 0, (4, 4)), (1, 64, (2, 2)), (2, 80, (1, 1))]);
    }

    #[test]
    fn ownership_release_and_acquire_match() {
        let mut texture = fake_texture(32, 32, MipPolicy::Generate);
        texture.set_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let mut transfer_rec = RecordingEncoder::new();
        let mut graphics_rec = RecordingEncoder::new();

        let token = texture.release_ownership(&mut transfer_rec, 2, 0);
        assert_eq!(token.src_queue_family(), 2);
        texture.acquire_ownership(&mut graphics_rec, token);

        let release = transfer_rec.image_barriers()[0].clone();
        let acquire = graphics_rec.image_barriers()[0].clone();
        assert_eq!(release.image, acquire.image);
        assert_eq!(
            (release.src_queue_family, release.dst_queue_family),
            (2, 0)
        );
        assert_eq!(
            (acquire.src_queue_family, acquire.dst_queue_family),
            (2, 0)
        );
        assert_eq!(release.old_layout, acquire.old_layout);
        assert_eq!(release.new_layout, acquire.new_layout);
        assert_eq!(release.level_count, texture.mip_levels());
    }

    #[test]
    fn same_family_transfer_ignores_families() {
        let mut texture = fake_texture(8, 8, MipPolicy::Single);
        let mut rec = RecordingEncoder::new();
        let token = texture.release_ownership(&mut rec, 0, 0);
        assert!(token.is_same_family());
        texture.acquire_ownership(&mut rec, token);
        for barrier in rec.image_barriers() {
            assert_eq!(barrier.src_queue_family, vk::QUEUE_FAMILY_IGNORED);
        }
    }

    #[test]
    #[should_panic(expected = "another image")]
    fn acquire_with_foreign_token_panics() {
        let a = fake_texture(8, 8, MipPolicy::Single);
        let mut b = crate::testing::fake_texture_with_image(99, 8, 8, MipPolicy::Single);
        let mut rec = RecordingEncoder::new();
        let token = a.release_ownership(&mut rec, 1, 0);
        b.acquire_ownership(&mut rec, token);
    }
}
