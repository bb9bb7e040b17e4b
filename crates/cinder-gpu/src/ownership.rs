//! Queue family ownership transfer.
//!
//! Moving an exclusive-sharing image between queue families needs a release
//! barrier on the source queue and a matching acquire barrier on the
//! destination queue. [`QueueOwnershipTransfer`] is produced by the release
//! and consumed by the acquire, so each release is acquired exactly once.

use ash::vk;

/// Proof that a release barrier was recorded for an image.
///
/// Not `Clone`, and [`crate::texture::Texture::acquire_ownership`] takes it
/// by value, so one release pairs with at most one acquire.
#[must_use = "a released texture must be acquired on the destination queue"]
#[derive(Debug)]
pub struct QueueOwnershipTransfer {
    pub(crate) image: vk::Image,
    pub(crate) src_queue_family: u32,
    pub(crate) dst_queue_family: u32,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) subresource_range: vk::ImageSubresourceRange,
}

impl QueueOwnershipTransfer {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn src_queue_family(&self) -> u32 {
        self.src_queue_family
    }

    pub fn dst_queue_family(&self) -> u32 {
        self.dst_queue_family
    }

    /// Layout the image keeps across the transfer.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// True when both sides are the same family and no ownership moves.
    pub fn is_same_family(&self) -> bool {
        self.src_queue_family == self.dst_queue_family
    }

    /// Family indices as written into both barriers.
    pub(crate) fn barrier_families(&self) -> (u32, u32) {
        if self.is_same_family() {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (self.src_queue_family, self.dst_queue_family)
        }
    }
}
