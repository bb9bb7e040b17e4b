//! Fence-gated command buffer rings.
//!
//! A [`CommandQueueManager`] owns `count` command buffers and
//! `concurrent_num_commands` fence slots for one queue. Buffers and fence
//! slots advance together; acquiring a command buffer first retires the fence
//! slot it maps to, so no command buffer is reset while a submission that uses
//! it can still be executing.
//!
//! Resources handed to [`CommandQueueManager::dispose_when_submit_completes`]
//! (and callbacks handed to
//! [`CommandQueueManager::defer_when_submit_completes`]) join the current
//! slot and are released once that slot's fence has been observed signaled.

use crate::deferred::SlotDisposals;
use crate::device::{FenceWait, QueueDevice, QueueHandle, SubmitBatch, VulkanQueueDevice};
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;
use crate::recorder::CommandEncoder;
use crate::texture::Texture;
use ash::vk;
use ash::vk::Handle;
use cinder_core::constants::DEFAULT_FENCE_TIMEOUT_NS;

/// Ring sizes and naming for a [`CommandQueueManager`].
#[derive(Clone, Debug)]
pub struct CommandQueueConfig {
    /// Command buffers in the ring.
    pub count: usize,
    /// Fence slots, the maximum number of unresolved submissions.
    pub concurrent_num_commands: usize,
    /// Debug name used in logs and object labels.
    pub name: String,
    /// Extra pool flags. `RESET_COMMAND_BUFFER` is always added.
    pub pool_flags: vk::CommandPoolCreateFlags,
    /// Bound on every fence wait.
    pub fence_timeout_ns: u64,
}

impl CommandQueueConfig {
    pub fn new(count: usize, concurrent_num_commands: usize, name: impl Into<String>) -> Self {
        Self {
            count,
            concurrent_num_commands,
            name: name.into(),
            pool_flags: vk::CommandPoolCreateFlags::empty(),
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }

    #[must_use]
    pub fn with_pool_flags(mut self, flags: vk::CommandPoolCreateFlags) -> Self {
        self.pool_flags = flags;
        self
    }

    #[must_use]
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }
}

/// Command buffers, fences and deferred disposal for one logical queue.
///
/// Recording is single-threaded: every mutating operation takes `&mut self`.
pub struct CommandQueueManager<D: QueueDevice = VulkanQueueDevice> {
    device: D,
    queue: QueueHandle,
    name: String,
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    extra_command_buffers: Vec<vk::CommandBuffer>,
    fences: Vec<vk::Fence>,
    /// Per fence slot: a submission was made and its fence not yet observed.
    outstanding: Vec<bool>,
    disposals: Vec<SlotDisposals>,
    cmd_index: usize,
    fence_index: usize,
    fence_timeout_ns: u64,
    destroyed: bool,
}

impl<D: QueueDevice> CommandQueueManager<D> {
    /// Create the pool, command buffers and fences.
    ///
    /// # Panics
    /// Unless `count >= concurrent_num_commands >= 1`.
    pub fn new(device: D, queue: QueueHandle, config: CommandQueueConfig) -> Result<Self> {
        assert!(
            config.concurrent_num_commands >= 1,
            "{}: concurrent_num_commands must be at least 1",
            config.name
        );
        assert!(
            config.count >= config.concurrent_num_commands,
            "{}: count ({}) must be >= concurrent_num_commands ({})",
            config.name,
            config.count,
            config.concurrent_num_commands
        );

        let pool = device.create_command_pool(
            queue.family(),
            config.pool_flags | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = device.allocate_command_buffers(pool, config.count as u32)?;
        let fences = (0..config.concurrent_num_commands)
            .map(|_| device.create_fence(false))
            .collect::<Result<Vec<_>>>()?;

        for (i, cmd) in command_buffers.iter().enumerate() {
            device.set_object_name(
                vk::ObjectType::COMMAND_BUFFER,
                cmd.as_raw(),
                &format!("{} cmd {i}", config.name),
            );
        }
        for (i, fence) in fences.iter().enumerate() {
            device.set_object_name(
                vk::ObjectType::FENCE,
                fence.as_raw(),
                &format!("{} fence {i}", config.name),
            );
        }

        tracing::info!(
            queue = %config.name,
            family = queue.family(),
            count = config.count,
            concurrent = config.concurrent_num_commands,
            "Created command queue manager"
        );

        Ok(Self {
            device,
            queue,
            name: config.name,
            pool,
            command_buffers,
            extra_command_buffers: Vec::new(),
            outstanding: vec![false; fences.len()],
            disposals: (0..fences.len()).map(|_| SlotDisposals::new()).collect(),
            fences,
            cmd_index: 0,
            fence_index: 0,
            fence_timeout_ns: config.fence_timeout_ns,
            destroyed: false,
        })
    }

    /// Retire the current fence slot, then reset and begin the current
    /// command buffer with `ONE_TIME_SUBMIT`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn get_cmd_buffer_to_begin(&mut self) -> Result<vk::CommandBuffer> {
        self.wait_until_submit_is_complete()?;

        let cmd = self.command_buffers[self.cmd_index];
        self.device.reset_command_buffer(cmd)?;
        self.device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(cmd)
    }

    pub fn end_cmd_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        self.device.end_command_buffer(cmd)
    }

    /// Submit `batch` guarded by the current slot's fence.
    ///
    /// # Panics
    /// If the slot already has an unresolved submission, which happens when
    /// two submissions are made without [`Self::go_to_next_cmd_buffer`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&mut self, batch: &SubmitBatch) -> Result<()> {
        let slot = self.fence_index;
        assert!(
            !self.outstanding[slot],
            "{}: fence slot {slot} submitted twice without advancing",
            self.name
        );

        let fence = self.fences[slot];
        self.device.reset_fence(fence)?;
        self.device.queue_submit(&self.queue, batch, fence)?;
        self.outstanding[slot] = true;

        tracing::debug!(
            queue = %self.name,
            slot,
            command_buffers = batch.command_buffers.len(),
            waits = batch.wait_semaphores.len(),
            signals = batch.signal_semaphores.len(),
            "Submitted"
        );
        Ok(())
    }

    /// Advance to the next command buffer and fence slot.
    pub fn go_to_next_cmd_buffer(&mut self) {
        self.cmd_index = (self.cmd_index + 1) % self.command_buffers.len();
        self.fence_index = (self.fence_index + 1) % self.fences.len();
    }

    /// Block on the current slot if it has outstanding work, then release
    /// its disposals and run its callbacks.
    ///
    /// On timeout the slot stays outstanding and nothing is released.
    pub fn wait_until_submit_is_complete(&mut self) -> Result<()> {
        self.retire_slot(self.fence_index)
    }

    /// Block on every outstanding slot, then release all deferred work.
    ///
    /// Fences are left signaled; the next [`Self::submit`] on a slot resets it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_until_all_submits_are_complete(&mut self) -> Result<()> {
        for slot in 0..self.fences.len() {
            self.retire_slot(slot)?;
        }
        for slot in &mut self.disposals {
            slot.release(&self.device, &self.name);
        }
        Ok(())
    }

    fn retire_slot(&mut self, slot: usize) -> Result<()> {
        if !self.outstanding[slot] {
            return Ok(());
        }

        match self
            .device
            .wait_for_fence(self.fences[slot], self.fence_timeout_ns)?
        {
            FenceWait::Signaled => {
                self.outstanding[slot] = false;
                self.disposals[slot].release(&self.device, &self.name);
                Ok(())
            }
            FenceWait::TimedOut => {
                let timeout_ms = self.fence_timeout_ns / 1_000_000;
                tracing::error!(
                    queue = %self.name,
                    slot,
                    timeout_ms,
                    pending = self.disposals[slot].len(),
                    "Fence wait timed out, keeping slot resources alive"
                );
                Err(GpuError::FenceTimeout {
                    queue: self.name.clone(),
                    slot,
                    timeout_ms,
                })
            }
        }
    }

    /// Free `buffer` once the current slot's submission has completed.
    pub fn dispose_when_submit_completes(&mut self, buffer: GpuBuffer) {
        self.disposals[self.fence_index].push_buffer(buffer);
    }

    /// Destroy `texture` once the current slot's submission has completed.
    pub fn dispose_texture_when_submit_completes(&mut self, texture: Texture) {
        self.disposals[self.fence_index].push_texture(texture);
    }

    /// Run `callback` once the current slot's submission has completed.
    pub fn defer_when_submit_completes(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.disposals[self.fence_index].push_callback(Box::new(callback));
    }

    /// One more primary command buffer from this manager's pool, outside
    /// the ring. Freed with the pool.
    pub fn allocate_cmd_buffer(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self
            .device
            .allocate_command_buffers(self.pool, 1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState(format!("{}: empty allocation", self.name)))?;
        self.extra_command_buffers.push(cmd);
        Ok(cmd)
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue.family()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn current_cmd_buffer_index(&self) -> usize {
        self.cmd_index
    }

    pub fn current_fence_index(&self) -> usize {
        self.fence_index
    }

    /// Fence slots in the ring.
    pub fn concurrent_num_commands(&self) -> usize {
        self.fences.len()
    }

    /// Resources and callbacks waiting on any slot.
    pub fn pending_disposals(&self) -> usize {
        self.disposals.iter().map(SlotDisposals::len).sum()
    }

    /// Wait for all submissions, release everything and destroy the pool,
    /// command buffers and fences.
    ///
    /// If a fence times out nothing is destroyed and the error is returned.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.wait_until_all_submits_are_complete()?;

        let mut all_buffers = self.command_buffers.clone();
        all_buffers.extend_from_slice(&self.extra_command_buffers);
        self.device
            .destroy_queue_objects(self.pool, &all_buffers, &self.fences);
        self.destroyed = true;

        tracing::debug!(queue = %self.name, "Destroyed command queue manager");
        Ok(())
    }
}

impl CommandQueueManager<VulkanQueueDevice> {
    /// Recorder for `cmd`, which must have come from
    /// [`Self::get_cmd_buffer_to_begin`] and not yet been ended.
    pub fn encoder(&self, cmd: vk::CommandBuffer) -> CommandEncoder<'_> {
        unsafe { CommandEncoder::new(self.device.device(), self.device.debug_utils(), cmd) }
    }
}

impl<D: QueueDevice> Drop for CommandQueueManager<D> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!(
                "{}: leaking command pool and fences after failed shutdown: {e}",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_buffer, FakeQueueDevice};
    use gpu_allocator::MemoryLocation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager(
        count: usize,
        concurrent: usize,
    ) -> (Arc<FakeQueueDevice>, CommandQueueManager<Arc<FakeQueueDevice>>) {
        let device = Arc::new(FakeQueueDevice::new());
        let queue = device.queue(0);
        let mgr = CommandQueueManager::new(
            Arc::clone(&device),
            queue,
            CommandQueueConfig::new(count, concurrent, "test"),
        )
        .unwrap();
        (device, mgr)
    }

    fn staging(raw: u64) -> GpuBuffer {
        fake_buffer(
            raw,
            256,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Record and submit one empty command buffer, then advance.
    fn cycle(mgr: &mut CommandQueueManager<Arc<FakeQueueDevice>>) -> (vk::CommandBuffer, vk::Fence) {
        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.end_cmd_buffer(cmd).unwrap();
        let fence = mgr.fences[mgr.current_fence_index()];
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();
        (cmd, fence)
    }

    #[test]
    fn buffer_released_after_its_fence_signals() {
        let (device, mut mgr) = manager(2, 2);

        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.dispose_when_submit_completes(staging(500));
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();
        assert!(device.released_buffers().is_empty());

        // slot 1 has no outstanding work, so slot 0 is untouched
        cycle(&mut mgr);
        assert!(device.released_buffers().is_empty());
        assert_eq!(device.fence_wait_count(), 0);

        // back on slot 0: the wait observes the fence, then releases
        mgr.get_cmd_buffer_to_begin().unwrap();
        assert_eq!(device.fence_wait_count(), 1);
        assert_eq!(device.released_buffers(), vec![vk::Buffer::from_raw(500)]);
        assert_eq!(mgr.pending_disposals(), 0);
    }

    #[test]
    fn slots_release_only_their_own_resources() {
        let (device, mut mgr) = manager(2, 2);

        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.dispose_when_submit_completes(staging(500));
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();

        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.dispose_when_submit_completes(staging(501));
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();

        mgr.get_cmd_buffer_to_begin().unwrap();
        assert_eq!(device.released_buffers(), vec![vk::Buffer::from_raw(500)]);
        assert_eq!(mgr.pending_disposals(), 1);
    }

    #[test]
    fn deferred_callback_runs_once_after_completion() {
        let (_device, mut mgr) = manager(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        let counter = Arc::clone(&calls);
        mgr.defer_when_submit_completes(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        mgr.wait_until_submit_is_complete().unwrap();
        mgr.wait_until_submit_is_complete().unwrap();
        mgr.wait_until_all_submits_are_complete().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn three_buffers_two_fences_six_cycles() {
        let (device, mut mgr) = manager(3, 2);

        let used: Vec<_> = (0..6).map(|_| cycle(&mut mgr).0).collect();

        assert_eq!(device.submit_count(), 6);
        assert_eq!(used[0..3], used[3..6]);
        assert_ne!(used[0], used[1]);
        assert_ne!(used[1], used[2]);
        // cycles 2..6 each retire the slot used two submissions earlier
        assert_eq!(device.fence_wait_count(), 4);

        mgr.wait_until_all_submits_are_complete().unwrap();
        assert_eq!(device.fence_wait_count(), 6);
    }

    #[test]
    fn acquired_buffer_is_never_in_flight() {
        for (count, concurrent) in [(1, 1), (2, 1), (3, 2), (3, 3), (5, 2), (4, 4)] {
            let (device, mut mgr) = manager(count, concurrent);
            let mut history: Vec<(vk::CommandBuffer, vk::Fence)> = Vec::new();

            for _ in 0..(count * concurrent * 3) {
                let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
                // only the most recent submission on a fence can be pending
                let mut latest_per_fence = hashbrown::HashMap::new();
                for &(used, fence) in &history {
                    latest_per_fence.insert(fence, used);
                }
                for (fence, used) in latest_per_fence {
                    if used == cmd {
                        assert!(
                            !device.is_pending(fence),
                            "{count}/{concurrent}: reused a buffer still in flight"
                        );
                    }
                }
                let pending = mgr.fences.iter().filter(|f| device.is_pending(**f)).count();
                assert!(pending < concurrent);

                mgr.end_cmd_buffer(cmd).unwrap();
                let fence = mgr.fences[mgr.current_fence_index()];
                mgr.submit(&SubmitBatch::new(cmd)).unwrap();
                mgr.go_to_next_cmd_buffer();
                history.push((cmd, fence));
            }
        }
    }

    #[test]
    fn indices_wrap_independently() {
        let (_device, mut mgr) = manager(3, 2);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push((mgr.current_cmd_buffer_index(), mgr.current_fence_index()));
            mgr.go_to_next_cmd_buffer();
        }
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 0), (0, 1), (1, 0), (2, 1)]);
    }

    #[test]
    fn wait_all_does_not_reset_fences() {
        let (device, mut mgr) = manager(2, 2);
        cycle(&mut mgr);
        cycle(&mut mgr);
        let resets = device.fence_reset_count();

        mgr.wait_until_all_submits_are_complete().unwrap();
        assert_eq!(device.fence_reset_count(), resets);

        // the next submission on each slot resets normally
        cycle(&mut mgr);
        assert_eq!(device.fence_reset_count(), resets + 1);
    }

    #[test]
    fn timeout_keeps_slot_resources() {
        let (device, mut mgr) = manager(1, 1);

        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.dispose_when_submit_completes(staging(900));
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.go_to_next_cmd_buffer();

        device.set_hang(true);
        let err = mgr.get_cmd_buffer_to_begin().unwrap_err();
        assert!(matches!(err, GpuError::FenceTimeout { slot: 0, .. }));
        assert!(err.is_device_lost());
        assert!(device.released_buffers().is_empty());
        assert_eq!(mgr.pending_disposals(), 1);

        let err = mgr.wait_until_all_submits_are_complete().unwrap_err();
        assert!(matches!(err, GpuError::FenceTimeout { .. }));
        assert!(device.released_buffers().is_empty());

        device.set_hang(false);
        mgr.get_cmd_buffer_to_begin().unwrap();
        assert_eq!(device.released_buffers(), vec![vk::Buffer::from_raw(900)]);
    }

    #[test]
    fn drop_waits_then_destroys() {
        let (device, mut mgr) = manager(2, 2);
        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.dispose_when_submit_completes(staging(42));
        mgr.end_cmd_buffer(cmd).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();

        drop(mgr);
        assert!(device.is_destroyed());
        assert_eq!(device.released_buffers(), vec![vk::Buffer::from_raw(42)]);
    }

    #[test]
    fn extra_command_buffers_are_distinct() {
        let (_device, mut mgr) = manager(2, 1);
        let extra = mgr.allocate_cmd_buffer().unwrap();
        assert!(!mgr.command_buffers.contains(&extra));
    }

    #[test]
    #[should_panic(expected = "must be >= concurrent_num_commands")]
    fn fewer_buffers_than_fences_panics() {
        let _ = manager(1, 2);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn zero_fences_panics() {
        let _ = manager(2, 0);
    }

    #[test]
    #[should_panic(expected = "submitted twice")]
    fn double_submit_on_slot_panics() {
        let (_device, mut mgr) = manager(2, 2);
        let cmd = mgr.get_cmd_buffer_to_begin().unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
        mgr.submit(&SubmitBatch::new(cmd)).unwrap();
    }
}
