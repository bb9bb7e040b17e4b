//! Background texture streaming.
//!
//! Two named threads form a pipeline over unbounded `crossbeam` channels:
//!
//! 1. the upload thread copies pixels into a texture on the transfer queue,
//!    releases it to the graphics family and signals a fresh semaphore;
//! 2. the mip thread acquires the texture on the graphics queue, waits on that
//!    semaphore, generates the mip chain and hands the texture to the ready
//!    callback.
//!
//! Mip generation can never start on the GPU before its upload finished,
//! whatever the CPU threads do, because the graphics submission waits on the
//! upload's semaphore. Neither channel applies backpressure.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ash::vk;
use cinder_gpu::{
    CommandQueueManager, GpuContext, GpuError, QueueOwnershipTransfer, Result, SubmitBatch,
    Texture,
};
use crossbeam::channel::{self, Receiver, Sender};

/// Pixels waiting to be copied into `texture`.
pub struct TextureLoadTask {
    pub texture: Texture,
    /// Level 0 pixels, tightly packed
    pub data: Vec<u8>,
    /// Slot of the texture within its model
    pub index: u32,
    pub model_index: u32,
}

/// An uploaded texture still owned by the transfer family.
pub struct TextureMipGenTask {
    pub texture: Texture,
    pub transfer: QueueOwnershipTransfer,
    /// Signalled by the upload submission
    pub semaphore: vk::Semaphore,
    pub index: u32,
    pub model_index: u32,
}

/// A texture that may be bound for sampling.
pub struct ReadyTexture {
    pub texture: Texture,
    pub index: u32,
    pub model_index: u32,
}

/// First stage: record and submit the upload.
pub trait UploadStage: Send + 'static {
    fn upload(&mut self, task: TextureLoadTask) -> Result<TextureMipGenTask>;

    /// Called once on the upload thread after its last task.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Second stage: acquire the texture and build its mip chain.
pub trait MipGenerationStage: Send + 'static {
    fn generate(&mut self, task: TextureMipGenTask) -> Result<Texture>;

    /// Called once on the mip thread after its last task.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

enum UploadMessage {
    Load(TextureLoadTask),
    Shutdown,
}

enum MipMessage {
    Generate(TextureMipGenTask),
    Shutdown,
}

/// Streams textures to the GPU off the render thread.
pub struct AsyncDataUploader {
    load_tx: Sender<UploadMessage>,
    upload_thread: Option<JoinHandle<()>>,
    mip_thread: Option<JoinHandle<()>>,
}

impl AsyncDataUploader {
    /// Start both threads. `on_ready` runs on the mip thread.
    pub fn new<U, M, F>(upload: U, mip: M, on_ready: F) -> Result<Self>
    where
        U: UploadStage,
        M: MipGenerationStage,
        F: FnMut(ReadyTexture) + Send + 'static,
    {
        let (load_tx, load_rx) = channel::unbounded::<UploadMessage>();
        let (mip_tx, mip_rx) = channel::unbounded::<MipMessage>();

        let mip_thread = thread::Builder::new()
            .name("texture-mips".to_string())
            .spawn(move || mip_loop(mip, &mip_rx, on_ready))
            .map_err(|e| GpuError::Other(format!("Failed to spawn mip thread: {e}")))?;

        let upload_thread = match thread::Builder::new()
            .name("texture-upload".to_string())
            .spawn({
                let mip_tx = mip_tx.clone();
                move || upload_loop(upload, &load_rx, &mip_tx)
            }) {
            Ok(thread) => thread,
            Err(e) => {
                let _ = mip_tx.send(MipMessage::Shutdown);
                let _ = mip_thread.join();
                return Err(GpuError::Other(format!("Failed to spawn upload thread: {e}")));
            }
        };

        Ok(Self {
            load_tx,
            upload_thread: Some(upload_thread),
            mip_thread: Some(mip_thread),
        })
    }

    /// Queue tasks for upload in order.
    pub fn queue_texture_upload_tasks(
        &self,
        tasks: impl IntoIterator<Item = TextureLoadTask>,
    ) -> Result<()> {
        for task in tasks {
            self.load_tx
                .send(UploadMessage::Load(task))
                .map_err(|_| GpuError::InvalidState("Uploader is shut down".to_string()))?;
        }
        Ok(())
    }

    /// Finish every queued task, shut both stages down and join the threads.
    pub fn shutdown(&mut self) {
        let _ = self.load_tx.send(UploadMessage::Shutdown);
        for thread in [self.upload_thread.take(), self.mip_thread.take()]
            .into_iter()
            .flatten()
        {
            if thread.join().is_err() {
                tracing::error!("Texture uploader thread panicked");
            }
        }
    }
}

impl Drop for AsyncDataUploader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn upload_loop<U: UploadStage>(
    mut stage: U,
    load_rx: &Receiver<UploadMessage>,
    mip_tx: &Sender<MipMessage>,
) {
    while let Ok(UploadMessage::Load(task)) = load_rx.recv() {
        let (index, model_index) = (task.index, task.model_index);
        match stage.upload(task) {
            Ok(next) => {
                if mip_tx.send(MipMessage::Generate(next)).is_err() {
                    tracing::error!(index, model_index, "Mip thread is gone");
                    break;
                }
            }
            Err(e) => tracing::error!(index, model_index, error = %e, "Texture upload failed"),
        }
    }

    if let Err(e) = stage.shutdown() {
        tracing::error!(error = %e, "Upload stage shutdown failed");
    }
    let _ = mip_tx.send(MipMessage::Shutdown);
}

fn mip_loop<M, F>(mut stage: M, mip_rx: &Receiver<MipMessage>, mut on_ready: F)
where
    M: MipGenerationStage,
    F: FnMut(ReadyTexture),
{
    while let Ok(MipMessage::Generate(task)) = mip_rx.recv() {
        let (index, model_index) = (task.index, task.model_index);
        match stage.generate(task) {
            Ok(texture) => on_ready(ReadyTexture {
                texture,
                index,
                model_index,
            }),
            Err(e) => tracing::error!(index, model_index, error = %e, "Mip generation failed"),
        }
    }

    if let Err(e) = stage.shutdown() {
        tracing::error!(error = %e, "Mip stage shutdown failed");
    }
}

/// Uploads on the transfer queue and releases to the graphics family.
pub struct VulkanUploadStage {
    context: Arc<GpuContext>,
    manager: CommandQueueManager,
    graphics_family: u32,
}

impl VulkanUploadStage {
    pub fn new(context: Arc<GpuContext>, count: usize) -> Result<Self> {
        let manager = context.create_transfer_command_queue(count, count, "texture upload")?;
        let graphics_family = context.graphics_queue().family();
        Ok(Self {
            context,
            manager,
            graphics_family,
        })
    }

    fn record(
        &mut self,
        texture: &mut Texture,
        data: &[u8],
        semaphore: vk::Semaphore,
    ) -> Result<QueueOwnershipTransfer> {
        let staging = self
            .context
            .create_staging_buffer(data.len() as u64, "texture staging")?;

        let cmd = self.manager.get_cmd_buffer_to_begin()?;
        let mut encoder = self.context.encoder(cmd);
        let uploaded = texture.upload_only(&mut encoder, &staging, data);
        self.manager.dispose_when_submit_completes(staging);
        uploaded?;
        let transfer = texture.release_ownership(
            &mut encoder,
            self.manager.queue_family_index(),
            self.graphics_family,
        );

        self.manager.end_cmd_buffer(cmd)?;
        self.manager.submit(&SubmitBatch::new(cmd).signal(semaphore))?;
        self.manager.go_to_next_cmd_buffer();
        Ok(transfer)
    }
}

impl UploadStage for VulkanUploadStage {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn upload(&mut self, task: TextureLoadTask) -> Result<TextureMipGenTask> {
        let TextureLoadTask {
            mut texture,
            data,
            index,
            model_index,
        } = task;

        let semaphore = self.context.create_semaphore()?;
        match self.record(&mut texture, &data, semaphore) {
            Ok(transfer) => {
                tracing::debug!(index, model_index, bytes = data.len(), "Uploaded texture");
                Ok(TextureMipGenTask {
                    texture,
                    transfer,
                    semaphore,
                    index,
                    model_index,
                })
            }
            Err(e) => {
                // Nothing was submitted with the semaphore
                unsafe { self.context.destroy_semaphore(semaphore) };
                self.manager.dispose_texture_when_submit_completes(texture);
                Err(e)
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.manager.destroy()
    }
}

/// Acquires uploaded textures on the graphics queue and builds their mips.
///
/// The graphics queue is the one the renderer draws on, so barriers recorded
/// here also order later frame submissions.
pub struct VulkanMipStage {
    context: Arc<GpuContext>,
    manager: CommandQueueManager,
    semaphores: Vec<vk::Semaphore>,
}

impl VulkanMipStage {
    pub fn new(context: Arc<GpuContext>, count: usize) -> Result<Self> {
        let manager = context.create_graphics_command_queue(count, count, "texture mips")?;
        Ok(Self {
            context,
            manager,
            semaphores: Vec::new(),
        })
    }

    fn record(
        &mut self,
        texture: &mut Texture,
        transfer: QueueOwnershipTransfer,
        semaphore: vk::Semaphore,
    ) -> Result<()> {
        let cmd = self.manager.get_cmd_buffer_to_begin()?;
        let mut encoder = self.context.encoder(cmd);
        texture.acquire_ownership(&mut encoder, transfer);
        texture.generate_mips(&mut encoder)?;
        texture.transition_image_layout(&mut encoder, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        self.manager.end_cmd_buffer(cmd)?;
        self.manager.submit(
            &SubmitBatch::new(cmd).wait(semaphore, vk::PipelineStageFlags::TRANSFER),
        )?;
        self.manager.go_to_next_cmd_buffer();
        Ok(())
    }
}

impl MipGenerationStage for VulkanMipStage {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn generate(&mut self, task: TextureMipGenTask) -> Result<Texture> {
        let TextureMipGenTask {
            mut texture,
            transfer,
            semaphore,
            index,
            model_index,
        } = task;
        // Destroyed at shutdown, once no submission can still wait on it
        self.semaphores.push(semaphore);

        match self.record(&mut texture, transfer, semaphore) {
            Ok(()) => {
                tracing::debug!(
                    index,
                    model_index,
                    mips = texture.mip_levels(),
                    "Texture ready"
                );
                Ok(texture)
            }
            Err(e) => {
                self.manager.dispose_texture_when_submit_completes(texture);
                Err(e)
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.manager.destroy()?;
        for semaphore in self.semaphores.drain(..) {
            unsafe { self.context.destroy_semaphore(semaphore) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use cinder_gpu::testing::{fake_texture_with_image, RecordingEncoder};
    use cinder_gpu::MipPolicy;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        UploadDone(u32),
        MipStart(u32),
        Ready(u32),
        UploadShutdown,
        MipShutdown,
    }

    type Log = Arc<Mutex<Vec<(Event, Instant)>>>;

    fn note(log: &Log, event: Event) {
        log.lock().push((event, Instant::now()));
    }

    fn events(log: &Log) -> Vec<Event> {
        log.lock().iter().map(|(e, _)| *e).collect()
    }

    fn at(log: &Log, event: Event) -> Instant {
        log.lock()
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, t)| *t)
            .unwrap()
    }

    struct FakeUpload {
        log: Log,
        delay: Duration,
        fail_index: Option<u32>,
    }

    impl UploadStage for FakeUpload {
        fn upload(&mut self, task: TextureLoadTask) -> Result<TextureMipGenTask> {
            thread::sleep(self.delay);
            if Some(task.index) == self.fail_index {
                return Err(GpuError::Other("staging allocation failed".into()));
            }
            let mut texture = task.texture;
            let mut rec = RecordingEncoder::new();
            texture.record_upload(&mut rec, vk::Buffer::from_raw(7), task.data.len() as u64);
            let transfer = texture.release_ownership(&mut rec, 2, 0);
            note(&self.log, Event::UploadDone(task.index));
            Ok(TextureMipGenTask {
                texture,
                transfer,
                semaphore: vk::Semaphore::from_raw(u64::from(task.index) + 1),
                index: task.index,
                model_index: task.model_index,
            })
        }

        fn shutdown(&mut self) -> Result<()> {
            note(&self.log, Event::UploadShutdown);
            Ok(())
        }
    }

    struct FakeMips {
        log: Log,
        semaphores: Vec<vk::Semaphore>,
    }

    impl MipGenerationStage for FakeMips {
        fn generate(&mut self, task: TextureMipGenTask) -> Result<Texture> {
            note(&self.log, Event::MipStart(task.index));
            self.semaphores.push(task.semaphore);
            let mut texture = task.texture;
            let mut rec = RecordingEncoder::new();
            texture.acquire_ownership(&mut rec, task.transfer);
            texture.generate_mips(&mut rec)?;
            Ok(texture)
        }

        fn shutdown(&mut self) -> Result<()> {
            note(&self.log, Event::MipShutdown);
            Ok(())
        }
    }

    fn task(index: u32) -> TextureLoadTask {
        TextureLoadTask {
            texture: fake_texture_with_image(u64::from(index) * 10 + 10, 16, 16, MipPolicy::Generate),
            data: vec![0xff; 16 * 16 * 4],
            index,
            model_index: 0,
        }
    }

    fn uploader(
        log: &Log,
        delay: Duration,
        fail_index: Option<u32>,
    ) -> (AsyncDataUploader, Receiver<ReadyTexture>) {
        let (ready_tx, ready_rx) = channel::unbounded();
        let ready_log = log.clone();
        let uploader = AsyncDataUploader::new(
            FakeUpload {
                log: log.clone(),
                delay,
                fail_index,
            },
            FakeMips {
                log: log.clone(),
                semaphores: Vec::new(),
            },
            move |ready: ReadyTexture| {
                note(&ready_log, Event::Ready(ready.index));
                let _ = ready_tx.send(ready);
            },
        )
        .unwrap();
        (uploader, ready_rx)
    }

    #[test]
    fn mips_wait_for_a_slow_upload() {
        let log: Log = Arc::default();
        let (mut uploader, ready_rx) = uploader(&log, Duration::from_millis(30), None);

        uploader.queue_texture_upload_tasks((0..3).map(task)).unwrap();
        uploader.shutdown();

        for i in 0..3 {
            let upload_done = at(&log, Event::UploadDone(i));
            let mip_start = at(&log, Event::MipStart(i));
            let ready = at(&log, Event::Ready(i));
            assert!(mip_start >= upload_done, "texture {i} mips began before its upload");
            assert!(ready >= mip_start);
        }
        let ready: Vec<ReadyTexture> = ready_rx.try_iter().collect();
        assert_eq!(ready.len(), 3);
        assert!(ready
            .iter()
            .all(|r| r.texture.layout() == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn textures_become_ready_in_queue_order() {
        let log: Log = Arc::default();
        let (mut uploader, ready_rx) = uploader(&log, Duration::ZERO, None);

        uploader.queue_texture_upload_tasks((0..5).map(task)).unwrap();
        uploader.shutdown();

        let order: Vec<u32> = ready_rx.try_iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failed_upload_drops_only_that_task() {
        let log: Log = Arc::default();
        let (mut uploader, ready_rx) = uploader(&log, Duration::ZERO, Some(1));

        uploader.queue_texture_upload_tasks((0..3).map(task)).unwrap();
        uploader.shutdown();

        let order: Vec<u32> = ready_rx.try_iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 2]);
        assert!(!events(&log).contains(&Event::MipStart(1)));
    }

    #[test]
    fn shutdown_drains_then_stops_upload_before_mips() {
        let log: Log = Arc::default();
        let (mut uploader, ready_rx) = uploader(&log, Duration::from_millis(5), None);

        uploader.queue_texture_upload_tasks((0..4).map(task)).unwrap();
        uploader.shutdown();

        assert_eq!(ready_rx.try_iter().count(), 4);
        let events = events(&log);
        let upload_shutdown = events.iter().position(|e| *e == Event::UploadShutdown).unwrap();
        let mip_shutdown = events.iter().position(|e| *e == Event::MipShutdown).unwrap();
        assert!(upload_shutdown < mip_shutdown);
        assert_eq!(events.last(), Some(&Event::MipShutdown));

        assert!(uploader.queue_texture_upload_tasks([task(9)]).is_err());
    }

    #[test]
    fn dropping_the_uploader_joins_its_threads() {
        let log: Log = Arc::default();
        {
            let (uploader, _ready_rx) = uploader(&log, Duration::ZERO, None);
            uploader.queue_texture_upload_tasks([task(0)]).unwrap();
        }
        assert_eq!(events(&log).last(), Some(&Event::MipShutdown));
    }
}
