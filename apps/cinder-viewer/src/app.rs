//! Viewer application: GPU-culled grid of cubes with streamed textures.

use ash::vk;
use crossbeam::channel::{self, Receiver};
use glam::Vec3;
use tracing::{error, info, warn};

use cinder_app::{AppContext, Camera, CinderApp, FrameContext};
use cinder_gpu::{MipPolicy, TextureDesc};
use cinder_render::{
    AsyncDataUploader, CullingComputePass, CullingConfig, DrawPushConstants, IndirectDrawPass,
    ReadyTexture, SceneBuffers, TextureLoadTask, VulkanMipStage, VulkanUploadStage,
};

use crate::scene::{build_grid_scene, grid_radius, material_slots_for_texture};
use crate::ViewerOptions;

/// Camera orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.25;

/// Command buffers per uploader stage.
const UPLOAD_RING_SIZE: usize = 4;

const LIGHT_DIRECTION: Vec3 = Vec3::new(-0.4, -1.0, -0.3);

/// Demo viewer state.
pub struct Viewer {
    camera: Camera,
    scene: Option<SceneBuffers>,
    culling: Option<CullingComputePass>,
    draw: Option<IndirectDrawPass>,
    uploader: Option<AsyncDataUploader>,
    ready: Receiver<ReadyTexture>,
    /// Material slot each streamed texture is bound to
    texture_slots: Vec<Option<u32>>,
}

impl CinderApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let options = ViewerOptions::from_args().map_err(anyhow::Error::msg)?;
        info!(
            "Viewer config: grid={} textures={}",
            options.grid, options.textures
        );

        let model = build_grid_scene(options.grid, options.textures);
        let scene = SceneBuffers::upload(&ctx.gpu, &mut ctx.graphics, &mut ctx.resources, &model)?;

        // Culling and drawing share the graphics queue, so no ownership moves.
        let family = ctx.gpu.graphics_queue().family();
        let frames_in_flight = ctx.frames_in_flight();
        let culling = CullingComputePass::new(
            &ctx.gpu,
            &mut ctx.resources,
            &scene,
            CullingConfig {
                frames_in_flight,
                compute_queue_family: family,
                graphics_queue_family: family,
            },
        )?;
        let extent = ctx.extent();
        let draw = IndirectDrawPass::new(
            &ctx.gpu,
            &mut ctx.graphics,
            &ctx.resources,
            &culling,
            ctx.swapchain.format,
            extent,
        )?;
        info!(draws = scene.draw_count, "Indirect draw pipeline created");

        let (ready_tx, ready) = channel::unbounded();
        let uploader = AsyncDataUploader::new(
            VulkanUploadStage::new(ctx.gpu.clone(), UPLOAD_RING_SIZE)?,
            VulkanMipStage::new(ctx.gpu.clone(), UPLOAD_RING_SIZE)?,
            move |texture: ReadyTexture| {
                // The receiver only goes away during cleanup, after shutdown.
                let _ = ready_tx.send(texture);
            },
        )?;

        let mut tasks = Vec::with_capacity(model.textures.len());
        for (index, image) in model.textures.iter().enumerate() {
            let desc = TextureDesc::sampled(
                image.width,
                image.height,
                vk::Format::R8G8B8A8_UNORM,
                format!("material texture {index}"),
            )
            .with_mips(MipPolicy::Generate);
            tasks.push(TextureLoadTask {
                texture: ctx.gpu.create_texture(&desc)?,
                data: image.pixels.clone(),
                index: index as u32,
                model_index: 0,
            });
        }
        uploader.queue_texture_upload_tasks(tasks)?;

        let texture_slots = (0..model.textures.len() as u32)
            .map(|index| material_slots_for_texture(&model, index).first().copied())
            .collect();

        let radius = grid_radius(options.grid).max(2.0);
        let camera = Camera::new(
            Vec3::new(radius * 1.4, radius * 0.9, radius * 1.4),
            Vec3::ZERO,
            60.0_f32.to_radians(),
            ctx.aspect_ratio(),
            0.1,
            radius * 8.0,
        );

        Ok(Self {
            camera,
            scene: Some(scene),
            culling: Some(culling),
            draw: Some(draw),
            uploader: Some(uploader),
            ready,
            texture_slots,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        self.camera.orbit(Vec3::ZERO, ORBIT_SPEED * dt);
        self.bind_ready_textures(ctx);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let (Some(scene), Some(culling), Some(draw)) =
            (&self.scene, &mut self.culling, &mut self.draw)
        else {
            return Ok(());
        };

        let gpu = ctx.gpu.clone();
        let mut encoder = gpu.encoder(frame.command_buffer);

        culling.cull(
            &mut encoder,
            &ctx.resources,
            &self.camera.frustum(),
            frame.frame_slot,
        )?;
        culling.add_barrier_for_culled_buffers(
            &mut encoder,
            &ctx.resources,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
        )?;
        culling.add_acquire_for_culled_buffers(&mut encoder, &ctx.resources)?;

        let push = DrawPushConstants::new(self.camera.view_projection_matrix(), LIGHT_DIRECTION);
        draw.record(
            &mut encoder,
            &ctx.resources,
            scene,
            culling,
            ctx.swapchain.image_mut(frame.image_index),
            &push,
        )?;
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(width as f32 / height.max(1) as f32);
        if let Some(draw) = &mut self.draw {
            draw.resize(&ctx.gpu, ctx.extent())?;
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        // Joins both worker threads; their queues are idle afterwards.
        if let Some(mut uploader) = self.uploader.take() {
            uploader.shutdown();
        }

        {
            let mut allocator = ctx.gpu.allocator().lock();
            for ready in self.ready.try_iter() {
                if let Err(e) = ready.texture.destroy(ctx.gpu.device(), &mut allocator) {
                    error!("Failed to destroy streamed texture: {e}");
                }
            }
        }

        if let Some(draw) = self.draw.take() {
            if let Err(e) = unsafe { draw.destroy(&ctx.gpu) } {
                error!("Failed to destroy draw pass: {e}");
            }
        }
        if let Some(culling) = self.culling.take() {
            if let Err(e) = unsafe { culling.destroy(&ctx.gpu, &mut ctx.resources) } {
                error!("Failed to destroy culling pass: {e}");
            }
        }
        if let Some(scene) = self.scene.take() {
            scene.retire(&mut ctx.resources, &mut ctx.graphics);
        }
    }
}

/// Where a streamed texture goes once the uploader hands it over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TextureRoute {
    Bind(u32),
    Dispose,
}

/// Bind to the texture's material slot, or dispose of it when it has none
/// or the frames reading the descriptor set could not be drained.
fn route_texture(slots: &[Option<u32>], index: u32, frames_drained: bool) -> TextureRoute {
    match slots.get(index as usize).copied().flatten() {
        Some(slot) if frames_drained => TextureRoute::Bind(slot),
        _ => TextureRoute::Dispose,
    }
}

impl Viewer {
    /// Bind textures finished by the uploader to their material slots.
    ///
    /// Descriptor writes must not race frames still reading the set, so the
    /// graphics queue is drained first whenever something arrived. Textures
    /// that are not bound are released behind the next frame's fence, which
    /// also covers their mip generation on the same queue.
    fn bind_ready_textures(&mut self, ctx: &mut AppContext) {
        let ready: Vec<ReadyTexture> = self.ready.try_iter().collect();
        if ready.is_empty() {
            return;
        }

        let drained = match ctx.graphics.wait_until_all_submits_are_complete() {
            Ok(()) => self.draw.is_some(),
            Err(e) => {
                error!("Failed to wait for frames before binding textures: {e}");
                false
            }
        };

        for ReadyTexture { texture, index, .. } in ready {
            match (route_texture(&self.texture_slots, index, drained), &mut self.draw) {
                (TextureRoute::Bind(slot), Some(draw)) => {
                    if let Err(e) = draw.set_material_texture(&ctx.gpu, slot, texture) {
                        error!("Failed to bind texture {index}: {e}");
                    }
                }
                _ => {
                    warn!("Texture {index} was not bound, releasing it");
                    ctx.graphics.dispose_texture_when_submit_completes(texture);
                }
            }
        }
        if let Some(draw) = &self.draw {
            info!(bound = draw.bound_texture_count(), "Material textures updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textures_with_a_material_are_bound() {
        let slots = [Some(4), None];
        assert_eq!(route_texture(&slots, 0, true), TextureRoute::Bind(4));
    }

    #[test]
    fn textures_without_a_material_are_disposed() {
        let slots = [Some(4), None];
        assert_eq!(route_texture(&slots, 1, true), TextureRoute::Dispose);
        assert_eq!(route_texture(&slots, 9, true), TextureRoute::Dispose);
    }

    #[test]
    fn failed_drain_disposes_every_texture() {
        let slots = [Some(4), Some(5)];
        assert!((0..2).all(|i| route_texture(&slots, i, false) == TextureRoute::Dispose));
    }
}
