//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use cinder_core::constants::DEFAULT_FENCE_TIMEOUT_NS;
use cinder_gpu::{GpuCapabilities, GpuContextBuilder, GpuError, SubmitBatch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::CinderApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Frame pacing target; `None` renders as fast as presentation allows.
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Submissions the frame loop keeps outstanding.
    pub frames_in_flight: usize,
    /// Fence wait before a submission is treated as hung.
    pub fence_timeout_ns: u64,
    /// Exit cleanly when the device cannot feed indirect-count draws.
    pub require_gpu_culling: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Cinder".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            require_gpu_culling: true,
        }
    }
}

impl AppConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    pub fn with_gpu_culling_required(mut self, required: bool) -> Self {
        self.require_gpu_culling = required;
        self
    }

    /// Why this device cannot run the app, if it cannot.
    pub fn unmet_requirement(&self, capabilities: &GpuCapabilities) -> Option<String> {
        if self.require_gpu_culling && !capabilities.supports_gpu_culling() {
            return Some(format!(
                "{} lacks drawIndirectCount or {}-wide compute workgroups",
                capabilities.device_name,
                cinder_core::constants::CULLING_WORKGROUP_SIZE
            ));
        }
        None
    }
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,cinder_app=trace,cinder_render=trace,cinder_gpu=trace,cinder_viewer=trace")
        });
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .try_init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}

/// Initialise logging, open the window and run `A` until it is closed.
///
/// Returns `Ok` without running the app when the device lacks a feature the
/// config requires.
pub fn run_app<A: CinderApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    info!(title = %config.title, "Starting");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: CinderApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: CinderApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: CinderApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(Some(state)) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Ok(None) => event_loop.exit(),
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shut_down(event_loop, None);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    self.shut_down(event_loop, Some(e));
                    return;
                }
                state.ctx.window.request_redraw();
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size.width, size.height) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: CinderApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<Option<AppState<A>>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .fence_timeout_ns(self.config.fence_timeout_ns)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        if let Some(reason) = self.config.unmet_requirement(gpu.capabilities()) {
            warn!("{reason}; exiting");
            return Ok(None);
        }

        let mut ctx = unsafe {
            AppContext::new(window, Arc::new(gpu), self.config.vsync, self.config.frames_in_flight)?
        };
        let app = A::init(&mut ctx)?;

        Ok(Some(AppState {
            ctx,
            app,
            target_frame_time: self
                .config
                .target_fps
                .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)))),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        }))
    }

    fn shut_down(&mut self, event_loop: &ActiveEventLoop, failure: Option<anyhow::Error>) {
        let device_lost = failure
            .as_ref()
            .and_then(|e| e.downcast_ref::<GpuError>())
            .is_some_and(GpuError::is_device_lost);
        if let Some(mut state) = self.state.take() {
            // Waiting idle on a hung device would hang too
            if !device_lost {
                state.cleanup();
            }
        }
        if failure.is_some() {
            self.failure = failure;
        }
        event_loop.exit();
    }
}

impl<A: CinderApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&mut self.ctx, dt);

        // Waits on this slot's fence and releases its disposals
        let cmd = self.ctx.graphics.get_cmd_buffer_to_begin()?;
        let frame_slot = self.ctx.graphics.current_fence_index();
        let image_available = self.ctx.semaphores.get(frame_slot).image_available;

        let acquired = unsafe {
            self.ctx.swapchain.acquire_next_image(
                &self.ctx.surface.swapchain_loader,
                image_available,
                self.ctx.gpu.fence_timeout_ns(),
            )
        };
        let image_index = match acquired {
            Ok((index, _suboptimal)) => index,
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                // Keep the ring consistent: the begun buffer is submitted empty
                self.ctx.graphics.end_cmd_buffer(cmd)?;
                self.ctx.graphics.submit(&SubmitBatch::new(cmd))?;
                self.ctx.graphics.go_to_next_cmd_buffer();
                let size = self.ctx.window.inner_size();
                return self.handle_resize(size.width, size.height);
            }
            Err(e) => return Err(e.into()),
        };

        let frame = FrameContext {
            command_buffer: cmd,
            image_index,
            frame_slot,
            dt,
            frame_number: self.ctx.frame_count,
        };
        self.app.render(&mut self.ctx, &frame)?;

        self.ctx
            .swapchain
            .image_mut(image_index)
            .transition_image_layout(&mut self.ctx.gpu.encoder(cmd), vk::ImageLayout::PRESENT_SRC_KHR);

        let render_finished = self.ctx.semaphores.get(image_index as usize).render_finished;
        self.ctx.graphics.end_cmd_buffer(cmd)?;
        self.ctx.graphics.submit(
            &SubmitBatch::new(cmd)
                .wait(image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .signal(render_finished),
        )?;

        let out_of_date = unsafe {
            self.ctx.swapchain.present(
                &self.ctx.surface.swapchain_loader,
                self.ctx.graphics.queue(),
                image_index,
                &[render_finished],
            )?
        };
        self.ctx.graphics.go_to_next_cmd_buffer();
        self.ctx.frame_count += 1;

        if out_of_date {
            let size = self.ctx.window.inner_size();
            self.handle_resize(size.width, size.height)?;
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.ctx.graphics.wait_until_all_submits_are_complete()?;
        self.ctx.gpu.wait_idle()?;
        unsafe { self.ctx.recreate_swapchain(width, height)? };
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!(width, height, "Resized");
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!(
                min = format_args!("{:.1}", self.min_fps),
                max = format_args!("{:.1}", self.max_fps),
                avg = format_args!("{avg_fps:.1}"),
                frames = self.ctx.frame_count,
                "FPS statistics"
            );
        }

        info!("Starting cleanup");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
            return;
        }
        self.app.cleanup(&mut self.ctx);
        match unsafe { self.ctx.cleanup() } {
            Ok(()) => info!("Cleanup complete"),
            Err(e) => error!("Cleanup failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_two_frames_in_flight() {
        let config = AppConfig::new("test");
        assert_eq!(config.title, "test");
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns, DEFAULT_FENCE_TIMEOUT_NS);
        assert!(config.require_gpu_culling);
    }

    #[test]
    fn frames_in_flight_is_at_least_one() {
        assert_eq!(AppConfig::default().with_frames_in_flight(0).frames_in_flight, 1);
    }

    #[test]
    fn builder_chains() {
        let config = AppConfig::new("viewer")
            .with_size(800, 600)
            .with_vsync(false)
            .with_target_fps(60)
            .with_fence_timeout_ns(1_000);
        assert_eq!((config.width, config.height), (800, 600));
        assert!(!config.vsync);
        assert_eq!(config.target_fps, Some(60));
        assert_eq!(config.fence_timeout_ns, 1_000);
    }
}
