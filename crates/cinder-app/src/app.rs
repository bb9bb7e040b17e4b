//! `CinderApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// An application driven by [`crate::run_app`].
///
/// The runner owns the window, GPU context, swapchain and the graphics
/// command queue. Each frame it begins a command buffer, acquires a
/// swapchain image and calls [`CinderApp::render`]; afterwards it moves the
/// image to `PRESENT_SRC_KHR`, submits and presents.
pub trait CinderApp: Sized {
    /// Called once after the window and GPU context exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Advance application state by `dt` seconds.
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Record the frame into `frame.command_buffer`.
    ///
    /// The swapchain image `frame.image_index` must be written as a color
    /// attachment; the runner transitions it for presentation.
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// The swapchain was recreated at `width` x `height`. The device is idle.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return `true` to stop the runner from handling `event`.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release GPU resources. The device is idle; resources still in
    /// `ctx.resources` are freed by the runner afterwards.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
