//! Application framework for the Cinder renderer.
//!
//! [`run_app`] initialises logging, opens a window, builds the GPU context
//! and drives a [`CinderApp`] frame by frame:
//! - devices without the features the config requires are rejected with a
//!   log line and a clean exit
//! - frames are recorded into a graphics [`cinder_gpu::CommandQueueManager`],
//!   so resources retired during a frame are released once its fence signals
//! - the swapchain is recreated on resize or when presentation reports it
//!   out of date
//!
//! # Example
//!
//! ```no_run
//! use cinder_app::{run_app, AppConfig, AppContext, CinderApp, FrameContext};
//!
//! struct Blank;
//!
//! impl CinderApp for Blank {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(Blank)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Blank>(AppConfig::new("blank").with_gpu_culling_required(false))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::CinderApp;
pub use context::{frame_ring_sizes, AppContext};
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use cinder_gpu::{GpuContext, GpuContextBuilder};
pub use cinder_render::Camera;
pub use winit::event::WindowEvent;
