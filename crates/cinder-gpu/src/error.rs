//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A device feature or format capability is missing.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A fence did not signal within the configured timeout.
    ///
    /// Treated as a lost device: the slot's resources are never released.
    #[error("Fence wait timed out on queue '{queue}' (slot {slot}) after {timeout_ms} ms")]
    FenceTimeout {
        queue: String,
        slot: usize,
        timeout_ms: u64,
    },

    /// Scene data failed validation.
    #[error(transparent)]
    Model(#[from] cinder_core::Error),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// True for errors after which the device cannot be trusted.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            Self::FenceTimeout { .. } | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
