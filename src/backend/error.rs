//! Backend error types.

use thiserror::Error;

/// Errors reported by a [`GpuBackend`](super::GpuBackend) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("unknown or released native resource: {0}")]
    InvalidResource(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("surface out of date")]
    SurfaceOutOfDate,
    #[error("surface lost")]
    SurfaceLost,
    #[error("timed out waiting for the swapchain")]
    Timeout,
    #[error("out of memory")]
    OutOfMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("internal backend error: {0}")]
    Internal(String),
}

/// Result alias for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;
