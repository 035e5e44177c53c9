//! Renderer-level error types.
//!
//! Every manager returns [`RenderResult`] to its immediate caller. Backend
//! failures arrive as [`BackendError`] and are folded into the taxonomy here
//! at the manager boundary.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the resource managers, presentation and the renderer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Malformed size, stride, offset or alignment. Caller error, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Use of a destroyed, unknown or null handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Native allocation failed. Not retried automatically.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// Shader module or pipeline assembly failed.
    #[error("compile error: {0}")]
    CompileError(String),
    /// The device is lost; recoverable through device-loss recovery.
    #[error("GPU device lost")]
    DeviceLost,
    /// The swapchain no longer matches the surface and must be recreated.
    #[error("swapchain out of date, recreate before acquiring")]
    SwapchainOutOfDate,
    /// No swapchain image became available in time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// No usable adapter or device could be negotiated.
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// A native failure that fits no other category.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Result alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;

impl From<BackendError> for RenderError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfMemory => Self::OutOfMemory,
            BackendError::DeviceLost => Self::DeviceLost,
            BackendError::SurfaceOutOfDate => Self::SwapchainOutOfDate,
            BackendError::Timeout => Self::Timeout("swapchain image acquisition".into()),
            BackendError::ShaderCompilationFailed(msg)
            | BackendError::PipelineCreationFailed(msg) => Self::CompileError(msg),
            BackendError::InitializationFailed(msg)
            | BackendError::SurfaceCreationFailed(msg)
            | BackendError::DeviceCreationFailed(msg) => Self::Initialization(msg),
            BackendError::InvalidResource(msg) => Self::InvalidHandle(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl RenderError {
    /// Whether the renderer can get past this error without caller changes.
    ///
    /// Device loss and out-of-date swapchains have dedicated recovery paths;
    /// everything else needs the caller to act.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::SwapchainOutOfDate | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = RenderError::InvalidArgument("offset 8 is not 16-byte aligned".to_string());
        assert_eq!(err.to_string(), "invalid argument: offset 8 is not 16-byte aligned");
    }

    #[test]
    fn test_backend_error_mapping() {
        assert_eq!(RenderError::from(BackendError::OutOfMemory), RenderError::OutOfMemory);
        assert_eq!(RenderError::from(BackendError::DeviceLost), RenderError::DeviceLost);
        assert_eq!(
            RenderError::from(BackendError::SurfaceOutOfDate),
            RenderError::SwapchainOutOfDate
        );
        assert!(matches!(
            RenderError::from(BackendError::PipelineCreationFailed("bad entry".into())),
            RenderError::CompileError(_)
        ));
        assert!(matches!(
            RenderError::from(BackendError::SurfaceLost),
            RenderError::Backend(_)
        ));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(RenderError::DeviceLost.is_recoverable());
        assert!(RenderError::SwapchainOutOfDate.is_recoverable());
        assert!(!RenderError::InvalidHandle("destroyed".into()).is_recoverable());
    }
}
