//! GPU device.
//!
//! [`GpuDevice`] pairs the active backend with its device-loss state. Every
//! manager goes through [`GpuDevice::backend_mut`], which is where the loss
//! gate lives: nothing reaches the backend unless the device is active.

use crate::backend::{
    create_backend, AdapterInfo, DeviceLimits, DummyBackend, GpuBackend, SurfaceTarget,
};
use crate::device_loss::{DeviceLossRecovery, DeviceLossSignal, DeviceState};
use crate::error::{RenderError, RenderResult};
use crate::BackendType;

/// A backend plus the loss gate in front of it.
pub struct GpuDevice {
    backend: Option<Box<dyn GpuBackend>>,
    recovery: DeviceLossRecovery,
    limits: DeviceLimits,
}

impl Default for GpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice {
    /// A device with no backend attached yet.
    pub fn new() -> Self {
        Self {
            backend: None,
            recovery: DeviceLossRecovery::new(),
            limits: DeviceLimits::default(),
        }
    }

    /// Wrap an existing backend.
    ///
    /// Losses the backend raises on its own signal are not observed; use
    /// [`loss_signal`](Self::loss_signal) and [`attach`](Self::attach) when
    /// that matters.
    pub fn with_backend(backend: Box<dyn GpuBackend>) -> Self {
        let mut device = Self::new();
        device.attach(backend);
        device
    }

    /// Negotiate a backend for `target`.
    pub fn create(
        kind: BackendType,
        target: &SurfaceTarget,
        allow_fallback: bool,
    ) -> RenderResult<Self> {
        let mut device = Self::new();
        let backend = create_backend(kind, target, device.loss_signal(), allow_fallback)?;
        device.attach(backend);
        Ok(device)
    }

    /// A dummy-backed device wired to its own loss signal.
    pub fn headless(width: u32, height: u32) -> Self {
        let mut device = Self::new();
        let backend = DummyBackend::new(&SurfaceTarget::headless(width, height), device.loss_signal());
        device.attach(Box::new(backend));
        device
    }

    /// Signal to hand to a backend before [`attach`](Self::attach)ing it.
    pub fn loss_signal(&self) -> DeviceLossSignal {
        self.recovery.signal()
    }

    pub fn attach(&mut self, backend: Box<dyn GpuBackend>) {
        self.limits = backend.limits();
        log::debug!("Attached {} backend", backend.name());
        self.backend = Some(backend);
    }

    /// Drop the backend and with it every native object it still owns.
    pub fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if self.recovery.is_active() {
                if let Err(err) = backend.wait_idle() {
                    log::warn!("wait_idle during shutdown failed: {}", err);
                }
            }
            log::info!("Shutting down {} backend", backend.name());
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// The backend, if the device is initialized and active.
    pub fn backend(&self) -> RenderResult<&dyn GpuBackend> {
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| RenderError::InvalidState("device is not initialized".into()))?;
        self.recovery.ensure_active()?;
        Ok(backend)
    }

    /// Mutable access to the backend, if the device is initialized and active.
    pub fn backend_mut(&mut self) -> RenderResult<&mut dyn GpuBackend> {
        self.recovery.ensure_active()?;
        match self.backend.as_deref_mut() {
            Some(backend) => Ok(backend),
            None => Err(RenderError::InvalidState("device is not initialized".into())),
        }
    }

    pub fn backend_type(&self) -> Option<BackendType> {
        self.backend.as_ref().map(|b| b.backend_type())
    }

    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        self.backend.as_ref().map(|b| b.adapter_info())
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn recovery(&self) -> &DeviceLossRecovery {
        &self.recovery
    }

    pub fn recovery_mut(&mut self) -> &mut DeviceLossRecovery {
        &mut self.recovery
    }

    pub fn state(&self) -> DeviceState {
        self.recovery.state()
    }

    pub fn is_lost(&self) -> bool {
        !self.recovery.is_active()
    }

    /// Fold any loss the backend reported since the last call into the state.
    pub fn poll_loss(&mut self) -> DeviceState {
        self.recovery.poll()
    }

    pub fn force_loss(&mut self, reason: impl Into<String>) {
        self.recovery.force_loss(reason);
    }

    /// Negotiate a new device after a loss.
    pub fn recover(&mut self) -> RenderResult<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or_else(|| RenderError::InvalidState("device is not initialized".into()))?;
        self.recovery.recover(backend)?;
        self.limits = backend.limits();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_device() {
        let mut device = GpuDevice::new();
        assert!(!device.is_initialized());
        assert!(matches!(device.backend_mut(), Err(RenderError::InvalidState(_))));
        assert!(device.backend_type().is_none());
    }

    #[test]
    fn test_loss_gates_backend_access() {
        let mut device = GpuDevice::headless(64, 64);
        assert!(device.backend_mut().is_ok());

        device.force_loss("test");
        assert!(device.is_lost());
        assert!(matches!(device.backend_mut(), Err(RenderError::DeviceLost)));
        assert!(matches!(device.backend(), Err(RenderError::DeviceLost)));

        device.recover().unwrap();
        assert_eq!(device.state(), DeviceState::Active);
        assert!(device.backend_mut().is_ok());
    }

    #[test]
    fn test_backend_signal_is_observed() {
        let mut device = GpuDevice::headless(64, 64);
        device.loss_signal().raise("driver reset");
        assert_eq!(device.state(), DeviceState::Active);
        assert_eq!(device.poll_loss(), DeviceState::Lost);
        assert_eq!(device.recovery().last_reason(), Some("driver reset"));
    }

    #[test]
    fn test_shutdown() {
        let mut device = GpuDevice::headless(64, 64);
        assert_eq!(device.backend_type(), Some(BackendType::Dummy));
        device.shutdown();
        assert!(!device.is_initialized());
    }
}
