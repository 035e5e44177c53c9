//! Device-loss detection and recovery.
//!
//! Native callbacks never touch renderer state directly. They only raise a
//! [`DeviceLossSignal`], which the render thread turns into a state
//! transition the next time [`DeviceLossRecovery::poll`] runs at frame start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::error::{RenderError, RenderResult};

/// Lifecycle of the logical device as seen by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Resource and render operations are allowed.
    Active,
    /// The device is gone; everything fails with `DeviceLost`.
    Lost,
    /// A new device is being negotiated.
    Recovering,
}

#[derive(Debug, Default)]
struct SignalInner {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Flag shared between a backend's native loss callbacks and the render thread.
#[derive(Debug, Clone, Default)]
pub struct DeviceLossSignal {
    inner: Arc<SignalInner>,
}

impl DeviceLossSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a loss. Safe to call from any thread; only the first reason
    /// before the next [`take`](Self::take) is kept.
    pub fn raise(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    /// Clear the flag, returning the reason if it was raised.
    pub fn take(&self) -> Option<String> {
        if !self.inner.raised.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(
            self.inner
                .reason
                .lock()
                .take()
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }
}

/// Callback run once per loss with the loss reason.
pub type LostCallback = Box<dyn FnMut(&str) + Send>;
/// Callback run after a new device has been negotiated.
pub type RestoredCallback = Box<dyn FnMut() + Send>;

/// Explicit loss state plus subscriber lists.
pub struct DeviceLossRecovery {
    state: DeviceState,
    signal: DeviceLossSignal,
    on_lost: Vec<LostCallback>,
    on_restored: Vec<RestoredCallback>,
    loss_count: u64,
    failed_attempts: u32,
    last_reason: Option<String>,
}

impl Default for DeviceLossRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLossRecovery {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Active,
            signal: DeviceLossSignal::new(),
            on_lost: Vec::new(),
            on_restored: Vec::new(),
            loss_count: 0,
            failed_attempts: 0,
            last_reason: None,
        }
    }

    /// A clone of the signal to hand to a backend.
    pub fn signal(&self) -> DeviceLossSignal {
        self.signal.clone()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == DeviceState::Active
    }

    pub fn loss_count(&self) -> u64 {
        self.loss_count
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    /// Recovery attempts that failed since the last loss.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn subscribe_lost(&mut self, callback: LostCallback) {
        self.on_lost.push(callback);
    }

    pub fn subscribe_restored(&mut self, callback: RestoredCallback) {
        self.on_restored.push(callback);
    }

    /// Fold a raised signal into the state. Called once at frame start.
    pub fn poll(&mut self) -> DeviceState {
        if let Some(reason) = self.signal.take() {
            if self.state == DeviceState::Active {
                self.mark_lost(reason);
            } else {
                log::debug!("Device loss reported while already {:?}: {}", self.state, reason);
            }
        }
        self.state
    }

    /// Transition to `Lost` immediately, bypassing the signal.
    pub fn force_loss(&mut self, reason: impl Into<String>) {
        // Drop anything a backend raised so the next poll does not double count.
        self.signal.take();
        if self.state == DeviceState::Active {
            self.mark_lost(reason.into());
        }
    }

    /// Fails with `DeviceLost` unless the device is active.
    pub fn ensure_active(&self) -> RenderResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RenderError::DeviceLost)
        }
    }

    /// Negotiate a new device on `backend`.
    ///
    /// `Lost -> Recovering -> Active` on success, back to `Lost` on failure.
    /// A no-op while already active.
    pub fn recover(&mut self, backend: &mut dyn GpuBackend) -> RenderResult<()> {
        if self.state == DeviceState::Active {
            return Ok(());
        }

        self.state = DeviceState::Recovering;
        log::info!("Recovering from device loss on {}", backend.name());

        match backend.recreate_device() {
            Ok(()) => {
                // Whatever the old device reported on its way out is stale now.
                self.signal.take();
                self.state = DeviceState::Active;
                self.failed_attempts = 0;
                log::info!("Device restored on {}", backend.name());
                for callback in self.on_restored.iter_mut() {
                    callback();
                }
                Ok(())
            }
            Err(err) => {
                self.state = DeviceState::Lost;
                self.failed_attempts += 1;
                log::warn!(
                    "Device recovery attempt {} failed: {}",
                    self.failed_attempts,
                    err
                );
                Err(err.into())
            }
        }
    }

    fn mark_lost(&mut self, reason: String) {
        log::warn!("GPU device lost: {}", reason);
        self.state = DeviceState::Lost;
        self.loss_count += 1;
        self.failed_attempts = 0;
        for callback in self.on_lost.iter_mut() {
            callback(&reason);
        }
        self.last_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, SurfaceTarget};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_take_clears() {
        let signal = DeviceLossSignal::new();
        assert!(signal.take().is_none());

        signal.raise("driver reset");
        signal.raise("second report");
        assert!(signal.is_raised());
        assert_eq!(signal.take().as_deref(), Some("driver reset"));
        assert!(!signal.is_raised());
        assert!(signal.take().is_none());
    }

    #[test]
    fn test_poll_transitions_and_notifies_once() {
        let mut recovery = DeviceLossRecovery::new();
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        recovery.subscribe_lost(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let signal = recovery.signal();
        assert_eq!(recovery.poll(), DeviceState::Active);

        signal.raise("timeout detection");
        assert_eq!(recovery.poll(), DeviceState::Lost);
        assert_eq!(recovery.poll(), DeviceState::Lost);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.loss_count(), 1);
        assert_eq!(recovery.last_reason(), Some("timeout detection"));
        assert_eq!(recovery.ensure_active(), Err(RenderError::DeviceLost));
    }

    #[test]
    fn test_force_loss_and_recover() {
        let mut recovery = DeviceLossRecovery::new();
        let restored = Arc::new(AtomicUsize::new(0));
        let counter = restored.clone();
        recovery.subscribe_restored(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut backend = DummyBackend::new(&SurfaceTarget::headless(64, 64), recovery.signal());
        recovery.force_loss("test");
        assert_eq!(recovery.state(), DeviceState::Lost);

        recovery.recover(&mut backend).unwrap();
        assert!(recovery.is_active());
        assert_eq!(restored.load(Ordering::SeqCst), 1);

        // Active already: nothing to do, no extra notification.
        recovery.recover(&mut backend).unwrap();
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_recovery_returns_to_lost() {
        let mut recovery = DeviceLossRecovery::new();
        let mut backend = DummyBackend::new(&SurfaceTarget::headless(64, 64), recovery.signal());
        backend.control().fail_device_recreation(true);

        recovery.force_loss("test");
        assert!(recovery.recover(&mut backend).is_err());
        assert_eq!(recovery.state(), DeviceState::Lost);
        assert_eq!(recovery.failed_attempts(), 1);

        backend.control().fail_device_recreation(false);
        recovery.recover(&mut backend).unwrap();
        assert_eq!(recovery.failed_attempts(), 0);
    }
}
