//! Swapchain and surface management.
//!
//! [`PresentationManager`] owns the swapchain state machine:
//!
//! ```text
//! Uninitialized -> Ready -> (Suboptimal | OutOfDate) -> Recreating -> Ready
//! ```
//!
//! An `OutOfDate` swapchain refuses to hand out images until
//! [`recreate_swapchain`](PresentationManager::recreate_swapchain) succeeds.
//! Acquired images are consumed by value when presented, so an image cannot
//! be presented twice.

use std::time::Duration;

use crate::backend::{
    BackendError, GpuBackend, PresentStatus, SurfaceCapabilities, SurfaceConfiguration,
};
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::types::{Extent2d, PresentMode, TextureFormat};

/// State of the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    /// Images still work but no longer match the surface exactly.
    Suboptimal,
    /// Must be recreated before the next acquire.
    OutOfDate,
    Recreating,
}

/// An acquired swapchain image. Hand it back to
/// [`PresentationManager::present_image`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SwapchainImage {
    index: u32,
    serial: u64,
    ready: bool,
}

impl SwapchainImage {
    /// Index of the image within the swapchain.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Monotonic acquisition counter.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Presentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationConfig {
    pub vsync: bool,
    pub acquire_timeout: Duration,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            acquire_timeout: Duration::from_millis(1000),
        }
    }
}

/// Triple buffering when the surface allows it: `min + 1`, clamped to the
/// maximum (`0` meaning unbounded).
pub fn choose_image_count(capabilities: &SurfaceCapabilities) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// FIFO under vsync. Otherwise the lowest-latency supported mode, with FIFO
/// as the mode every surface supports.
pub fn choose_present_mode(supported: &[PresentMode], vsync: bool) -> PresentMode {
    if vsync {
        return PresentMode::Fifo;
    }
    [PresentMode::Mailbox, PresentMode::Immediate]
        .into_iter()
        .find(|mode| supported.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

/// BGRA8 UNORM first, then its sRGB variant, then whatever comes first.
pub fn choose_surface_format(supported: &[TextureFormat]) -> Option<TextureFormat> {
    [TextureFormat::Bgra8Unorm, TextureFormat::Bgra8UnormSrgb]
        .into_iter()
        .find(|format| supported.contains(format))
        .or_else(|| supported.first().copied())
}

/// Owns the swapchain lifecycle on top of a backend surface.
#[derive(Debug)]
pub struct PresentationManager {
    config: PresentationConfig,
    state: SwapchainState,
    extent: Extent2d,
    format: Option<TextureFormat>,
    present_mode: Option<PresentMode>,
    image_count: u32,
    next_serial: u64,
    outstanding: Option<u64>,
    frames_presented: u64,
}

impl PresentationManager {
    pub fn new(config: PresentationConfig) -> Self {
        Self {
            config,
            state: SwapchainState::Uninitialized,
            extent: Extent2d::default(),
            format: None,
            present_mode: None,
            image_count: 0,
            next_serial: 1,
            outstanding: None,
            frames_presented: 0,
        }
    }

    /// Build the first swapchain.
    pub fn create(&mut self, device: &mut GpuDevice, width: u32, height: u32) -> RenderResult<()> {
        if self.state != SwapchainState::Uninitialized {
            return Err(RenderError::InvalidState(format!(
                "swapchain already created ({:?}); use recreate_swapchain",
                self.state
            )));
        }
        check_extent(width, height)?;
        let backend = device.backend_mut()?;
        self.rebuild(backend, width, height, false)?;
        log::info!(
            "Created swapchain {}x{} {:?} {:?} with {} images",
            width,
            height,
            self.format,
            self.present_mode,
            self.image_count
        );
        Ok(())
    }

    /// Rebuild the swapchain for a new size after waiting for the device to
    /// go idle.
    pub fn recreate_swapchain(
        &mut self,
        device: &mut GpuDevice,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        check_extent(width, height)?;
        let backend = device.backend_mut()?;
        self.rebuild(backend, width, height, true)?;
        log::debug!("Recreated swapchain at {}x{}", width, height);
        Ok(())
    }

    pub fn acquire_next_image(&mut self, device: &mut GpuDevice) -> RenderResult<SwapchainImage> {
        match self.state {
            SwapchainState::Uninitialized | SwapchainState::Recreating => {
                return Err(RenderError::InvalidState(format!(
                    "cannot acquire while the swapchain is {:?}",
                    self.state
                )));
            }
            SwapchainState::OutOfDate => return Err(RenderError::SwapchainOutOfDate),
            SwapchainState::Ready | SwapchainState::Suboptimal => {}
        }

        let backend = device.backend_mut()?;
        match backend.acquire_image(self.config.acquire_timeout) {
            Ok(acquired) => {
                if acquired.suboptimal && self.state != SwapchainState::Suboptimal {
                    log::warn!("Swapchain is suboptimal for the surface");
                    self.state = SwapchainState::Suboptimal;
                }
                let serial = self.next_serial;
                self.next_serial += 1;
                self.outstanding = Some(serial);
                Ok(SwapchainImage {
                    index: acquired.index,
                    serial,
                    ready: true,
                })
            }
            Err(BackendError::SurfaceOutOfDate) => {
                log::warn!("Swapchain out of date on acquire");
                self.state = SwapchainState::OutOfDate;
                Err(RenderError::SwapchainOutOfDate)
            }
            Err(BackendError::Timeout) => Err(RenderError::Timeout(format!(
                "no swapchain image within {:?}",
                self.config.acquire_timeout
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Present an image from the most recent acquire.
    pub fn present_image(&mut self, device: &mut GpuDevice, image: SwapchainImage) -> RenderResult<()> {
        if !image.ready || self.outstanding != Some(image.serial) {
            return Err(RenderError::InvalidState(format!(
                "image {} (serial {}) is not the most recently acquired image",
                image.index, image.serial
            )));
        }
        let backend = device.backend_mut()?;
        self.outstanding = None;

        match backend.present(image.index) {
            Ok(PresentStatus::Presented) => {
                self.frames_presented += 1;
                Ok(())
            }
            Ok(PresentStatus::Suboptimal) => {
                self.frames_presented += 1;
                self.state = SwapchainState::Suboptimal;
                Ok(())
            }
            Ok(PresentStatus::OutOfDate) | Err(BackendError::SurfaceOutOfDate) => {
                log::warn!("Swapchain out of date on present");
                self.state = SwapchainState::OutOfDate;
                Err(RenderError::SwapchainOutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Hand back an acquired image that will not be presented, so the
    /// backend can release what the acquire left pending.
    pub fn abandon_image(&mut self, device: &mut GpuDevice, image: SwapchainImage) {
        if self.outstanding != Some(image.serial) {
            return;
        }
        self.outstanding = None;
        if let Ok(backend) = device.backend_mut() {
            backend.abandon_frame(image.index);
        }
        log::debug!("Abandoned swapchain image {}", image.index);
    }

    pub fn has_outstanding_image(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Drop the swapchain. Skips native calls if the device is unavailable.
    pub fn release(&mut self, device: &mut GpuDevice) {
        if let Ok(backend) = device.backend_mut() {
            backend.release_surface();
        }
        self.invalidate();
    }

    /// Forget the swapchain without native calls, after device loss.
    pub fn invalidate(&mut self) {
        self.state = SwapchainState::Uninitialized;
        self.outstanding = None;
    }

    /// Takes effect on the next (re)creation.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.vsync = vsync;
    }

    /// Mark the swapchain out of date, e.g. when the window was resized.
    pub fn mark_out_of_date(&mut self) {
        if self.state != SwapchainState::Uninitialized {
            self.state = SwapchainState::OutOfDate;
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn needs_recreation(&self) -> bool {
        matches!(self.state, SwapchainState::OutOfDate | SwapchainState::Suboptimal)
    }

    /// Size of the current swapchain.
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn format(&self) -> Option<TextureFormat> {
        self.format
    }

    pub fn present_mode(&self) -> Option<PresentMode> {
        self.present_mode
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn rebuild(
        &mut self,
        backend: &mut dyn GpuBackend,
        width: u32,
        height: u32,
        wait_idle: bool,
    ) -> RenderResult<()> {
        let previous = self.state;
        self.state = SwapchainState::Recreating;

        match self.configure(backend, width, height, wait_idle) {
            Ok(()) => {
                self.state = SwapchainState::Ready;
                self.outstanding = None;
                Ok(())
            }
            Err(err) => {
                self.state = match previous {
                    SwapchainState::Uninitialized => SwapchainState::Uninitialized,
                    _ => SwapchainState::OutOfDate,
                };
                Err(err)
            }
        }
    }

    fn configure(
        &mut self,
        backend: &mut dyn GpuBackend,
        width: u32,
        height: u32,
        wait_idle: bool,
    ) -> RenderResult<()> {
        if wait_idle {
            backend.wait_idle()?;
        }
        let capabilities = backend.surface_capabilities()?;
        let format = choose_surface_format(&capabilities.formats).ok_or_else(|| {
            RenderError::Initialization("surface reports no supported formats".into())
        })?;
        let present_mode = choose_present_mode(&capabilities.present_modes, self.config.vsync);
        let image_count = choose_image_count(&capabilities);

        backend.configure_surface(&SurfaceConfiguration {
            width,
            height,
            format,
            present_mode,
            image_count,
        })?;

        self.extent = Extent2d::new(width, height);
        self.format = Some(format);
        self.present_mode = Some(present_mode);
        self.image_count = image_count;
        Ok(())
    }
}

fn check_extent(width: u32, height: u32) -> RenderResult<()> {
    if width == 0 || height == 0 {
        Err(RenderError::InvalidArgument(format!(
            "swapchain size {}x{} must be non-zero",
            width, height
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: min,
            max_image_count: max,
            formats: vec![TextureFormat::Rgba8Unorm],
            present_modes: vec![PresentMode::Fifo],
            current_extent: None,
        }
    }

    #[test]
    fn test_image_count_policy() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
    }

    #[test]
    fn test_present_mode_policy() {
        let all = [PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate];
        assert_eq!(choose_present_mode(&all, true), PresentMode::Fifo);
        assert_eq!(choose_present_mode(&all, false), PresentMode::Mailbox);
        assert_eq!(
            choose_present_mode(&[PresentMode::Fifo, PresentMode::Immediate], false),
            PresentMode::Immediate
        );
        assert_eq!(choose_present_mode(&[PresentMode::Fifo], false), PresentMode::Fifo);
    }

    #[test]
    fn test_surface_format_policy() {
        assert_eq!(
            choose_surface_format(&[TextureFormat::Bgra8UnormSrgb, TextureFormat::Bgra8Unorm]),
            Some(TextureFormat::Bgra8Unorm)
        );
        assert_eq!(
            choose_surface_format(&[TextureFormat::Rgba8Unorm, TextureFormat::Bgra8UnormSrgb]),
            Some(TextureFormat::Bgra8UnormSrgb)
        );
        assert_eq!(
            choose_surface_format(&[TextureFormat::Rgba16Float]),
            Some(TextureFormat::Rgba16Float)
        );
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_acquire_before_create() {
        let mut device = GpuDevice::headless(64, 64);
        let mut presentation = PresentationManager::new(PresentationConfig::default());
        assert!(matches!(
            presentation.acquire_next_image(&mut device),
            Err(RenderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_acquire_present_cycle() {
        let mut device = GpuDevice::headless(640, 480);
        let mut presentation = PresentationManager::new(PresentationConfig::default());
        presentation.create(&mut device, 640, 480).unwrap();
        assert_eq!(presentation.state(), SwapchainState::Ready);
        assert_eq!(presentation.extent(), Extent2d::new(640, 480));
        assert_eq!(presentation.format(), Some(TextureFormat::Bgra8Unorm));
        assert_eq!(presentation.image_count(), 3);

        let image = presentation.acquire_next_image(&mut device).unwrap();
        assert!(image.is_ready());
        presentation.present_image(&mut device, image).unwrap();
        assert_eq!(presentation.frames_presented(), 1);
    }

    #[test]
    fn test_stale_image_rejected() {
        let mut device = GpuDevice::headless(64, 64);
        let mut presentation = PresentationManager::new(PresentationConfig::default());
        presentation.create(&mut device, 64, 64).unwrap();

        let image = presentation.acquire_next_image(&mut device).unwrap();
        let stale = SwapchainImage {
            index: image.index(),
            serial: image.serial() - 1,
            ready: true,
        };
        assert!(matches!(
            presentation.present_image(&mut device, stale),
            Err(RenderError::InvalidState(_))
        ));
        presentation.present_image(&mut device, image).unwrap();
    }

    #[test]
    fn test_abandoned_image_frees_the_next_acquire() {
        let mut device = GpuDevice::headless(64, 64);
        let mut presentation = PresentationManager::new(PresentationConfig::default());
        presentation.create(&mut device, 64, 64).unwrap();

        let image = presentation.acquire_next_image(&mut device).unwrap();
        let serial = image.serial();
        assert!(presentation.has_outstanding_image());
        presentation.abandon_image(&mut device, image);
        assert!(!presentation.has_outstanding_image());
        assert_eq!(presentation.frames_presented(), 0);

        let next = presentation.acquire_next_image(&mut device).unwrap();
        assert!(next.serial() > serial);
        presentation.present_image(&mut device, next).unwrap();
    }

    #[test]
    fn test_zero_size_recreate_rejected() {
        let mut device = GpuDevice::headless(64, 64);
        let mut presentation = PresentationManager::new(PresentationConfig::default());
        presentation.create(&mut device, 64, 64).unwrap();
        assert!(matches!(
            presentation.recreate_swapchain(&mut device, 0, 64),
            Err(RenderError::InvalidArgument(_))
        ));
        assert_eq!(presentation.state(), SwapchainState::Ready);
    }
}
