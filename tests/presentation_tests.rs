//! Swapchain lifecycle tests driven through the renderer.
//!
//! Surface faults are injected through the dummy backend.

mod common;

use rstest::rstest;

use common::{Backend, TestContext, HEIGHT, WIDTH};
use gpu_render_core::types::{Extent2d, PresentMode};
use gpu_render_core::{RenderError, RendererConfig, SwapchainState};

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_frames_present(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let scene = common::triangle_scene(3);
    let camera = common::camera();

    for _ in 0..5 {
        ctx.renderer.render(&scene, &camera).unwrap();
    }

    let presentation = ctx.renderer.presentation();
    assert_eq!(presentation.frames_presented(), 5);
    assert_eq!(presentation.state(), SwapchainState::Ready);
    assert_eq!(presentation.extent(), Extent2d::new(WIDTH, HEIGHT));
    assert_eq!(ctx.renderer.stats().frame, 5);
}

#[test]
fn test_out_of_date_surface_is_recreated_next_frame() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    let scene = common::triangle_scene(1);
    let camera = common::camera();
    assert_eq!(ctx.control().surface_configurations(), 1);

    ctx.control().mark_surface_out_of_date();
    assert_eq!(
        ctx.renderer.render(&scene, &camera),
        Err(RenderError::SwapchainOutOfDate)
    );
    assert_eq!(ctx.renderer.presentation().state(), SwapchainState::OutOfDate);

    ctx.renderer.render(&scene, &camera).unwrap();
    assert_eq!(ctx.control().surface_configurations(), 2);
    assert_eq!(ctx.renderer.presentation().state(), SwapchainState::Ready);
    // Recreation waits for the device first.
    assert!(ctx.control().wait_idle_calls() >= 1);
}

#[test]
fn test_out_of_date_without_auto_recreate_waits_for_resize() {
    let config = RendererConfig::headless().with_auto_recreate_swapchain(false);
    let mut ctx = TestContext::with_config(Backend::Dummy, config).unwrap();
    let scene = common::triangle_scene(1);
    let camera = common::camera();

    ctx.control().mark_surface_out_of_date();
    for _ in 0..2 {
        assert_eq!(
            ctx.renderer.render(&scene, &camera),
            Err(RenderError::SwapchainOutOfDate)
        );
    }

    ctx.renderer.resize(640, 480).unwrap();
    ctx.renderer.render(&scene, &camera).unwrap();
    assert_eq!(
        ctx.renderer.presentation().extent(),
        Extent2d::new(640, 480)
    );
}

#[test]
fn test_suboptimal_frame_still_presents() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    let scene = common::triangle_scene(1);
    let camera = common::camera();

    ctx.control().mark_next_acquire_suboptimal();
    ctx.renderer.render(&scene, &camera).unwrap();
    assert_eq!(ctx.renderer.presentation().state(), SwapchainState::Suboptimal);
    assert_eq!(ctx.control().presents(), 1);

    ctx.renderer.render(&scene, &camera).unwrap();
    assert_eq!(ctx.renderer.presentation().state(), SwapchainState::Ready);
    assert_eq!(ctx.control().surface_configurations(), 2);
}

#[test]
fn test_acquire_timeout_is_reported() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    let scene = common::triangle_scene(1);
    let camera = common::camera();

    ctx.control().time_out_next_acquire();
    let err = ctx.renderer.render(&scene, &camera).unwrap_err();
    assert!(matches!(err, RenderError::Timeout(_)));
    assert!(err.is_recoverable());
    assert_eq!(ctx.control().submissions(), 0);

    // A timeout does not invalidate the swapchain.
    assert_eq!(ctx.renderer.presentation().state(), SwapchainState::Ready);
    ctx.renderer.render(&scene, &camera).unwrap();
}

#[test]
fn test_vsync_toggle_rebuilds_with_new_mode() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    assert_eq!(
        ctx.renderer.presentation().present_mode(),
        Some(PresentMode::Fifo)
    );

    ctx.renderer.set_vsync(false).unwrap();
    assert_eq!(
        ctx.renderer.presentation().present_mode(),
        Some(PresentMode::Mailbox)
    );
    assert_eq!(ctx.control().surface_configurations(), 2);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_resize_rebuilds_depth_target(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    assert!(matches!(
        ctx.renderer.resize(0, 100),
        Err(RenderError::InvalidArgument(_))
    ));

    let before = ctx.renderer.stats().texture_memory;
    ctx.renderer.resize(WIDTH * 2, HEIGHT * 2).unwrap();
    // Depth32Float at four times the area.
    assert_eq!(ctx.renderer.stats().texture_memory, before * 4);
    assert_eq!(ctx.renderer.textures().live_count(), 1);
}
