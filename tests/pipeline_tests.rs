//! Shader module and pipeline cache integration tests.

mod common;

use rstest::rstest;

use common::{Backend, TestContext};
use gpu_render_core::types::{CullMode, DepthStencilState, MultisampleState, TextureFormat};
use gpu_render_core::{RenderError, RenderPipelineDescriptor, ShaderModuleDescriptor, BASIC_SHADER};

/// Vertex stage references an undeclared identifier.
const BROKEN_SHADER: &str = r#"
@vertex
fn vs_main() -> @builtin(position) vec4<f32> {
    return undefined_value;
}
"#;

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_identical_descriptors_share_a_pipeline(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let descriptor = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8UnormSrgb)
        .with_depth_stencil(DepthStencilState::depth_less());
    let first = ctx.renderer.create_pipeline(&descriptor).unwrap();
    // Labels do not take part in the cache key.
    let second = ctx
        .renderer
        .create_pipeline(&descriptor.clone().with_label("same pipeline"))
        .unwrap();
    assert_eq!(first, second);

    let stats = ctx.renderer.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    let culled = ctx
        .renderer
        .create_pipeline(&descriptor.clone().with_cull_mode(CullMode::Front))
        .unwrap();
    assert_ne!(first, culled);
    assert_eq!(ctx.renderer.pipelines().live_count(), 2);
    // Both pipelines reuse the one module built from the shared source.
    assert_eq!(ctx.renderer.pipelines().shader_module_count(), 1);
    assert_eq!(ctx.renderer.stats().shaders, 1);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_disposed_pipeline_is_rebuilt(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let descriptor = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8UnormSrgb);
    let first = ctx.renderer.create_pipeline(&descriptor).unwrap();
    ctx.renderer.destroy_pipeline(first).unwrap();
    assert!(matches!(
        ctx.renderer.destroy_pipeline(first),
        Err(RenderError::InvalidHandle(_))
    ));

    let rebuilt = ctx.renderer.create_pipeline(&descriptor).unwrap();
    assert_ne!(first, rebuilt);
    assert!(ctx.renderer.pipelines().is_live(rebuilt));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_invalid_descriptors_are_rejected(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let base = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8UnormSrgb);

    let mut zero_stride = base.clone();
    zero_stride.vertex_layout.array_stride = 0;

    let mut duplicate_location = base.clone();
    let attribute = duplicate_location.vertex_layout.attributes[0];
    duplicate_location.vertex_layout.attributes.push(attribute);

    let depth_as_color = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Depth32Float);

    let bad_samples = base.clone().with_multisample(MultisampleState {
        count: 3,
        ..Default::default()
    });

    for descriptor in [zero_stride, duplicate_location, depth_as_color, bad_samples] {
        assert!(matches!(
            ctx.renderer.create_pipeline(&descriptor),
            Err(RenderError::InvalidArgument(_))
        ));
    }
    assert_eq!(ctx.renderer.pipelines().live_count(), 0);
    assert_eq!(ctx.renderer.cache_stats().pipelines, 0);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
#[case::vulkan(Backend::Vulkan)]
fn test_broken_shader_fails_pipeline_creation(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    assert!(ctx.renderer.validate_shader(BASIC_SHADER));
    assert!(!ctx.renderer.validate_shader(BROKEN_SHADER));

    let descriptor = RenderPipelineDescriptor::new(BROKEN_SHADER, TextureFormat::Bgra8UnormSrgb);
    assert!(matches!(
        ctx.renderer.create_pipeline(&descriptor),
        Err(RenderError::CompileError(_))
    ));
    assert_eq!(ctx.renderer.pipelines().live_count(), 0);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_diagnostics_are_reported_lazily(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let clean = ctx
        .renderer
        .compile_shader(&ShaderModuleDescriptor::new(BASIC_SHADER).with_label("basic"))
        .unwrap();
    assert_eq!(ctx.renderer.shader_diagnostics(clean), Some(Vec::new()));

    let broken = ctx
        .renderer
        .compile_shader(&ShaderModuleDescriptor::new(BROKEN_SHADER))
        .unwrap();
    let diagnostics = ctx.renderer.shader_diagnostics(broken).unwrap();
    assert!(!diagnostics.is_empty());
    assert!(diagnostics[0].line.is_some());

    ctx.renderer.destroy_shader(broken).unwrap();
    assert_eq!(ctx.renderer.shader_diagnostics(broken), None);
}

#[test]
fn test_empty_shader_source_is_rejected() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    assert!(matches!(
        ctx.renderer.compile_shader(&ShaderModuleDescriptor::new("  \n")),
        Err(RenderError::InvalidArgument(_))
    ));
}

#[test]
fn test_repeated_frames_hit_the_cache() {
    let mut ctx = TestContext::new(Backend::Dummy).unwrap();
    let scene = common::triangle_scene(4);
    let camera = common::camera();

    for _ in 0..3 {
        ctx.renderer.render(&scene, &camera).unwrap();
    }

    assert_eq!(ctx.control().pipelines_created(), 1);
    assert_eq!(ctx.control().shader_modules_created(), 1);
    let stats = ctx.renderer.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
}
