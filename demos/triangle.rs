//! Spinning triangles and quads drawn through the renderer.
//!
//! Run with: cargo run --example triangle -- --backend vulkan
//!
//! Controls:
//! - F: simulate a device loss
//! - R: restore the device
//! - V: toggle vsync
//! - Escape: exit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use glam::{Mat4, Vec3};
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

use gpu_render_core::{
    BackendType, Camera, Drawable, Geometry, GeometryId, Material, MaterialId, ObjectId,
    RenderError, Renderer, RendererConfig, Scene, SurfaceTarget,
};

const FOV_Y: f32 = std::f32::consts::FRAC_PI_4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliBackend {
    Wgpu,
    Vulkan,
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(value: CliBackend) -> Self {
        match value {
            CliBackend::Wgpu => BackendType::Wgpu,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "triangle", about = "Renders a small scene of triangles and quads")]
struct Args {
    /// Backend to request. Falls back to the next available one on failure.
    #[arg(long, value_enum)]
    backend: Option<CliBackend>,

    /// Renderer settings in TOML.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable vertical sync.
    #[arg(long)]
    no_vsync: bool,

    /// Number of objects in the scene.
    #[arg(long, default_value = "64")]
    objects: u64,
}

struct DemoState {
    scene: Scene,
    camera: Camera,
    started: Instant,
    last_report: Instant,
    vsync: bool,
}

fn build_scene(objects: u64) -> Scene {
    let triangle = Arc::new(Geometry::triangle(GeometryId(1)));
    let quad = Arc::new(Geometry::quad(GeometryId(2), [0.9, 0.6, 0.2]));
    let material = Arc::new(Material::basic(MaterialId(1)).with_label("basic"));

    let mut scene = Scene::new();
    let side = (objects as f32).sqrt().ceil().max(1.0) as u64;
    for i in 0..objects {
        let x = (i % side) as f32 - side as f32 / 2.0;
        let y = (i / side) as f32 - side as f32 / 2.0;
        let geometry = if i % 2 == 0 { &triangle } else { &quad };
        scene.add(
            Drawable::new(ObjectId(i), geometry.clone(), material.clone())
                .with_transform(Mat4::from_translation(Vec3::new(x * 1.2, y * 1.2, 0.0))),
        );
    }
    scene
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RendererConfig::from_file_or_default(path),
        None => RendererConfig::default(),
    };
    if let Some(backend) = args.backend {
        config = config.with_backend(backend.into());
    }
    if args.no_vsync {
        config = config.with_vsync(false);
    }

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("GPU Render Core - Triangle")
            .with_inner_size(PhysicalSize::new(1280, 720))
            .build(&event_loop)
            .expect("Failed to create window"),
    );

    let size = window.inner_size();
    let mut renderer = Renderer::new(config);
    renderer
        .initialize(SurfaceTarget::window(window.clone(), size.width, size.height))
        .expect("Failed to initialize renderer");
    renderer.on_context_lost(|reason| log::warn!("Context lost: {}", reason));
    renderer.on_context_restored(|| log::info!("Context restored"));

    if let Some(info) = renderer.adapter_info() {
        println!("Backend: {} on {}", info.backend, info.name);
    }
    println!("Controls: F lose device, R restore, V toggle vsync, Escape exit");

    let aspect = size.width as f32 / size.height.max(1) as f32;
    let mut state = DemoState {
        scene: build_scene(args.objects),
        camera: Camera::perspective(FOV_Y, aspect, 0.1, 100.0).looking_at(
            Vec3::new(0.0, 0.0, 12.0),
            Vec3::ZERO,
            Vec3::Y,
        ),
        started: Instant::now(),
        last_report: Instant::now(),
        vsync: renderer.config().vsync,
    };

    let window_clone = Arc::clone(&window);
    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    handle_window_event(&event, &mut state, &mut renderer, elwt);
                }
                Event::AboutToWait => window_clone.request_redraw(),
                Event::LoopExiting => {
                    if let Err(e) = renderer.dispose() {
                        log::error!("Dispose failed: {}", e);
                    }
                }
                _ => {}
            }
        })
        .expect("Event loop failed");
}

fn handle_window_event(
    event: &WindowEvent,
    state: &mut DemoState,
    renderer: &mut Renderer,
    elwt: &EventLoopWindowTarget<()>,
) {
    match event {
        WindowEvent::CloseRequested => elwt.exit(),
        WindowEvent::Resized(size) => {
            if size.width == 0 || size.height == 0 {
                return;
            }
            if let Err(e) = renderer.resize(size.width, size.height) {
                log::error!("Resize failed: {}", e);
            }
            let aspect = size.width as f32 / size.height as f32;
            state.camera.set_aspect(FOV_Y, aspect, 0.1, 100.0);
        }
        WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(key),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } => handle_key(*key, state, renderer, elwt),
        WindowEvent::RedrawRequested => render_frame(state, renderer),
        _ => {}
    }
}

fn handle_key(
    key: KeyCode,
    state: &mut DemoState,
    renderer: &mut Renderer,
    elwt: &EventLoopWindowTarget<()>,
) {
    match key {
        KeyCode::Escape => elwt.exit(),
        KeyCode::KeyF => renderer.force_context_loss(),
        KeyCode::KeyR => {
            if let Err(e) = renderer.restore_context() {
                log::error!("Restore failed: {}", e);
            }
        }
        KeyCode::KeyV => {
            state.vsync = !state.vsync;
            match renderer.set_vsync(state.vsync) {
                Ok(()) => println!("VSync: {}", state.vsync),
                Err(e) => log::error!("Failed to toggle vsync: {}", e),
            }
        }
        _ => {}
    }
}

fn render_frame(state: &mut DemoState, renderer: &mut Renderer) {
    let t = state.started.elapsed().as_secs_f32();
    let ids: Vec<ObjectId> = state.scene.iter().map(|d| d.id).collect();
    for id in ids {
        if let Some(drawable) = state.scene.get_mut(id) {
            let translation = drawable.world.w_axis.truncate();
            let spin = t * (1.0 + (id.0 % 5) as f32 * 0.3);
            drawable.world = Mat4::from_translation(translation) * Mat4::from_rotation_z(spin);
        }
    }

    match renderer.render(&state.scene, &state.camera) {
        Ok(()) => {}
        // Both clear up on their own: the swapchain on the next frame, the
        // device once the user presses R.
        Err(RenderError::SwapchainOutOfDate) | Err(RenderError::DeviceLost) => {}
        Err(e) if e.is_recoverable() => log::warn!("Frame skipped: {}", e),
        Err(e) => log::error!("Render failed: {}", e),
    }

    if state.last_report.elapsed().as_secs() >= 2 {
        state.last_report = Instant::now();
        log::info!("{}", renderer.stats_summary());
    }
}

