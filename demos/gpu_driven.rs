//! Orbiting demo scene for the GPU-driven renderer
//!
//! Run with:
//!   cargo run --example gpu_driven
//!   cargo run --example gpu_driven -- --mode forward --culling
//!   cargo run --example gpu_driven -- --headless --frames 120
//!
//! Controls:
//!   M       - Toggle deferred / forward shading
//!   Escape  - Exit

use clap::{Parser, ValueEnum};
use glam::Vec3;
use gpu_driven_renderer::{
    init_logging,
    resources::{Material, Mesh, TextureData},
    scene::{Camera, Light, Model, Projection, Scene, Transform},
    BackendType, FrameOutcome, HeadlessBackend, RenderMode, Renderer, RendererConfig,
    RendererResult, WgpuBackend,
};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Deferred,
    Forward,
}

impl From<Mode> for RenderMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Deferred => RenderMode::Deferred,
            Mode::Forward => RenderMode::Forward,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "GPU-driven renderer demo")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Deferred)]
    mode: Mode,
    /// Exit after this many frames; 0 runs until the window closes
    #[arg(long, default_value_t = 0)]
    frames: u64,
    /// Render without a window on the host backend
    #[arg(long)]
    headless: bool,
    /// Frustum cull inside the synthesis kernel
    #[arg(long)]
    culling: bool,
    #[arg(long)]
    no_shadows: bool,
    /// Grid edge length; the scene holds edge * edge objects
    #[arg(long, default_value_t = 12)]
    grid: u32,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let config = RendererConfig::default()
        .with_render_mode(args.mode.into())
        .with_gpu_culling(args.culling)
        .with_shadows(!args.no_shadows);

    let result = if args.headless {
        run_headless(&args, config.with_backend(BackendType::Headless))
    } else {
        run_windowed(args, config)
    };
    if let Err(err) = result {
        eprintln!("Demo failed: {}", err);
        std::process::exit(1);
    }
}

/// Textures, meshes and lights for a grid of alternating cubes and spheres
fn setup_scene(renderer: &mut Renderer, grid: u32) -> RendererResult<Scene> {
    let checker = renderer.intern_texture(&TextureData::checkerboard(
        "checker",
        64,
        [230, 230, 230, 255],
        [40, 40, 40, 255],
    ))?;
    let brick = renderer.intern_texture(&TextureData::solid_color([170, 74, 68, 255], "brick"))?;
    // Missing files render untextured
    let missing = renderer.intern_texture_file("assets/does_not_exist.png")?;

    let mut scene = Scene::new();
    let floor_material = scene.add_material(Material::textured("floor", checker));
    let materials = [
        scene.add_material(Material::textured("brick", brick)),
        scene.add_material(Material::gold()),
        scene.add_material(Material::metal(Vec3::new(0.6, 0.6, 0.7), 0.3)),
        scene.add_material(Material::plastic(Vec3::new(0.2, 0.5, 0.9)).with_base_color_texture(missing)),
        scene.add_material(Material::glass()),
    ];

    let floor = renderer.upload_mesh(&Mesh::plane(1.0, 1.0, 1))?;
    let cube = renderer.upload_mesh(&Mesh::cube())?;
    let sphere = renderer.upload_mesh(&Mesh::sphere(24, 16))?;

    let extent = grid as f32 * 2.0;
    scene.add_model(
        Model::new(floor, floor_material)
            .with_transform(Transform::from_position_scale(
                Vec3::new(0.0, -0.5, 0.0),
                Vec3::new(extent, 1.0, extent),
            ))
            .with_tiling(grid as f32),
    );
    let half = (grid as f32 - 1.0) * 0.5;
    for x in 0..grid {
        for z in 0..grid {
            let mesh = if (x + z) % 2 == 0 { cube.clone() } else { sphere.clone() };
            let material = materials[((x * 7 + z * 3) % materials.len() as u32) as usize];
            let position = Vec3::new((x as f32 - half) * 2.0, 0.0, (z as f32 - half) * 2.0);
            scene.add_model(
                Model::new(mesh, material).with_transform(Transform::from_position(position)),
            );
        }
    }

    scene.add_light(Light::directional(
        Vec3::new(-0.4, -1.0, -0.3),
        Vec3::new(1.0, 0.95, 0.9),
        2.5,
    ));
    for i in 0..16 {
        let angle = i as f32 / 16.0 * std::f32::consts::TAU;
        let color = Vec3::new(
            0.5 + 0.5 * angle.cos(),
            0.5 + 0.5 * (angle + 2.1).cos(),
            0.5 + 0.5 * (angle + 4.2).cos(),
        );
        scene.add_light(Light::point(
            Vec3::new(angle.cos() * half * 1.5, 1.5, angle.sin() * half * 1.5),
            color,
            6.0,
            5.0,
        ));
    }

    println!(
        "Scene: {} objects, {} textures",
        scene.models().count(),
        renderer.heap().len()
    );
    Ok(scene)
}

fn orbit_camera(camera: &mut Camera, elapsed: f32, radius: f32) {
    let angle = elapsed * 0.2;
    camera.position = Vec3::new(angle.cos() * radius, radius * 0.6, angle.sin() * radius);
}

fn make_camera(width: u32, height: u32, radius: f32) -> Camera {
    let mut camera = Camera::new(Vec3::new(radius, radius * 0.6, 0.0), Vec3::ZERO)
        .with_projection(Projection::perspective(60.0, 1.0, 0.1, radius * 4.0));
    camera.set_aspect(width as f32, height as f32);
    camera
}

fn run_headless(args: &Args, config: RendererConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (width, height) = (config.width, config.height);
    let backend = HeadlessBackend::new(width, height);
    let mut renderer = Renderer::new(Box::new(backend), config)?;
    let scene = setup_scene(&mut renderer, args.grid)?;
    renderer.initialize(&scene)?;

    let radius = args.grid as f32 * 2.0;
    let mut camera = make_camera(width, height, radius);
    let frames = if args.frames == 0 { 60 } else { args.frames };
    let start = Instant::now();
    let mut dropped = 0;
    for frame in 0..frames {
        orbit_camera(&mut camera, frame as f32 / 60.0, radius);
        if let FrameOutcome::Dropped = renderer.render_frame(&scene, &camera, &scene)? {
            dropped += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "Rendered {} frames ({} dropped) in {:.2?}, passes: {}",
        frames,
        dropped,
        elapsed,
        renderer.pass_order().join(" -> ")
    );
    Ok(())
}

fn run_windowed(args: Args, config: RendererConfig) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .build(&event_loop)?,
    );

    let backend = WgpuBackend::new(Arc::clone(&window), config.vsync)?;
    let mut renderer = Renderer::new(Box::new(backend), config)?;
    let scene = setup_scene(&mut renderer, args.grid)?;
    renderer.initialize(&scene)?;

    let radius = args.grid as f32 * 2.0;
    let (width, height) = renderer.size();
    let mut camera = make_camera(width, height, radius);
    let start = Instant::now();
    let mut rendered = 0u64;

    println!("Backend: {}", renderer.context().backend().name());
    println!("Controls: M toggles deferred/forward, Escape exits");

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);
        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::Resized(size) => {
                    if let Err(err) = renderer.resize(size.width, size.height) {
                        log::error!("Resize failed: {}", err);
                        elwt.exit();
                    }
                    camera.set_aspect(size.width.max(1) as f32, size.height.max(1) as f32);
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(code),
                            state: ElementState::Pressed,
                            ..
                        },
                    ..
                } => match code {
                    KeyCode::Escape => elwt.exit(),
                    KeyCode::KeyM => {
                        let next = match renderer.config().render_mode {
                            RenderMode::Deferred => RenderMode::Forward,
                            RenderMode::Forward => RenderMode::Deferred,
                        };
                        if let Err(err) = renderer.set_render_mode(next) {
                            log::error!("Mode switch failed: {}", err);
                        }
                    }
                    _ => {}
                },
                WindowEvent::RedrawRequested => {
                    orbit_camera(&mut camera, start.elapsed().as_secs_f32(), radius);
                    match renderer.render_frame(&scene, &camera, &scene) {
                        Ok(FrameOutcome::Presented(_)) => rendered += 1,
                        Ok(FrameOutcome::Dropped) => {}
                        Err(err) => {
                            log::error!("Frame failed: {}", err);
                            elwt.exit();
                        }
                    }
                    if args.frames > 0 && rendered >= args.frames {
                        elwt.exit();
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.request_redraw(),
            _ => {}
        }
    })?;
    Ok(())
}
