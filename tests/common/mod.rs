//! Shared fixtures: a headless renderer with a small three-drawable scene.
#![allow(dead_code)]

use glam::Vec3;
use gpu_driven_renderer::backend::headless::{ExecutionMode, HeadlessBackend};
use gpu_driven_renderer::backend::GraphicsBackend;
use gpu_driven_renderer::gpu_driven::{DrawIndexedIndirectArgs, COMMAND_STRIDE};
use gpu_driven_renderer::resources::{Material, Mesh, TextureData, TextureId};
use gpu_driven_renderer::scene::{Camera, Light, Model, ModelId, Projection, Scene, Transform};
use gpu_driven_renderer::{init_logging, FrameOutcome, FrameStats, Renderer, RendererConfig};

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 32;

pub const RED: [u8; 4] = [255, 0, 0, 255];
pub const BLUE: [u8; 4] = [0, 0, 255, 255];

pub struct TestContext {
    pub renderer: Renderer,
    pub scene: Scene,
    pub camera: Camera,
    pub red: TextureId,
    pub blue: TextureId,
    /// Cube (36 indices), red quad (6), blue quad (6)
    pub models: [ModelId; 3],
}

/// Small ring and shadow map so every test stays cheap
pub fn test_config() -> RendererConfig {
    RendererConfig::default()
        .with_size(WIDTH, HEIGHT)
        .with_frames_in_flight(2)
        .with_shadow_map_size(64)
        .with_frame_ring_validation(true)
}

impl TestContext {
    pub fn new(config: RendererConfig) -> Self {
        Self::with_mode(config, ExecutionMode::Immediate)
    }

    /// Renderer plus an uninitialized scene holding drawables A, B and C
    pub fn with_mode(config: RendererConfig, mode: ExecutionMode) -> Self {
        init_logging();
        let backend = HeadlessBackend::new(WIDTH, HEIGHT).with_execution_mode(mode);
        let mut renderer = Renderer::new(Box::new(backend), config).unwrap();

        let red = renderer
            .intern_texture(&TextureData::solid_color(RED, "red"))
            .unwrap();
        let blue = renderer
            .intern_texture(&TextureData::solid_color(BLUE, "blue"))
            .unwrap();

        let mut scene = Scene::new();
        let plain = scene.add_material(Material::plastic(Vec3::splat(0.8)));
        let red_material = scene.add_material(Material::textured("red", red));
        let blue_material = scene.add_material(Material::textured("blue", blue));

        let cube = renderer.upload_mesh(&Mesh::cube()).unwrap();
        let quad = renderer.upload_mesh(&Mesh::quad()).unwrap();
        let models = [
            scene.add_model(Model::new(cube, plain)),
            scene.add_model(
                Model::new(quad.clone(), red_material)
                    .with_transform(Transform::from_position(Vec3::new(-2.0, 0.0, 0.0))),
            ),
            scene.add_model(
                Model::new(quad, blue_material)
                    .with_transform(Transform::from_position(Vec3::new(2.0, 0.0, 0.0))),
            ),
        ];
        scene.add_light(Light::directional(
            Vec3::new(-0.3, -1.0, -0.2),
            Vec3::ONE,
            2.0,
        ));
        scene.add_light(Light::point(Vec3::new(0.0, 2.0, 1.0), Vec3::new(1.0, 0.8, 0.6), 4.0, 5.0));

        let camera = Camera::new(Vec3::new(0.0, 3.0, 6.0), Vec3::ZERO).with_projection(
            Projection::perspective(60.0, WIDTH as f32 / HEIGHT as f32, 0.1, 50.0),
        );

        Self {
            renderer,
            scene,
            camera,
            red,
            blue,
            models,
        }
    }

    /// Initialized context with the default test configuration
    pub fn initialized(config: RendererConfig, mode: ExecutionMode) -> Self {
        let mut ctx = Self::with_mode(config, mode);
        ctx.renderer.initialize(&ctx.scene).unwrap();
        ctx
    }

    pub fn render(&mut self) -> FrameStats {
        match self
            .renderer
            .render_frame(&self.scene, &self.camera, &self.scene)
            .unwrap()
        {
            FrameOutcome::Presented(stats) => stats,
            FrameOutcome::Dropped => panic!("headless frame dropped"),
        }
    }

    pub fn backend(&self) -> &HeadlessBackend {
        self.renderer
            .context()
            .backend_as::<HeadlessBackend>()
            .unwrap()
    }

    pub fn backend_mut(&mut self) -> &mut HeadlessBackend {
        self.renderer
            .context_mut()
            .backend_as_mut::<HeadlessBackend>()
            .unwrap()
    }
}

impl TestContext {
    /// Commands in the replay ICB, one per drawable
    pub fn commands(&mut self) -> Vec<DrawIndexedIndirectArgs> {
        let replay = self.renderer.command_buffer().unwrap().replay();
        let count = self.renderer.drawable_count() as usize;
        let bytes = self.backend_mut().read_buffer(replay).unwrap();
        bytes
            .chunks_exact(COMMAND_STRIDE as usize)
            .take(count)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}
