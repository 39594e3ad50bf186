//! Command synthesis, ICB replay and instance suppression through the full renderer.

mod common;

use common::*;
use glam::Vec3;
use gpu_driven_renderer::backend::headless::{DrawKind, ExecutionMode};
use gpu_driven_renderer::backend::{GraphicsBackend, TextureSubresource};
use gpu_driven_renderer::gpu_driven::layout::MaterialRecord;
use gpu_driven_renderer::scene::Transform;
use gpu_driven_renderer::RendererError;
use rstest::rstest;

#[test]
fn synthesis_writes_one_command_per_drawable_in_registration_order() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    assert_eq!(ctx.renderer.command_buffer().unwrap().capacity(), 3);
    ctx.render();

    let commands = ctx.commands();
    assert_eq!(commands.len(), 3);
    let index_counts: Vec<u32> = commands.iter().map(|c| c.index_count).collect();
    assert_eq!(index_counts, vec![36, 6, 6]);
    for (slot, command) in commands.iter().enumerate() {
        assert_eq!(command.instance_count, 1);
        assert_eq!(command.first_instance, slot as u32);
    }
}

#[test]
fn textured_drawables_reference_their_own_heap_textures() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    ctx.render();

    let table = ctx.renderer.descriptor_table().unwrap();
    let views = ctx.renderer.heap().resident_views();
    let slot_of = |drawable: usize| {
        let material = table.records()[drawable].material_index as usize;
        table.materials()[material].textures[MaterialRecord::BASE_COLOR]
    };
    let (b_slot, c_slot) = (slot_of(1), slot_of(2));
    assert_ne!(b_slot, c_slot);
    let (b_view, c_view) = (views[b_slot as usize], views[c_slot as usize]);

    let backend = ctx.backend_mut();
    let b_texture = backend.view_texture(b_view).unwrap();
    let c_texture = backend.view_texture(c_view).unwrap();
    let b_texel = backend.read_texture(b_texture, TextureSubresource::BASE).unwrap();
    let c_texel = backend.read_texture(c_texture, TextureSubresource::BASE).unwrap();
    assert_eq!(&b_texel[..4], &RED);
    assert_eq!(&c_texel[..4], &BLUE);
}

#[test]
fn replay_draws_each_slot_with_its_registered_geometry() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    let stats = ctx.render();

    let cube_indices = ctx.scene.model(ctx.models[0]).unwrap().mesh.index_buffer;
    let quad_indices = ctx.scene.model(ctx.models[1]).unwrap().mesh.index_buffer;
    let draws: Vec<_> = ctx
        .backend()
        .trace()
        .draws_in("G-Buffer Pass")
        .filter(|d| d.submission == stats.submission)
        .cloned()
        .collect();
    assert_eq!(draws.len(), 3);
    for (slot, draw) in draws.iter().enumerate() {
        assert!(matches!(draw.kind, DrawKind::Indirect { slot: s, .. } if s == slot as u32));
        assert_eq!(draw.first_instance, slot as u32);
        assert_eq!(draw.program, "gbuffer");
    }
    assert_eq!(draws[0].index_buffer, Some(cube_indices));
    assert_eq!(draws[0].element_count, 36);
    assert_eq!(draws[0].indices.len(), 36);
    assert_eq!(draws[2].indices, draws[1].indices);
    assert_eq!(draws[1].index_buffer, Some(quad_indices));
    assert_eq!(draws[2].index_buffer, Some(quad_indices));
}

#[test]
fn hidden_drawable_gets_zero_instances_and_keeps_its_slot() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    ctx.scene.model_mut(ctx.models[1]).unwrap().visible = false;
    let stats = ctx.render();

    let commands = ctx.commands();
    assert_eq!(commands.len(), 3);
    let instances: Vec<u32> = commands.iter().map(|c| c.instance_count).collect();
    assert_eq!(instances, vec![1, 0, 1]);
    assert_eq!(commands[1].index_count, 6);

    let triangles: Vec<u64> = ctx
        .backend()
        .trace()
        .draws_in("G-Buffer Pass")
        .filter(|d| d.submission == stats.submission)
        .map(|d| d.triangle_count())
        .collect();
    assert_eq!(triangles, vec![12, 0, 2]);
}

#[test]
fn gpu_culling_suppresses_drawables_outside_the_frustum() {
    let mut ctx = TestContext::initialized(
        test_config().with_gpu_culling(true),
        ExecutionMode::Immediate,
    );
    ctx.scene.model_mut(ctx.models[2]).unwrap().transform =
        Transform::from_position(Vec3::new(0.0, 3.0, 60.0));
    ctx.render();

    let instances: Vec<u32> = ctx.commands().iter().map(|c| c.instance_count).collect();
    assert_eq!(instances, vec![1, 1, 0]);
}

#[rstest]
#[case::one_short(2)]
#[case::single(1)]
fn initialize_rejects_more_drawables_than_capacity(#[case] capacity: u32) {
    let mut ctx = TestContext::with_mode(
        test_config().with_max_drawables(capacity),
        ExecutionMode::Immediate,
    );
    let err = ctx.renderer.initialize(&ctx.scene).unwrap_err();
    assert!(matches!(
        err,
        RendererError::CapacityExceeded { requested, capacity: c } if c == capacity && requested == capacity + 1
    ));
}

#[test]
fn spare_capacity_keeps_command_count_fixed() {
    let mut ctx = TestContext::initialized(test_config().with_max_drawables(8), ExecutionMode::Immediate);
    ctx.render();
    assert_eq!(ctx.renderer.command_buffer().unwrap().capacity(), 8);
    assert_eq!(ctx.commands().len(), 3);

    let copies: Vec<u64> = ctx
        .backend()
        .trace()
        .events()
        .iter()
        .filter_map(|e| match e {
            gpu_driven_renderer::backend::headless::TraceEvent::CopyBuffer { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert!(copies.contains(&(3 * 20)));
}
