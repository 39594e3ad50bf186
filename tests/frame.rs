//! Pass sequencing, intermediate target freshness and the frame ring.

mod common;

use common::*;
use gpu_driven_renderer::backend::headless::{DrawKind, ExecutionMode, TraceEvent};
use gpu_driven_renderer::backend::{BackendError, GraphicsBackend, SubmissionId, TextureSubresource};
use gpu_driven_renderer::gpu_driven::layout::FrameUniforms;
use gpu_driven_renderer::{FrameOutcome, RenderMode, RendererError};
use rstest::rstest;

const DEFERRED: &[&str] = &[
    "Command Synthesis",
    "ICB Optimize",
    "Shadow Pass",
    "G-Buffer Pass",
    "Lighting Pass",
    "Composite Pass",
];
const FORWARD: &[&str] = &[
    "Command Synthesis",
    "ICB Optimize",
    "Shadow Pass",
    "Forward Pass",
    "Composite Pass",
];
/// Passes as the backend executed them; the ICB optimizer shows up as its copy
fn executed_passes(ctx: &TestContext, submission: SubmissionId) -> Vec<String> {
    ctx.backend()
        .trace()
        .events()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::BeginPass {
                submission: s,
                label,
                ..
            } if *s == submission => Some(label.clone()),
            TraceEvent::CopyBuffer { submission: s, .. } if *s == submission => {
                Some("ICB Optimize".to_string())
            }
            _ => None,
        })
        .collect()
}

const FORWARD_DIRECT: &[&str] = &["Command Synthesis", "ICB Optimize", "Shadow Pass", "Forward Pass"];

#[rstest]
#[case::deferred(RenderMode::Deferred, true, DEFERRED)]
#[case::forward(RenderMode::Forward, true, FORWARD)]
#[case::forward_without_post_process(RenderMode::Forward, false, FORWARD_DIRECT)]
fn passes_run_in_dependency_order(
    #[case] mode: RenderMode,
    #[case] post_process: bool,
    #[case] expected: &[&str],
) {
    let config = test_config()
        .with_render_mode(mode)
        .with_post_process(post_process);
    let mut ctx = TestContext::initialized(config, ExecutionMode::Immediate);
    assert_eq!(ctx.renderer.pass_order(), expected);

    let stats = ctx.render();
    assert_eq!(executed_passes(&ctx, stats.submission), expected);
    assert_eq!(ctx.backend().presented_frames(), 1);
}

#[test]
fn render_before_initialize_is_rejected() {
    let mut ctx = TestContext::new(test_config());
    let result = ctx
        .renderer
        .render_frame(&ctx.scene, &ctx.camera, &ctx.scene);
    assert!(matches!(result, Err(RendererError::NotInitialized)));
    assert!(matches!(
        ctx.renderer.rebuild_geometry(&ctx.scene),
        Err(RendererError::NotInitialized)
    ));
}

#[test]
fn lighting_samples_gbuffer_written_this_frame() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    ctx.render();

    let gbuffer = ctx.renderer.frame_resources().unwrap().gbuffer.unwrap();
    let albedo = ctx.renderer.graph_texture(gbuffer.albedo).unwrap();
    let garbage = vec![7u8; (WIDTH * HEIGHT * 4) as usize];
    ctx.backend_mut()
        .write_texture(albedo, TextureSubresource::BASE, &garbage);
    assert_eq!(ctx.backend().texture_last_written(albedo), None);

    let stats = ctx.render();
    let lighting: Vec<_> = ctx
        .backend()
        .trace()
        .draws_in("Lighting Pass")
        .filter(|d| d.submission == stats.submission)
        .cloned()
        .collect();
    assert!(!lighting.is_empty());
    for draw in &lighting {
        assert!(draw.sampled_textures.iter().any(|(t, _)| *t == albedo));
        for (texture, written) in &draw.sampled_textures {
            assert_eq!(*written, Some(stats.submission), "{:?} is stale", texture);
        }
    }

    let texels = ctx
        .backend_mut()
        .read_texture(albedo, TextureSubresource::BASE)
        .unwrap();
    assert_ne!(texels, garbage);
}

#[test]
fn point_lights_draw_as_one_instanced_volume() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    let stats = ctx.render();
    assert_eq!((stats.directional_lights, stats.volume_lights), (1, 1));

    let draws: Vec<_> = ctx
        .backend()
        .trace()
        .draws_in("Lighting Pass")
        .filter(|d| d.submission == stats.submission)
        .cloned()
        .collect();
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0].kind, DrawKind::Direct);
    assert_eq!((draws[0].element_count, draws[0].instance_count), (3, 1));
    assert_eq!(draws[1].kind, DrawKind::Indexed);
    assert_eq!(draws[1].first_instance, 1);
    assert_eq!(draws[1].instance_count, 1);
    assert_eq!(draws[1].element_count, 60);
    for draw in &draws {
        assert_eq!(draw.stencil_reference, 1);
    }
}

#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn deferred_execution_reads_each_frames_own_uniforms(#[case] frames_in_flight: usize) {
    let frames = 7;
    let mut ctx = TestContext::initialized(
        test_config().with_frames_in_flight(frames_in_flight),
        ExecutionMode::Deferred,
    );
    let stats: Vec<_> = (0..frames).map(|_| ctx.render()).collect();
    ctx.backend_mut().poll(true);

    let buffers = ctx.renderer.frame_uniform_buffers().to_vec();
    assert_eq!(buffers.len(), frames_in_flight);
    for frame in &stats {
        assert_eq!(frame.slot, frame.frame_index as usize % frames_in_flight);
        let draw = ctx
            .backend()
            .trace()
            .draws_in("Lighting Pass")
            .find(|d| d.submission == frame.submission)
            .cloned()
            .unwrap();
        let (_, bytes) = draw
            .uniforms
            .iter()
            .find(|(buffer, _)| *buffer == buffers[frame.slot])
            .unwrap();
        let uniforms: FrameUniforms =
            bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<FrameUniforms>()]);
        assert_eq!(uniforms.frame_index() as u64, frame.frame_index);
    }
    assert_eq!(ctx.backend().presented_frames(), frames);
}

#[test]
fn resize_rebuilds_intermediate_targets() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    ctx.render();
    ctx.renderer.resize(64, 48).unwrap();
    assert_eq!(ctx.renderer.size(), (64, 48));
    ctx.render();

    let resources = *ctx.renderer.frame_resources().unwrap();
    let gbuffer = resources.gbuffer.unwrap();
    for resource in [gbuffer.albedo, gbuffer.normal, gbuffer.position, gbuffer.depth]
        .into_iter()
        .chain(resources.hdr)
    {
        let texture = ctx.renderer.graph_texture(resource).unwrap();
        let desc = ctx.backend().texture_descriptor(texture).unwrap();
        assert_eq!((desc.width, desc.height), (64, 48));
    }
}

#[test]
fn switching_render_mode_rebuilds_the_pass_sequence() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    ctx.render();
    ctx.renderer.set_render_mode(RenderMode::Forward).unwrap();
    assert_eq!(ctx.renderer.pass_order(), FORWARD);
    assert!(ctx.renderer.frame_resources().unwrap().gbuffer.is_none());

    let stats = ctx.render();
    assert_eq!(executed_passes(&ctx, stats.submission), FORWARD);
    assert_eq!(
        ctx.backend()
            .trace()
            .draws_in("Forward Pass")
            .filter(|d| d.submission == stats.submission)
            .count(),
        3
    );
}

#[test]
fn scene_changes_need_a_geometry_rebuild() {
    let mut ctx = TestContext::initialized(test_config(), ExecutionMode::Immediate);
    let cube = ctx.scene.model(ctx.models[0]).unwrap().clone();
    ctx.scene.add_model(cube);
    let result = ctx
        .renderer
        .render_frame(&ctx.scene, &ctx.camera, &ctx.scene);
    assert!(matches!(result, Err(RendererError::InvalidConfig(_))));

    ctx.renderer.rebuild_geometry(&ctx.scene).unwrap();
    let stats = ctx.render();
    assert_eq!(stats.drawables, 4);
}

#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn dropped_frames_release_their_ring_slot(#[case] frames_in_flight: usize) {
    let mut ctx = TestContext::initialized(
        test_config().with_frames_in_flight(frames_in_flight),
        ExecutionMode::Deferred,
    );
    for _ in 0..frames_in_flight {
        ctx.render();
    }

    let frame_index = ctx.renderer.frame_ring().frame_index();
    let slot = ctx.renderer.frame_ring().current_slot();
    for error in [BackendError::SurfaceLost, BackendError::SurfaceOutdated] {
        ctx.backend_mut().fail_next_acquire(error);
        let outcome = ctx
            .renderer
            .render_frame(&ctx.scene, &ctx.camera, &ctx.scene)
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Dropped);
        assert_eq!(ctx.renderer.frame_ring().frame_index(), frame_index);
        assert_eq!(ctx.renderer.frame_ring().current_slot(), slot);
    }

    let resumed = ctx.render();
    assert_eq!(resumed.frame_index, frame_index);
    assert_eq!(resumed.slot, slot);

    // Several laps of the ring; a leaked slot would block here
    for _ in 0..3 * frames_in_flight {
        ctx.render();
    }
    ctx.backend_mut().poll(true);
    assert_eq!(ctx.renderer.frame_ring().free_slots(), frames_in_flight);
    assert_eq!(
        ctx.backend().presented_frames(),
        (4 * frames_in_flight + 1) as u64
    );
}
