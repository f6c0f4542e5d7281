mod common;

use common::{evaluated, graph, scratch_dir, stage};
use texture_forge::{EvaluationContext, EvaluationInfo, StageState};

#[test]
fn bake_leaves_interactive_targets_untouched() {
    let dir = scratch_dir("bake-interactive");
    let mut g = graph();
    let a = stage(&mut g, "Color");
    let b = stage(&mut g, "Blur");
    g.add_evaluation_input(b, 0, a).unwrap();
    g.set_evaluation_size(b, Some((1024, 1024))).unwrap();

    let mut interactive = EvaluationContext::interactive(1024, 1024);
    interactive.run_all(&mut g);
    let target = g.render_target(b).unwrap().clone();
    let version = g.primary().version(b);
    let live = g.backend().live_targets();

    let path = dir.join("blur.png");
    g.bake(&path, b, 2048, 2048).unwrap();

    let baked = image::open(&path).unwrap();
    assert_eq!((baked.width(), baked.height()), (2048, 2048));
    assert_eq!(g.render_target(b), Some(&target));
    assert_eq!(g.primary().version(b), version);
    assert_eq!(g.backend().live_targets(), live);
    assert!(interactive.run_all(&mut g).iter().all(|r| r.state == StageState::Clean));
}

#[test]
fn bake_writes_cube_faces_as_a_strip() {
    let dir = scratch_dir("bake-cube");
    let mut g = graph();
    let cube = stage(&mut g, "EquirectToCubemap");
    g.set_cubemap(cube, true).unwrap();

    let path = dir.join("cube.png");
    g.bake(&path, cube, 32, 32).unwrap();
    let strip = image::open(&path).unwrap().to_rgba8();
    assert_eq!(strip.dimensions(), (32 * 6, 32));
    // The recording backend writes the face index into green.
    assert_eq!(strip.get_pixel(32 * 5 + 1, 0)[1], 5);
}

#[test]
fn bake_of_stuck_stage_fails_without_writing() {
    let dir = scratch_dir("bake-stuck");
    let mut g = graph();
    let s = stage(&mut g, "Missing");
    let path = dir.join("missing.png");
    let err = g.bake(&path, s, 64, 64).unwrap_err();
    assert!(format!("{err:#}").contains("Missing"));
    assert!(!path.exists());
    assert!(g.bake(dir.join("zero.png"), s, 0, 64).is_err());
}

#[test]
fn batch_context_tracks_dirtiness_separately() {
    let mut g = graph();
    let a = stage(&mut g, "Color");
    let b = stage(&mut g, "Blur");
    g.add_evaluation_input(b, 0, a).unwrap();

    let mut batch = EvaluationContext::batch(512, 512);
    assert_eq!(evaluated(batch.run_all(&mut g)), vec![a, b]);
    assert!(evaluated(batch.run_all(&mut g)).is_empty());
    assert_eq!(batch.evaluation_size(&g, b), Some((512, 512)));
    assert_eq!(batch.render_target(&g, b).unwrap().extent.width, 512);

    // The interactive bank never ran.
    assert!(g.is_dirty(a) && g.is_dirty(b));

    batch.set_target_dirty(&mut g, a).unwrap();
    assert_eq!(evaluated(batch.run_all(&mut g)), vec![a, b]);

    let live = g.backend().live_targets();
    batch.release(&mut g);
    assert_eq!(g.backend().live_targets(), live - 2);
}

#[test]
fn run_single_touches_only_upstream_and_forces_the_focus() {
    let mut g = graph();
    let a = stage(&mut g, "Color");
    let b = stage(&mut g, "Blur");
    let unrelated = stage(&mut g, "Checker");
    g.add_evaluation_input(b, 0, a).unwrap();

    let mut batch = EvaluationContext::batch(64, 64);
    let reports = batch.run_single(&mut g, b, EvaluationInfo::forced());
    assert_eq!(evaluated(reports), vec![a, b]);
    assert!(reports.iter().all(|r| r.stage != unrelated));

    // Only the focus is forced on the second pass.
    let reports = batch.run_single(&mut g, b, EvaluationInfo::forced());
    assert_eq!(evaluated(reports), vec![b]);
    assert_eq!(batch.stage_state(a), Some(StageState::Clean));
    batch.release(&mut g);
}
