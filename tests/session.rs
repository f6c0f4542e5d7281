mod common;

use std::fs::File;

use common::{scratch_dir, session};
use image::{Frame, Rgba, RgbaImage, codecs::gif::GifEncoder};
use texture_forge::{ParamValue, params::MouseInput};

#[test]
fn add_node_pushes_seeded_defaults() {
    let mut s = session();
    let circle = s.add_node("Circle").unwrap();
    let node = s.node(circle).unwrap();
    assert_eq!(node.parameters.len(), 32);
    assert_eq!(
        s.graph().stage(node.stage).unwrap().params,
        node.parameters.as_bytes()
    );
    assert_eq!(
        s.parameters(circle).unwrap().get("center").unwrap(),
        ParamValue::Float2([0.5, 0.5])
    );
    assert!(s.add_node("NoSuchNode").is_err());

    let cube = s.add_node("EquirectToCubemap").unwrap();
    assert!(s.is_cubemap(cube));
    assert!(!s.is_cubemap(circle));
}

#[test]
fn depth_nodes_get_a_depth_buffer() {
    let mut s = session();
    let view = s.add_node("EnvironmentView").unwrap();
    let color = s.add_node("Color").unwrap();
    s.run();
    let view_stage = s.node(view).unwrap().stage;
    let color_stage = s.node(color).unwrap().stage;
    assert!(s.graph().stage(view_stage).unwrap().has_depth);
    assert!(s.graph().render_target(view_stage).unwrap().extent.depth);
    assert!(!s.graph().render_target(color_stage).unwrap().extent.depth);
}

#[test]
fn runtime_ids_are_never_reused() {
    let mut s = session();
    let a = s.add_node("Color").unwrap();
    let first = s.node(a).unwrap().runtime_id;
    s.delete_node(a).unwrap();
    let b = s.add_node("Color").unwrap();
    assert_ne!(s.node(b).unwrap().runtime_id, first);
}

#[test]
fn delete_renumbers_and_unhooks() {
    let mut s = session();
    let color = s.add_node("Color").unwrap();
    let blur = s.add_node("Blur").unwrap();
    let tail = s.add_node("Blur").unwrap();
    s.connect(blur, 0, color).unwrap();
    s.connect(tail, 0, blur).unwrap();
    s.select(Some(tail)).unwrap();
    s.run();

    let reports = s.delete_node(blur).unwrap();
    assert_eq!(s.len(), 2);
    assert_eq!(s.selected(), Some(1));
    assert_eq!(s.inputs(1).unwrap(), [None; 8]);
    let tail_stage = s.node(1).unwrap().stage;
    assert!(reports.iter().any(|r| r.stage == tail_stage));
    assert!(s.delete_node(5).is_err());
}

#[test]
fn connect_respects_declared_inputs() {
    let mut s = session();
    let color = s.add_node("Color").unwrap();
    let other = s.add_node("Color").unwrap();
    let blend = s.add_node("Blend").unwrap();

    assert!(s.connect(color, 0, other).is_err());
    s.connect(blend, 1, other).unwrap();
    assert!(s.connect(blend, 2, color).is_err());
    assert_eq!(s.inputs(blend).unwrap()[1], Some(other));

    s.disconnect(blend, 1).unwrap();
    assert_eq!(s.inputs(blend).unwrap()[1], None);
}

#[test]
fn time_slots_clamp_local_time() {
    let mut s = session();
    let noise = s.add_node("Noise").unwrap();
    s.set_time_slot(noise, 10, 14).unwrap();
    assert!(s.set_time_slot(noise, 5, 4).is_err());

    s.set_time(5).unwrap();
    assert_eq!(s.local_time(noise), Some(0));
    s.set_time(12).unwrap();
    assert_eq!(s.local_time(noise), Some(2));
    s.set_time(30).unwrap();
    assert_eq!(s.local_time(noise), Some(4));
    assert_eq!(s.timeline_length(), 15);

    s.set_time_duration(noise, 2).unwrap();
    assert_eq!(s.node(noise).unwrap().end_frame, 11);
    assert_eq!(s.timeline_length(), 12);
    s.set_time_duration(noise, 0).unwrap();
    assert_eq!(s.node(noise).unwrap().end_frame, 10);
}

#[test]
fn animated_source_extends_the_timeline() {
    let dir = scratch_dir("session-gif");
    let path = dir.join("anim.gif");
    let frames = (0..3u8).map(|i| Frame::new(RgbaImage::from_pixel(4, 4, Rgba([i * 80, 0, 0, 255]))));
    GifEncoder::new(File::create(&path).unwrap())
        .encode_frames(frames)
        .unwrap();

    let mut s = session();
    let read = s.add_node("ImageRead").unwrap();
    s.edit_parameters(read, |block| block.set_filename("file", path.to_str().unwrap()))
        .unwrap();
    let stage = s.node(read).unwrap().stage;
    assert_eq!(s.graph().image_duration(stage), 3);

    s.set_time_slot(read, 40, 41).unwrap();
    assert_eq!(s.timeline_length(), 43);

    // A missing file leaves the node without a source instead of failing.
    s.edit_parameters(read, |block| block.set_filename("file", "/nonexistent/file.png"))
        .unwrap();
    assert_eq!(s.graph().image_duration(stage), 0);
}

#[test]
fn force_evaluate_writes_one_file_per_frame() {
    let dir = scratch_dir("session-force");
    let mut s = session();
    let color = s.add_node("Color").unwrap();
    let sequence = s.add_node("ImageWrite").unwrap();
    let still = s.add_node("ImageWrite").unwrap();
    let unnamed = s.add_node("ImageWrite").unwrap();
    s.connect(sequence, 0, color).unwrap();
    s.connect(still, 0, color).unwrap();
    s.connect(unnamed, 0, color).unwrap();

    let out = dir.join("seq.png");
    let single = dir.join("still.png");
    s.edit_parameters(sequence, |b| b.set_filename("file", out.to_str().unwrap()))
        .unwrap();
    s.edit_parameters(still, |b| b.set_filename("file", single.to_str().unwrap()))
        .unwrap();
    s.set_time_slot(sequence, 0, 2).unwrap();
    s.set_time(7).unwrap();

    let written = s.force_evaluate().unwrap();
    let expected = vec![
        dir.join("seq_0000.png"),
        dir.join("seq_0001.png"),
        dir.join("seq_0002.png"),
        single.clone(),
    ];
    assert_eq!(written, expected);
    for path in &expected {
        let image = image::open(path).unwrap();
        assert_eq!((image.width(), image.height()), (64, 64));
    }
    assert_eq!(s.time(), 7);
    assert_eq!(s.local_time(sequence), Some(2));
}

#[test]
fn trigger_without_output_file_redraws_the_displayed_target() {
    let mut s = session();
    let noise = s.add_node("Noise").unwrap();
    s.run();
    let stage = s.node(noise).unwrap().stage;
    let version = s.graph().primary().version(stage);
    let draws = s.graph().backend().draws.len();

    assert_eq!(s.trigger_node(noise).unwrap(), None);
    assert_eq!(s.graph().backend().draws.len(), draws + 1);
    assert!(s.graph().primary().version(stage) > version);
    let target = s.graph().render_target(stage).unwrap();
    assert_eq!(s.graph().backend().draws.last().unwrap().target, target.id);
    assert!(s.graph().backend().draws.last().unwrap().forced);
}

#[test]
fn trigger_writes_the_node_output() {
    let dir = scratch_dir("session-trigger");
    let mut s = session();
    let write = s.add_node("ImageWrite").unwrap();
    assert_eq!(s.trigger_node(write).unwrap(), None);

    let path = dir.join("trigger.png");
    s.edit_parameters(write, |b| b.set_filename("file", path.to_str().unwrap()))
        .unwrap();
    assert_eq!(s.trigger_node(write).unwrap(), Some(path.clone()));
    assert!(path.exists());
}

#[test]
fn mouse_drives_the_selected_node() {
    let mut s = session();
    let circle = s.add_node("Circle").unwrap();
    let color = s.add_node("Color").unwrap();
    let mouse = MouseInput {
        x: 0.25,
        y: 0.75,
        left: true,
        pressed: true,
        ..MouseInput::default()
    };

    assert!(!s.set_mouse(mouse).unwrap());

    s.select(Some(circle)).unwrap();
    assert!(s.set_mouse(mouse).unwrap());
    assert_eq!(
        s.parameters(circle).unwrap().get("center").unwrap(),
        ParamValue::Float2([0.25, 0.75])
    );
    let stage = s.node(circle).unwrap().stage;
    assert_eq!(s.graph().stage(stage).unwrap().mouse, [0.25, 0.75, 1.0, 0.0]);
    assert_eq!(
        s.graph().stage(stage).unwrap().params,
        s.parameters(circle).unwrap().as_bytes()
    );

    s.select(Some(color)).unwrap();
    assert!(!s.set_mouse(mouse).unwrap());
    let color_stage = s.node(color).unwrap().stage;
    assert_eq!(s.graph().stage(color_stage).unwrap().mouse, [0.0; 4]);
    assert!(s.select(Some(9)).is_err());
}

#[test]
fn interactive_run_respects_parameter_edits() {
    let mut s = session();
    let color = s.add_node("Color").unwrap();
    s.run();
    assert!(s.run().iter().all(|r| r.duration.is_none()));

    s.edit_parameters(color, |b| b.set("color", ParamValue::Color4([1.0, 0.0, 0.0, 1.0])))
        .unwrap();
    let reports = s.run();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].duration.is_some());
    assert_eq!(s.read_pixels(color, 0).unwrap().dimensions(), (256, 256));
}
