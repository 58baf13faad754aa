//! Render graph integration tests against the dummy backend.
//!
//! ```bash
//! cargo test --test graph_tests
//! ```

mod common;

use rstest::rstest;

use aurora_render::backend::dummy::Command;
use aurora_render::backend::{BackendError, ImageLayout};
use aurora_render::passes::{FinalBlitPass, FxaaPass, GeometryPass};
use aurora_render::render_graph::NodeState;
use aurora_render::{DummyBackend, GraphError, NodeId, PortId, RenderBackend, RenderGraph};

use common::{call_log, dummy_setup, init_logging, live_objects, FailingPass, RecordingPass};

fn out(index: u32) -> PortId {
    PortId::output(index)
}

fn input(index: u32) -> PortId {
    PortId::input(index)
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_chain_bakes_producers_first() {
    init_logging();
    let (mut backend, mut exec) = dummy_setup(64, 64);
    let log = call_log();
    let mut graph = RenderGraph::new();
    // inserted back to front
    let c = graph.add_node(RecordingPass::new("c", 1, 0, &log)).unwrap();
    let b = graph.add_node(RecordingPass::new("b", 1, 1, &log)).unwrap();
    let a = graph.add_node(RecordingPass::new("a", 0, 1, &log)).unwrap();
    graph.connect(out(0), input(0), a, b).unwrap();
    graph.connect(out(0), input(0), b, c).unwrap();

    graph.bake(c, &mut backend, &mut exec).unwrap();
    assert_eq!(graph.order(), &[a, b, c]);

    backend.begin_frame().unwrap();
    graph.update(&mut backend, &mut exec).unwrap();
    backend.end_frame().unwrap();
    backend.present().unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["init a", "init b", "init c", "update a", "update b", "update c"]
    );
}

/// Every connection in the baked order runs its producer before its consumer.
#[rstest]
#[case::diamond(&[(0, 0, 1, 0), (0, 0, 2, 0), (1, 0, 3, 0), (2, 0, 3, 1)], 4, 3)]
#[case::fan_in(&[(0, 0, 3, 0), (1, 0, 3, 1), (2, 0, 3, 2)], 4, 3)]
#[case::shared_output(&[(1, 0, 0, 0), (1, 1, 0, 1), (2, 0, 1, 0)], 3, 0)]
#[case::long_skip(&[(0, 0, 1, 0), (1, 0, 2, 0), (0, 0, 2, 1), (2, 0, 3, 0), (1, 0, 3, 1)], 4, 3)]
fn test_order_is_topological(
    #[case] edges: &[(u32, u32, u32, u32)],
    #[case] node_count: u32,
    #[case] terminal: u32,
) {
    let (mut backend, mut exec) = dummy_setup(32, 32);
    let log = call_log();
    let mut graph = RenderGraph::<DummyBackend>::new();

    let names = ["n0", "n1", "n2", "n3"];
    let ids: Vec<NodeId> = (0..node_count)
        .map(|n| {
            let inputs = edges.iter().filter(|e| e.2 == n).count() as u32;
            let outputs = edges
                .iter()
                .filter(|e| e.0 == n)
                .map(|e| e.1 + 1)
                .max()
                .unwrap_or(0);
            graph
                .add_node(RecordingPass::new(names[n as usize], inputs, outputs, &log))
                .unwrap()
        })
        .collect();
    for &(src, src_port, dst, dst_port) in edges {
        graph
            .connect(
                out(src_port),
                input(dst_port),
                ids[src as usize],
                ids[dst as usize],
            )
            .unwrap();
    }

    graph
        .bake(ids[terminal as usize], &mut backend, &mut exec)
        .unwrap();

    let order = graph.order();
    assert_eq!(order.len(), node_count as usize);
    let position = |id: NodeId| order.iter().position(|&o| o == id).unwrap();
    for &(src, _, dst, _) in edges {
        assert!(position(ids[src as usize]) < position(ids[dst as usize]));
    }
    assert_eq!(*order.last().unwrap(), ids[terminal as usize]);
}

#[test]
fn test_unreachable_node_is_left_out() {
    let (mut backend, mut exec) = dummy_setup(32, 32);
    let log = call_log();
    let mut graph = RenderGraph::new();
    let a = graph.add_node(RecordingPass::new("a", 0, 1, &log)).unwrap();
    let b = graph.add_node(RecordingPass::new("b", 1, 0, &log)).unwrap();
    let stray = graph.add_node(RecordingPass::new("stray", 0, 1, &log)).unwrap();
    graph.connect(out(0), input(0), a, b).unwrap();

    graph.bake(b, &mut backend, &mut exec).unwrap();
    assert_eq!(graph.order(), &[a, b]);
    assert_eq!(graph.node_state(stray), Some(NodeState::Unbaked));
    assert!(graph.output_image(stray, 0).is_err());
}

// ============================================================================
// Validation
// ============================================================================

#[rstest]
#[case::two_nodes(2)]
#[case::three_nodes(3)]
fn test_cycle_is_rejected_before_init(#[case] length: usize) {
    let (mut backend, mut exec) = dummy_setup(32, 32);
    let log = call_log();
    let mut graph = RenderGraph::new();
    let ids: Vec<NodeId> = (0..length)
        .map(|_| graph.add_node(RecordingPass::new("loop", 1, 1, &log)).unwrap())
        .collect();
    for i in 0..length {
        graph
            .connect(out(0), input(0), ids[i], ids[(i + 1) % length])
            .unwrap();
    }

    let err = graph.bake(ids[0], &mut backend, &mut exec).unwrap_err();
    assert!(matches!(err, GraphError::CyclicDependency { .. }));
    assert!(!graph.is_baked());
    assert!(log.borrow().is_empty());
    assert_eq!(backend.live_images(), 0);
    for id in ids {
        assert_eq!(graph.node_state(id), Some(NodeState::Unbaked));
    }
}

#[test]
fn test_reconnect_replaces_link() {
    let (mut backend, mut exec) = dummy_setup(32, 32);
    let log = call_log();
    let mut graph = RenderGraph::new();
    let first = graph.add_node(RecordingPass::new("first", 0, 1, &log)).unwrap();
    let second = graph.add_node(RecordingPass::new("second", 0, 1, &log)).unwrap();
    let sink = graph.add_node(RecordingPass::new("sink", 1, 0, &log)).unwrap();
    graph.connect(out(0), input(0), first, sink).unwrap();
    graph.connect(out(0), input(0), second, sink).unwrap();
    assert_eq!(graph.connection(sink, 0), Some((second, 0)));

    graph.bake(sink, &mut backend, &mut exec).unwrap();
    assert_eq!(graph.order(), &[second, sink]);
}

// ============================================================================
// Resize
// ============================================================================

#[rstest]
#[case::grow((64, 64), (128, 128))]
#[case::shrink((256, 128), (32, 16))]
#[case::non_square((64, 64), (300, 17))]
fn test_resize_reallocates_outputs(#[case] initial: (u32, u32), #[case] resized: (u32, u32)) {
    init_logging();
    let mut renderer = common::dummy_renderer(initial.0, initial.1);
    let log = call_log();
    let a = renderer.add_node(RecordingPass::new("a", 0, 2, &log)).unwrap();
    let b = renderer.add_node(RecordingPass::new("b", 2, 1, &log)).unwrap();
    let c = renderer.add_node(RecordingPass::new("c", 1, 0, &log)).unwrap();
    renderer.connect(out(0), input(0), a, b).unwrap();
    renderer.connect(out(1), input(1), a, b).unwrap();
    renderer.connect(out(0), input(0), b, c).unwrap();
    renderer.bake(c).unwrap();
    renderer.render_frame().unwrap();

    let before = renderer.graph().output_image(a, 0).unwrap();
    assert_eq!((before.width, before.height), initial);
    let live_before = live_objects(renderer.backend());

    renderer.handle_resize(resized.0, resized.1).unwrap();

    for (node, output) in [(a, 0), (a, 1), (b, 0)] {
        let image = renderer.graph().output_image(node, output).unwrap();
        assert_eq!((image.width, image.height), resized);
        assert_eq!(renderer.graph().output_generation(node, output).unwrap(), 2);
    }
    let seen_by_b = renderer.graph().input_image(b, 1).unwrap();
    assert_eq!(seen_by_b, renderer.graph().output_image(a, 1).unwrap());
    assert_eq!(live_objects(renderer.backend()), live_before);

    renderer.render_frame().unwrap();
    assert!(log.borrow().ends_with(&[
        "update a".to_string(),
        "update b".to_string(),
        "update c".to_string()
    ]));
}

#[test]
fn test_repeated_resize_does_not_leak() {
    let mut renderer = common::dummy_renderer(64, 64);
    renderer.bake_deferred(None).unwrap();
    renderer.render_frame().unwrap();
    let live = live_objects(renderer.backend());

    for _ in 0..3 {
        renderer.handle_resize(96, 96).unwrap();
        renderer.render_frame().unwrap();
    }
    assert_eq!(live_objects(renderer.backend()), live);
    assert_eq!(renderer.backend().swapchain_extent(), (96, 96));
}

// ============================================================================
// Built-in passes
// ============================================================================

#[test]
fn test_deferred_chain_commands() {
    init_logging();
    let (mut backend, mut exec) = dummy_setup(64, 48);
    let mut graph = RenderGraph::new();
    let geometry = graph.add_node(GeometryPass::new()).unwrap();
    let fxaa = graph.add_node(FxaaPass::new()).unwrap();
    let blit = graph.add_node(FinalBlitPass::new()).unwrap();
    graph
        .connect(GeometryPass::LIT, FxaaPass::COLOR, geometry, fxaa)
        .unwrap();
    graph
        .connect(FxaaPass::ANTI_ALIASED, FinalBlitPass::IMAGE, fxaa, blit)
        .unwrap();
    graph.bake(blit, &mut backend, &mut exec).unwrap();

    let lit = graph.output_image(geometry, GeometryPass::LIT.index()).unwrap();
    let anti_aliased = graph
        .output_image(fxaa, FxaaPass::ANTI_ALIASED.index())
        .unwrap();

    let mut frames = Vec::new();
    for _ in 0..2 {
        backend.begin_frame().unwrap();
        graph.update(&mut backend, &mut exec).unwrap();
        let swapchain = backend.swapchain_image().handle;
        frames.push((swapchain, backend.frame_commands().to_vec()));
        backend.end_frame().unwrap();
        backend.present().unwrap();
    }

    for (i, (swapchain, commands)) in frames.iter().enumerate() {
        // the fxaa output starts undefined only on the first frame
        let previous = if i == 0 {
            ImageLayout::Undefined
        } else {
            ImageLayout::TransferSrc
        };
        assert!(commands.contains(&Command::Transition {
            image: anti_aliased.handle,
            from: previous,
            to: ImageLayout::ColorAttachment,
        }));
        // fxaa samples the lit image in the layout geometry left it in
        assert!(commands.contains(&Command::Transition {
            image: lit.handle,
            from: ImageLayout::ColorAttachment,
            to: ImageLayout::ShaderReadOnly,
        }));
        assert!(!commands.iter().any(|c| matches!(
            c,
            Command::Transition { image, from: ImageLayout::ShaderReadOnly, .. } if *image == lit.handle
        )));

        let tail = &commands[commands.len() - 3..];
        assert_eq!(
            tail,
            &[
                Command::Transition {
                    image: *swapchain,
                    from: ImageLayout::Undefined,
                    to: ImageLayout::TransferDst,
                },
                Command::Blit {
                    src: anti_aliased.handle,
                    dst: *swapchain,
                },
                Command::Transition {
                    image: *swapchain,
                    from: ImageLayout::TransferDst,
                    to: ImageLayout::PresentSrc,
                },
            ]
        );
    }
    assert_ne!(frames[0].0, frames[1].0);
}

#[test]
fn test_free_releases_every_pass_object() {
    let (mut backend, mut exec) = dummy_setup(64, 48);
    let baseline = live_objects(&backend);
    let mut graph = RenderGraph::new();
    let geometry = graph.add_node(GeometryPass::new()).unwrap();
    let fxaa = graph.add_node(FxaaPass::new()).unwrap();
    let blit = graph.add_node(FinalBlitPass::new()).unwrap();
    graph
        .connect(GeometryPass::LIT, FxaaPass::COLOR, geometry, fxaa)
        .unwrap();
    graph
        .connect(FxaaPass::ANTI_ALIASED, FinalBlitPass::IMAGE, fxaa, blit)
        .unwrap();
    graph.bake(blit, &mut backend, &mut exec).unwrap();
    assert!(live_objects(&backend) > baseline);

    backend.wait_idle().unwrap();
    graph.free(&mut backend, &mut exec).unwrap();
    assert_eq!(live_objects(&backend), baseline);
    for id in [geometry, fxaa, blit] {
        assert_eq!(graph.node_state(id), Some(NodeState::Freed));
    }

    // second free is a no-op
    graph.free(&mut backend, &mut exec).unwrap();
    exec.destroy(&mut backend).unwrap();
    assert_eq!(live_objects(&backend), 0);
}

// ============================================================================
// Failed init
// ============================================================================

#[test]
fn test_failed_init_releases_outputs() {
    init_logging();
    let (mut backend, mut exec) = dummy_setup(64, 64);
    let baseline = live_objects(&backend);
    let log = call_log();
    let mut graph = RenderGraph::new();
    let a = graph.add_node(RecordingPass::new("a", 0, 1, &log)).unwrap();
    let b = graph.add_node(FailingPass::new(1, 2)).unwrap();
    graph.connect(out(0), input(0), a, b).unwrap();

    assert!(matches!(
        graph.bake(b, &mut backend, &mut exec),
        Err(GraphError::Backend(BackendError::OutOfMemory))
    ));
    assert_eq!(graph.node_state(a), Some(NodeState::Initialized));
    assert_eq!(graph.node_state(b), Some(NodeState::Unbaked));
    assert!(matches!(
        graph.output_image(b, 0),
        Err(GraphError::MissingOutput { .. })
    ));
    // only the producer's output is left
    assert_eq!(live_objects(&backend), baseline + 1);

    graph.free(&mut backend, &mut exec).unwrap();
    assert_eq!(live_objects(&backend), baseline);
    assert_eq!(*log.borrow(), vec!["init a", "free a"]);
    assert_eq!(graph.node_state(b), Some(NodeState::Unbaked));
}
