//! Render graph definition and baking

use crate::backend::{ImageRef, RenderBackend};
use crate::error::{GraphError, GraphResult};
use crate::render_graph::context::ExecutionContext;
use crate::render_graph::node::{NodeOutputs, NodeState, PassContext, RenderPass, ResolvedInput};
use crate::render_graph::port::PortId;
use crate::MAX_NODE_PORTS;

/// Unique identifier for a node in a render graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where an input port reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputSlot {
    owner: NodeId,
    index: u32,
}

struct Node<B: RenderBackend> {
    pass: Box<dyn RenderPass<B>>,
    inputs: Vec<Option<InputSlot>>,
    outputs: NodeOutputs,
    state: NodeState,
}

/// Lifecycle callback to invoke on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Callback {
    Init,
    Update,
    Resize,
    Free,
}

impl Callback {
    fn name(self) -> &'static str {
        match self {
            Callback::Init => "init",
            Callback::Update => "update",
            Callback::Resize => "resize",
            Callback::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// The main render graph structure
///
/// Nodes live in an arena indexed by [`NodeId`]. `bake` fixes the execution
/// order once; `update`, `resize` and `free` then walk that order.
pub struct RenderGraph<B: RenderBackend> {
    nodes: Vec<Node<B>>,
    order: Vec<NodeId>,
    baked: bool,
}

impl<B: RenderBackend> RenderGraph<B> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            order: Vec::new(),
            baked: false,
        }
    }

    /// Add a pass to the graph
    pub fn add_node<P: RenderPass<B> + 'static>(&mut self, pass: P) -> GraphResult<NodeId> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        let id = NodeId(self.nodes.len() as u32);
        let input_count = pass.input_count();
        let output_count = pass.output_count();
        if input_count > MAX_NODE_PORTS {
            return Err(GraphError::PortOutOfRange {
                node: id,
                port: PortId::input(input_count),
            });
        }
        if output_count > MAX_NODE_PORTS {
            return Err(GraphError::PortOutOfRange {
                node: id,
                port: PortId::output(output_count),
            });
        }

        self.nodes.push(Node {
            pass: Box::new(pass),
            inputs: vec![None; input_count as usize],
            outputs: NodeOutputs::new(id, output_count),
            state: NodeState::Unbaked,
        });
        Ok(id)
    }

    fn node(&self, id: NodeId) -> GraphResult<&Node<B>> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    /// Connect output `src_port` of `src` to input `dst_port` of `dst`.
    ///
    /// Connecting an input that is already connected replaces the old link.
    pub fn connect(
        &mut self,
        src_port: PortId,
        dst_port: PortId,
        src: NodeId,
        dst: NodeId,
    ) -> GraphResult<()> {
        if !src_port.is_output() || !dst_port.is_input() {
            return Err(GraphError::InvalidPortDirection {
                src: src_port,
                dst: dst_port,
            });
        }
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        let src_outputs = self.node(src)?.outputs.len();
        self.node(dst)?;
        if src == dst {
            return Err(GraphError::SelfConnection(src));
        }
        if src_port.index() as usize >= src_outputs {
            return Err(GraphError::PortOutOfRange {
                node: src,
                port: src_port,
            });
        }

        let dst_node = &mut self.nodes[dst.index()];
        let slot = dst_node
            .inputs
            .get_mut(dst_port.index() as usize)
            .ok_or(GraphError::PortOutOfRange {
                node: dst,
                port: dst_port,
            })?;
        *slot = Some(InputSlot {
            owner: src,
            index: src_port.index(),
        });
        Ok(())
    }

    /// Fix the execution order from `terminal` backward and init every node in it.
    ///
    /// Only nodes reachable from `terminal` through inputs take part. Every
    /// declared input of a reachable node must be connected, and the
    /// connections must not form a cycle.
    pub fn bake(
        &mut self,
        terminal: NodeId,
        backend: &mut B,
        exec: &mut ExecutionContext,
    ) -> GraphResult<()> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        self.node(terminal)?;

        self.order = self.topological_order(terminal)?;
        self.baked = true;

        let names: Vec<&str> = self
            .order
            .iter()
            .map(|id| self.nodes[id.index()].pass.name())
            .collect();
        log::info!("Baked render graph: {}", names.join(" -> "));

        for i in 0..self.order.len() {
            let id = self.order[i];
            self.run(id, backend, exec, Callback::Init)?;
        }
        Ok(())
    }

    /// Iterative depth-first walk over inputs, post-order.
    fn topological_order(&self, terminal: NodeId) -> GraphResult<Vec<NodeId>> {
        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut order = Vec::new();
        // (node, next input to visit)
        let mut stack = vec![(terminal, 0usize)];
        marks[terminal.index()] = Mark::Gray;

        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let node = &self.nodes[id.index()];

            if next < node.inputs.len() {
                top.1 += 1;
                let slot = node.inputs[next].ok_or(GraphError::UnconnectedInput {
                    node: id,
                    index: next as u32,
                })?;
                match marks[slot.owner.index()] {
                    Mark::White => {
                        marks[slot.owner.index()] = Mark::Gray;
                        stack.push((slot.owner, 0));
                    }
                    Mark::Gray => {
                        return Err(GraphError::CyclicDependency { node: slot.owner });
                    }
                    Mark::Black => {}
                }
            } else {
                marks[id.index()] = Mark::Black;
                order.push(id);
                stack.pop();
            }
        }
        Ok(order)
    }

    fn resolve_inputs(&self, id: NodeId) -> GraphResult<Vec<Option<ResolvedInput>>> {
        self.nodes[id.index()]
            .inputs
            .iter()
            .map(|slot| match slot {
                Some(slot) => self.nodes[slot.owner.index()]
                    .outputs
                    .resolve(slot.index)
                    .map(Some),
                None => Ok(None),
            })
            .collect()
    }

    /// Invoke one lifecycle callback of `id`, enforcing the state machine.
    fn run(
        &mut self,
        id: NodeId,
        backend: &mut B,
        exec: &mut ExecutionContext,
        callback: Callback,
    ) -> GraphResult<()> {
        let state = self.nodes[id.index()].state;
        let allowed = match callback {
            Callback::Init => state == NodeState::Unbaked,
            _ => state.is_live(),
        };
        if !allowed {
            return Err(GraphError::InvalidState {
                node: id,
                state,
                operation: callback.name(),
            });
        }

        // producers earlier in the order have already released their outputs
        let inputs = match callback {
            Callback::Free => self
                .resolve_inputs(id)
                .unwrap_or_else(|_| vec![None; self.nodes[id.index()].inputs.len()]),
            _ => self.resolve_inputs(id)?,
        };
        let node = &mut self.nodes[id.index()];
        let mut ctx = PassContext {
            backend: &mut *backend,
            exec,
            outputs: &mut node.outputs,
            node: id,
            inputs: &inputs,
        };

        match callback {
            Callback::Init => {
                log::debug!("Initializing node {}", node.pass.name());
                if let Err(e) = node.pass.init(&mut ctx) {
                    // a node left Unbaked is skipped by `free`
                    node.outputs.free_all(backend)?;
                    return Err(e);
                }
                node.state = NodeState::Initialized;
            }
            Callback::Update => node.pass.update(&mut ctx)?,
            Callback::Resize => {
                node.pass.resize(&mut ctx)?;
                node.state = NodeState::Resized;
            }
            Callback::Free => {
                log::debug!("Freeing node {}", node.pass.name());
                node.pass.free(&mut ctx)?;
                node.outputs.free_all(backend)?;
                node.state = NodeState::Freed;
            }
        }
        Ok(())
    }

    /// Upload the context's camera and lights, then record every node.
    pub fn update(&mut self, backend: &mut B, exec: &mut ExecutionContext) -> GraphResult<()> {
        if !self.baked {
            return Err(GraphError::NotBaked);
        }
        exec.upload(backend)?;
        for i in 0..self.order.len() {
            let id = self.order[i];
            self.run(id, backend, exec, Callback::Update)?;
        }
        Ok(())
    }

    /// Let every node reallocate for the context's current extent.
    pub fn resize(&mut self, backend: &mut B, exec: &mut ExecutionContext) -> GraphResult<()> {
        if !self.baked {
            return Err(GraphError::NotBaked);
        }
        log::info!("Resizing render graph to {}x{}", exec.width(), exec.height());
        for i in 0..self.order.len() {
            let id = self.order[i];
            self.run(id, backend, exec, Callback::Resize)?;
        }
        Ok(())
    }

    /// Free every live node in baked order. Nodes never initialized or already
    /// freed are skipped.
    pub fn free(&mut self, backend: &mut B, exec: &mut ExecutionContext) -> GraphResult<()> {
        for i in 0..self.order.len() {
            let id = self.order[i];
            if self.nodes[id.index()].state.is_live() {
                self.run(id, backend, exec, Callback::Free)?;
            }
        }
        Ok(())
    }

    /// The image an input of `node` currently resolves to.
    pub fn input_image(&self, node: NodeId, input: u32) -> GraphResult<ImageRef> {
        let slot = self
            .node(node)?
            .inputs
            .get(input as usize)
            .copied()
            .flatten()
            .ok_or(GraphError::UnconnectedInput { node, index: input })?;
        self.node(slot.owner)?.outputs.image_ref(slot.index)
    }

    pub fn output_image(&self, node: NodeId, output: u32) -> GraphResult<ImageRef> {
        self.node(node)?.outputs.image_ref(output)
    }

    pub fn output_generation(&self, node: NodeId, output: u32) -> GraphResult<u32> {
        self.node(node)?
            .outputs
            .generation(output)
            .ok_or(GraphError::MissingOutput {
                node,
                index: output,
            })
    }

    /// Producer node and output index behind an input, if connected.
    pub fn connection(&self, node: NodeId, input: u32) -> Option<(NodeId, u32)> {
        self.nodes
            .get(node.index())?
            .inputs
            .get(input as usize)
            .copied()
            .flatten()
            .map(|slot| (slot.owner, slot.index))
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn is_baked(&self) -> bool {
        self.baked
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id.index()).map(|node| node.pass.name())
    }

    pub fn node_state(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(id.index()).map(|node| node.state)
    }
}

impl<B: RenderBackend> Default for RenderGraph<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::{ImageDesc, ImageUsage};
    use crate::render_graph::context::ContextLimits;
    use ash::vk;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct TestPass {
        name: &'static str,
        inputs: u32,
        outputs: u32,
        log: Log,
    }

    impl TestPass {
        fn new(name: &'static str, inputs: u32, outputs: u32, log: &Log) -> Self {
            Self {
                name,
                inputs,
                outputs,
                log: log.clone(),
            }
        }
    }

    impl RenderPass<DummyBackend> for TestPass {
        fn name(&self) -> &str {
            self.name
        }

        fn input_count(&self) -> u32 {
            self.inputs
        }

        fn output_count(&self) -> u32 {
            self.outputs
        }

        fn init(&mut self, ctx: &mut PassContext<'_, DummyBackend>) -> GraphResult<()> {
            for i in 0..self.inputs {
                ctx.input(i)?;
            }
            let (width, height) = ctx.extent();
            for i in 0..self.outputs {
                let desc = ImageDesc::new_2d(
                    width,
                    height,
                    vk::Format::R8G8B8A8_UNORM,
                    ImageUsage::RENDER_TARGET,
                );
                ctx.outputs.allocate(ctx.backend, i, &desc)?;
            }
            self.log.borrow_mut().push(format!("init {}", self.name));
            Ok(())
        }

        fn update(&mut self, _ctx: &mut PassContext<'_, DummyBackend>) -> GraphResult<()> {
            self.log.borrow_mut().push(format!("update {}", self.name));
            Ok(())
        }

        fn resize(&mut self, ctx: &mut PassContext<'_, DummyBackend>) -> GraphResult<()> {
            let (width, height) = ctx.extent();
            for i in 0..self.outputs {
                ctx.outputs.resize(ctx.backend, i, width, height)?;
            }
            Ok(())
        }

        fn free(&mut self, _ctx: &mut PassContext<'_, DummyBackend>) -> GraphResult<()> {
            self.log.borrow_mut().push(format!("free {}", self.name));
            Ok(())
        }
    }

    fn setup() -> (DummyBackend, ExecutionContext, Log) {
        let mut backend = DummyBackend::new(64, 64);
        let exec = ExecutionContext::new(&mut backend, 64, 64, ContextLimits::default()).unwrap();
        (backend, exec, Rc::new(RefCell::new(Vec::new())))
    }

    #[test]
    fn test_connect_direction() {
        let (_, _, log) = setup();
        let mut graph = RenderGraph::<DummyBackend>::new();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 0, &log)).unwrap();

        assert!(matches!(
            graph.connect(PortId::input(0), PortId::input(0), a, b),
            Err(GraphError::InvalidPortDirection { .. })
        ));
        assert!(matches!(
            graph.connect(PortId::output(0), PortId::output(0), a, b),
            Err(GraphError::InvalidPortDirection { .. })
        ));
        assert!(matches!(
            graph.connect(PortId::output(1), PortId::input(0), a, b),
            Err(GraphError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            graph.connect(PortId::output(0), PortId::input(3), a, b),
            Err(GraphError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            graph.connect(PortId::output(0), PortId::input(0), a, a),
            Err(GraphError::SelfConnection(_))
        ));
        assert!(matches!(
            graph.connect(PortId::output(0), PortId::input(0), a, NodeId(9)),
            Err(GraphError::UnknownNode(NodeId(9)))
        ));
        graph
            .connect(PortId::output(0), PortId::input(0), a, b)
            .unwrap();
        assert_eq!(graph.connection(b, 0), Some((a, 0)));
    }

    #[test]
    fn test_bake_orders_producers_first() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let c = graph.add_node(TestPass::new("c", 1, 0, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 1, &log)).unwrap();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), b, c).unwrap();

        graph.bake(c, &mut backend, &mut exec).unwrap();
        assert_eq!(graph.order(), &[a, b, c]);
        assert_eq!(*log.borrow(), vec!["init a", "init b", "init c"]);
        assert_eq!(graph.node_state(b), Some(NodeState::Initialized));
    }

    #[test]
    fn test_diamond_visits_shared_producer_once() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let src = graph.add_node(TestPass::new("src", 0, 1, &log)).unwrap();
        let left = graph.add_node(TestPass::new("left", 1, 1, &log)).unwrap();
        let right = graph.add_node(TestPass::new("right", 1, 1, &log)).unwrap();
        let sink = graph.add_node(TestPass::new("sink", 2, 0, &log)).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), src, left).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), src, right).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), left, sink).unwrap();
        graph.connect(PortId::output(0), PortId::input(1), right, sink).unwrap();

        graph.bake(sink, &mut backend, &mut exec).unwrap();
        assert_eq!(graph.order(), &[src, left, right, sink]);
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let a = graph.add_node(TestPass::new("a", 1, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 1, &log)).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), b, a).unwrap();

        let err = graph.bake(b, &mut backend, &mut exec).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
        assert!(log.borrow().is_empty());
        assert!(!graph.is_baked());
    }

    #[test]
    fn test_unconnected_input_rejected() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 2, 0, &log)).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        let err = graph.bake(b, &mut backend, &mut exec).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnconnectedInput { node, index: 1 } if node == b
        ));
    }

    #[test]
    fn test_lifecycle_order_and_single_free() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 0, &log)).unwrap();

        assert!(matches!(
            graph.update(&mut backend, &mut exec),
            Err(GraphError::NotBaked)
        ));
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        graph.bake(b, &mut backend, &mut exec).unwrap();
        assert!(matches!(
            graph.add_node(TestPass::new("late", 0, 0, &log)),
            Err(GraphError::AlreadyBaked)
        ));

        backend.begin_frame().unwrap();
        graph.update(&mut backend, &mut exec).unwrap();
        backend.end_frame().unwrap();
        backend.present().unwrap();

        graph.free(&mut backend, &mut exec).unwrap();
        graph.free(&mut backend, &mut exec).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["init a", "init b", "update a", "update b", "free a", "free b"]
        );
        assert_eq!(backend.live_images(), 0);
        assert!(matches!(
            graph.update(&mut backend, &mut exec),
            Err(GraphError::InvalidState {
                state: NodeState::Freed,
                ..
            })
        ));
    }

    #[test]
    fn test_input_image_resolves_producer_output() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 0, &log)).unwrap();
        assert!(graph.input_image(b, 0).is_err());
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        graph.bake(b, &mut backend, &mut exec).unwrap();

        let input = graph.input_image(b, 0).unwrap();
        assert_eq!(input, graph.output_image(a, 0).unwrap());

        exec.set_extent(32, 16);
        graph.resize(&mut backend, &mut exec).unwrap();
        let resized = graph.input_image(b, 0).unwrap();
        assert_eq!((resized.width, resized.height), (32, 16));
        assert_eq!(graph.output_generation(a, 0).unwrap(), 2);
    }

    #[test]
    fn test_resize_moves_nodes_to_resized() {
        let (mut backend, mut exec, log) = setup();
        let mut graph = RenderGraph::new();
        let a = graph.add_node(TestPass::new("a", 0, 1, &log)).unwrap();
        let b = graph.add_node(TestPass::new("b", 1, 0, &log)).unwrap();
        graph.connect(PortId::output(0), PortId::input(0), a, b).unwrap();
        graph.bake(b, &mut backend, &mut exec).unwrap();
        assert!(NodeState::Initialized.is_live());

        for extent in [(32, 32), (48, 16)] {
            exec.set_extent(extent.0, extent.1);
            graph.resize(&mut backend, &mut exec).unwrap();
            assert_eq!(graph.node_state(a), Some(NodeState::Resized));
            assert_eq!(graph.node_state(b), Some(NodeState::Resized));
        }

        backend.begin_frame().unwrap();
        graph.update(&mut backend, &mut exec).unwrap();
        backend.end_frame().unwrap();
        backend.present().unwrap();

        graph.free(&mut backend, &mut exec).unwrap();
        assert_eq!(graph.node_state(a), Some(NodeState::Freed));
        assert_eq!(backend.live_images(), 0);
        assert!(!NodeState::Freed.is_live());
    }
}
