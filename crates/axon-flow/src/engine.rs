//! Node registry and graph orchestration
//!
//! The engine instantiates nodes, records the edges wired between their
//! ports, validates the graph (no cycles, single-bound inputs) and launches
//! every node's loop on its context. Execution is driven by input readiness,
//! so starting all loops activates the whole graph; stop propagates through
//! the context's stop token.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use log::info;
use thiserror::Error;

use axon_core::CancellationToken;
use axon_reactor::{Context, ContextConfig, ReactorError, StopHandle};

use crate::input::TypedInput;
use crate::node::{drive, Node};
use crate::output::Output;

/// Engine construction parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub context: ContextConfig,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains a cycle through node '{0}'")]
    Cycle(String),

    #[error("input on node '{0}' is already bound to another output")]
    InputAlreadyBound(String),

    #[error("graph is already running; edges are immutable after start")]
    AlreadyStarted,

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

/// Owner handle for a registered node, used to wire ports before start.
pub struct NodeHandle<N> {
    id: usize,
    node: Rc<RefCell<N>>,
}

impl<N> Clone for NodeHandle<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: Rc::clone(&self.node),
        }
    }
}

impl<N> NodeHandle<N> {
    pub fn borrow(&self) -> Ref<'_, N> {
        self.node.borrow()
    }

    /// Mutable access for initialisation before the graph starts. Panics if
    /// used while the node's loop is live.
    pub fn borrow_mut(&self) -> RefMut<'_, N> {
        self.node.borrow_mut()
    }
}

struct NodeRecord {
    name: String,
    launch: Option<Box<dyn FnOnce(&Context)>>,
}

/// Registry of nodes plus the context their loops run on.
pub struct NodeEngine {
    context: Context,
    nodes: RefCell<Vec<NodeRecord>>,
    edges: RefCell<Vec<(usize, usize)>>,
    started: Cell<bool>,
}

impl NodeEngine {
    pub fn new(config: EngineConfig) -> Result<Self, GraphError> {
        Ok(Self {
            context: Context::new(config.context)?,
            nodes: RefCell::new(Vec::new()),
            edges: RefCell::new(Vec::new()),
            started: Cell::new(false),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.context.stop_token()
    }

    /// Sendable handle for stopping the engine from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.context.stop_handle()
    }

    pub fn request_stop(&self) {
        self.context.request_stop();
    }

    /// Register a node. Its loop starts when [`NodeEngine::run`] is called.
    pub fn create_node<N: Node>(&self, node: N) -> NodeHandle<N> {
        let id = self.nodes.borrow().len();
        let node = Rc::new(RefCell::new(node));
        let name = node.borrow().name().to_string();
        let for_launch = Rc::clone(&node);
        self.nodes.borrow_mut().push(NodeRecord {
            name,
            launch: Some(Box::new(move |ctx: &Context| {
                ctx.spawn(drive(for_launch, ctx.clone()));
            })),
        });
        NodeHandle { id, node }
    }

    /// Wire `output` on `src` to `input` on `dst`.
    ///
    /// An output may fan out to many inputs; an input accepts exactly one
    /// binding. Edges are rejected once the graph has started.
    pub fn connect<T: Clone, A: Node, B: Node>(
        &self,
        src: &NodeHandle<A>,
        output: &Output<T>,
        dst: &NodeHandle<B>,
        input: &TypedInput<T>,
    ) -> Result<(), GraphError> {
        if self.started.get() {
            return Err(GraphError::AlreadyStarted);
        }
        if !input.mark_bound() {
            return Err(GraphError::InputAlreadyBound(
                self.nodes.borrow()[dst.id].name.clone(),
            ));
        }
        output.connect_to(input);
        self.edges.borrow_mut().push((src.id, dst.id));
        Ok(())
    }

    /// Launch every node's loop and drive the context until stopped.
    pub fn run(&self) -> Result<(), GraphError> {
        if self.started.replace(true) {
            return Err(GraphError::AlreadyStarted);
        }
        self.validate_acyclic()?;

        {
            let mut nodes = self.nodes.borrow_mut();
            info!("starting graph with {} nodes", nodes.len());
            for record in nodes.iter_mut() {
                let launch = record.launch.take().expect("node launched twice");
                launch(&self.context);
            }
        }
        self.context.run();
        info!("graph stopped");
        Ok(())
    }

    /// Feedback loops would deadlock the readiness-driven loops, so the
    /// graph must be a DAG.
    fn validate_acyclic(&self) -> Result<(), GraphError> {
        let nodes = self.nodes.borrow();
        let edges = self.edges.borrow();
        let mut adjacency = vec![Vec::new(); nodes.len()];
        for &(src, dst) in edges.iter() {
            adjacency[src].push(dst);
        }

        // Iterative DFS with three colours.
        const UNSEEN: u8 = 0;
        const ACTIVE: u8 = 1;
        const DONE: u8 = 2;
        let mut state = vec![UNSEEN; nodes.len()];
        for root in 0..nodes.len() {
            if state[root] != UNSEEN {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            state[root] = ACTIVE;
            loop {
                let Some(frame) = stack.last_mut() else { break };
                let (vertex, next) = *frame;
                if next < adjacency[vertex].len() {
                    frame.1 += 1;
                    let child = adjacency[vertex][next];
                    match state[child] {
                        ACTIVE => {
                            return Err(GraphError::Cycle(nodes[child].name.clone()));
                        }
                        UNSEEN => {
                            state[child] = ACTIVE;
                            stack.push((child, 0));
                        }
                        _ => {}
                    }
                } else {
                    state[vertex] = DONE;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}
