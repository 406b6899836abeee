//! Dataflow nodes and the stage scheduler.
//!
//! Every operator that forces the pending transformation chain becomes a
//! node in the worker-local DAG. A node is one of four families (source,
//! local op, distributed op, action) but the scheduler only sees the
//! object-safe [`DiaNode`] lifecycle: `execute` (collectives and shuffles
//! after all pre-ops ran), `push_data` (replay produced items into one
//! child's registered callback), `dispose` (drop storage). States progress
//! `New → Executing → Executed → Disposed`.
//!
//! The graph holds strong child→parent references; parents hold only the
//! type-erased push callbacks their children registered, keyed by child
//! id. Triggering an action collects the `New` nodes reachable backward in
//! topological order and runs each exactly once: parents replay their data
//! into the node's pre-op callbacks, then the node executes. A parent whose
//! children have all been served is disposed unless it is a cache/collapse
//! node; re-reading a disposed node is a logic error.

use crate::api::context::Context;
use crate::common::NodeId;
use crate::data::File;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::debug;

/// Lifecycle state of a node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeState {
    New,
    Executing,
    Executed,
    Disposed,
}

/// Object-safe lifecycle interface the scheduler drives.
pub trait DiaNode {
    fn id(&self) -> NodeId;
    fn label(&self) -> &'static str;
    fn state(&self) -> NodeState;
    fn set_state(&self, state: NodeState);
    fn parents(&self) -> Vec<Rc<dyn DiaNode>>;
    /// Cache/collapse nodes keep their storage across actions.
    fn keep_data(&self) -> bool;
    fn execute(&self) -> Result<()>;
    fn push_data(&self, child: NodeId, consume: bool) -> Result<()>;
    fn dispose(&self);
    fn num_children(&self) -> usize;
    fn children_served(&self) -> usize;
    fn note_child_served(&self);
}

/// What concrete nodes actually implement; the blanket impl below derives
/// the full [`DiaNode`] surface from it.
pub(crate) trait NodeImpl: 'static {
    type Out: 'static;

    fn base(&self) -> &NodeBase<Self::Out>;
    fn execute_impl(&self) -> Result<()>;
    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()>;

    fn dispose_impl(&self) {}

    fn keep(&self) -> bool {
        false
    }
}

impl<N: NodeImpl> DiaNode for N {
    fn id(&self) -> NodeId {
        self.base().id
    }

    fn label(&self) -> &'static str {
        self.base().label
    }

    fn state(&self) -> NodeState {
        self.base().state.get()
    }

    fn set_state(&self, state: NodeState) {
        self.base().state.set(state);
    }

    fn parents(&self) -> Vec<Rc<dyn DiaNode>> {
        self.base().parents.clone()
    }

    fn keep_data(&self) -> bool {
        self.keep()
    }

    fn execute(&self) -> Result<()> {
        self.execute_impl()
    }

    fn push_data(&self, child: NodeId, consume: bool) -> Result<()> {
        self.push_data_impl(child, consume)
    }

    fn dispose(&self) {
        self.dispose_impl();
    }

    fn num_children(&self) -> usize {
        self.base().children.borrow().len()
    }

    fn children_served(&self) -> usize {
        self.base().served.get()
    }

    fn note_child_served(&self) {
        self.base().served.set(self.base().served.get() + 1);
    }
}

struct ChildSlot<O> {
    child: NodeId,
    sink: Box<dyn FnMut(O)>,
    /// How many times this slot has been replayed; when one child
    /// registered several callbacks (a node zipped or merged with
    /// itself), successive pushes round-robin over the slots.
    pushes: usize,
}

/// Shared bookkeeping embedded in every concrete node: identity, state,
/// parent references and the child push callbacks.
pub(crate) struct NodeBase<O> {
    id: NodeId,
    label: &'static str,
    state: Cell<NodeState>,
    parents: Vec<Rc<dyn DiaNode>>,
    children: RefCell<Vec<ChildSlot<O>>>,
    served: Cell<usize>,
}

impl<O: 'static> NodeBase<O> {
    pub fn new(id: NodeId, label: &'static str, parents: Vec<Rc<dyn DiaNode>>) -> Self {
        NodeBase {
            id,
            label,
            state: Cell::new(NodeState::New),
            parents,
            children: RefCell::new(Vec::new()),
            served: Cell::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn add_child(&self, child: NodeId, sink: Box<dyn FnMut(O)>) {
        self.children.borrow_mut().push(ChildSlot {
            child,
            sink,
            pushes: 0,
        });
    }

    /// Run `produce` with an emit function feeding one child's callback.
    /// When the child registered several callbacks, the least-replayed one
    /// is chosen.
    pub fn push_with(
        &self,
        child: NodeId,
        produce: impl FnOnce(&mut dyn FnMut(O)) -> Result<()>,
    ) -> Result<()> {
        let mut children = self.children.borrow_mut();
        let slot = children
            .iter_mut()
            .filter(|s| s.child == child)
            .min_by_key(|s| s.pushes)
            .ok_or_else(|| Error::Logic(format!("no callback registered for child {child:?}")))?;
        slot.pushes += 1;
        produce(&mut |item| (slot.sink)(item))
    }

    /// Replay a stored file into one child's callback, optionally
    /// releasing blocks as they are read.
    pub fn push_file(&self, file: &File, child: NodeId, consume: bool) -> Result<()>
    where
        O: DeserializeOwned,
    {
        self.push_with(child, |emit| {
            if consume {
                let mut reader = file.consume_reader();
                while reader.has_next()? {
                    emit(reader.next()?);
                }
            } else {
                let mut reader = file.reader();
                while reader.has_next()? {
                    emit(reader.next()?);
                }
            }
            Ok(())
        })
    }
}

/// Registration closure a `Dia<T>` uses to wire a fused per-item chain
/// onto its node for a new child.
pub(crate) type AttachFn<T> = Rc<dyn Fn(NodeId, Box<dyn FnMut(T)>)>;

/// The identity attach of a freshly forced node: registers the child sink
/// directly, with no pending transformations in between.
pub(crate) fn identity_attach<N>(node: &Rc<N>) -> AttachFn<N::Out>
where
    N: NodeImpl,
{
    let node = Rc::clone(node);
    Rc::new(move |child, sink| node.base().add_child(child, sink))
}

/// First error recorded inside a pre-op callback; surfaced when the node
/// executes.
#[derive(Clone, Default)]
pub(crate) struct ErrorSlot(Rc<RefCell<Option<Error>>>);

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, e: Error) {
        let mut slot = self.0.borrow_mut();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// Propagate the stored error, if any.
    pub fn take(&self) -> Result<()> {
        match self.0.borrow_mut().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run the stage containing `target`: every `New` node reachable backward,
/// in topological order, exactly once.
pub(crate) fn run_scope(ctx: &Context, target: &Rc<dyn DiaNode>) -> Result<()> {
    let mut topo: Vec<Rc<dyn DiaNode>> = Vec::new();
    let mut visited = HashSet::new();
    collect(target, &mut topo, &mut visited)?;

    for node in topo {
        debug!(id = ?node.id(), label = node.label(), "executing node");
        node.set_state(NodeState::Executing);
        for parent in node.parents() {
            match parent.state() {
                NodeState::Executed => {}
                NodeState::Disposed => {
                    return Err(at(ctx, parent.label(), Error::Logic(
                        "reading a consumed DIA; cache() or collapse() it first".into(),
                    )));
                }
                other => {
                    return Err(at(ctx, parent.label(), Error::Logic(format!(
                        "parent scheduled out of order (state {other:?})"
                    ))));
                }
            }
            // The last un-served child of a non-keep parent consumes its
            // storage while reading it.
            let consume =
                !parent.keep_data() && parent.children_served() + 1 >= parent.num_children();
            parent
                .push_data(node.id(), consume)
                .map_err(|e| at(ctx, parent.label(), e))?;
        }
        node.execute().map_err(|e| at(ctx, node.label(), e))?;
        node.set_state(NodeState::Executed);
        for parent in node.parents() {
            parent.note_child_served();
            if parent.children_served() >= parent.num_children() && !parent.keep_data() {
                parent.dispose();
                parent.set_state(NodeState::Disposed);
            }
        }
    }
    Ok(())
}

fn collect(
    node: &Rc<dyn DiaNode>,
    topo: &mut Vec<Rc<dyn DiaNode>>,
    visited: &mut HashSet<NodeId>,
) -> Result<()> {
    if node.state() != NodeState::New || visited.contains(&node.id()) {
        return Ok(());
    }
    visited.insert(node.id());
    for parent in node.parents() {
        if parent.state() == NodeState::Disposed {
            return Err(Error::Logic(
                "reading a consumed DIA; cache() or collapse() it first".into(),
            ));
        }
        collect(&parent, topo, visited)?;
    }
    topo.push(Rc::clone(node));
    Ok(())
}

fn at(ctx: &Context, operator: &str, e: Error) -> Error {
    match e {
        already @ Error::Worker { .. } => already,
        other => Error::Worker {
            rank: ctx.global_rank(),
            operator: operator.to_string(),
            source: Box::new(other),
        },
    }
}
