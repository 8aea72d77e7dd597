//! The media graph: nodes, ports, edges and their shared status cells.
//!
//! Entities live in id-keyed arenas with free-list reuse, so edges and
//! queue membership are plain small integers rather than pointers. An
//! edge is the pair of peer ports plus the single [`Cell`] they share;
//! the consumer endpoint writes the cell's status, both endpoints read
//! it.

use bitflags::bitflags;
use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u32 {
        /// The node decouples its edges from the running pump; required
        /// on at least one node of every feedback loop.
        const ASYNC = 1 << 0;
    }
}

/// Direction of a port, as seen from its owning node.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

/// Readiness of an edge, and the code a process callback reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    NeedBuffer,
    HaveBuffer,
    Error,
}

/// Scheduling state of a node; advanced by the scheduler only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    In,
    Out,
    CheckIn,
    CheckOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status record shared by the two endpoints of an edge.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cell {
    pub status: Status,
    pub buffer_id: u32,
}

#[derive(Debug)]
pub struct Port {
    pub node: NodeId,
    pub direction: Direction,
    pub peer: Option<PortId>,
    pub cell: Option<CellId>,
    optional: bool,
}

pub struct Node {
    pub name: String,
    pub flags: NodeFlags,
    pub(crate) state: NodeState,
    pub(crate) required_in: u32,
    pub(crate) ready_in: u32,
    pub(crate) queued: bool,
    inputs: Vec<PortId>,
    outputs: Vec<PortId>,
    hook: Option<Box<dyn Process>>,
}

impl Node {
    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn required_in(&self) -> u32 {
        self.required_in
    }

    pub fn ready_in(&self) -> u32 {
        self.ready_in
    }

    pub fn queued(&self) -> bool {
        self.queued
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("required_in", &self.required_in)
            .field("ready_in", &self.ready_in)
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}

/// The cells a process callback may read and write: those of its own
/// node's ports, positionally per direction. Unlinked ports yield `None`.
pub struct NodeIo<'a> {
    inputs: &'a [PortId],
    outputs: &'a [PortId],
    ports: &'a Slots<Port>,
    cells: &'a mut Slots<Cell>,
}

impl NodeIo<'_> {
    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn cell_of(&self, port: PortId) -> Option<u32> {
        self.ports.get(port.0).and_then(|p| p.cell).map(|c| c.0)
    }

    pub fn input(&self, i: usize) -> Option<&Cell> {
        let id = self.cell_of(*self.inputs.get(i)?)?;
        self.cells.get(id)
    }

    pub fn input_mut(&mut self, i: usize) -> Option<&mut Cell> {
        let id = self.cell_of(*self.inputs.get(i)?)?;
        self.cells.get_mut(id)
    }

    pub fn output(&self, i: usize) -> Option<&Cell> {
        let id = self.cell_of(*self.outputs.get(i)?)?;
        self.cells.get(id)
    }

    pub fn output_mut(&mut self, i: usize) -> Option<&mut Cell> {
        let id = self.cell_of(*self.outputs.get(i)?)?;
        self.cells.get_mut(id)
    }
}

/// Behavior of a node. Callbacks must not block; they report a
/// [`Status`] promptly and the scheduler decides what runs next.
pub trait Process {
    fn process_input(&mut self, io: &mut NodeIo<'_>) -> Status;
    fn process_output(&mut self, io: &mut NodeIo<'_>) -> Status;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    NoSuchNode,
    NoSuchPort,
    /// Node or port still has live edges, or is still queued.
    Busy,
    /// The two ports are not an output/input pair.
    DirectionMismatch,
    /// One of the ports already has a peer.
    AlreadyLinked,
    /// The port has no peer.
    NotLinked,
    /// The link would close a loop of purely synchronous nodes.
    WouldDeadlock,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::NoSuchNode => write!(f, "no such node"),
            GraphError::NoSuchPort => write!(f, "no such port"),
            GraphError::Busy => write!(f, "still in use"),
            GraphError::DirectionMismatch => write!(f, "port directions do not match"),
            GraphError::AlreadyLinked => write!(f, "port already linked"),
            GraphError::NotLinked => write!(f, "port not linked"),
            GraphError::WouldDeadlock => {
                write!(f, "link would close a fully synchronous cycle")
            }
        }
    }
}

impl Error for GraphError {}

// Arena with free-list slot reuse.
pub(crate) struct Slots<T> {
    items: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Default for Slots<T> {
    fn default() -> Slots<T> {
        Slots::new()
    }
}

impl<T> Slots<T> {
    fn new() -> Slots<T> {
        Slots {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(id) => {
                self.items[id as usize] = Some(value);
                id
            }
            None => {
                self.items.push(Some(value));
                (self.items.len() - 1) as u32
            }
        }
    }

    fn get(&self, id: u32) -> Option<&T> {
        self.items.get(id as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn remove(&mut self, id: u32) -> Option<T> {
        let value = self.items.get_mut(id as usize)?.take();
        if value.is_some() {
            self.free.push(id);
        }
        value
    }
}

/// Owns all nodes; nodes own their ports; edges own their cell.
#[derive(Default)]
pub struct Graph {
    nodes: Slots<Node>,
    ports: Slots<Port>,
    cells: Slots<Cell>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: Slots::new(),
            ports: Slots::new(),
            cells: Slots::new(),
        }
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        flags: NodeFlags,
        hook: Box<dyn Process>,
    ) -> NodeId {
        let name = name.into();
        let id = NodeId(self.nodes.insert(Node {
            name,
            flags,
            state: NodeState::CheckIn,
            required_in: 0,
            ready_in: 0,
            queued: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            hook: Some(hook),
        }));
        debug!(target: "graph", "node {} added", id);
        id
    }

    /// Fails with `Busy` while the node has linked ports or still sits
    /// in a ready queue.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.nodes.get(id.0).ok_or(GraphError::NoSuchNode)?;
        if node.queued {
            return Err(GraphError::Busy);
        }
        let all: Vec<PortId> = node.inputs.iter().chain(&node.outputs).copied().collect();
        if all
            .iter()
            .any(|p| self.ports.get(p.0).is_some_and(|p| p.peer.is_some()))
        {
            return Err(GraphError::Busy);
        }
        for p in all {
            self.ports.remove(p.0);
        }
        self.nodes.remove(id.0);
        debug!(target: "graph", "node {} removed", id);
        Ok(())
    }

    pub fn add_port(&mut self, node: NodeId, direction: Direction) -> Result<PortId, GraphError> {
        if self.nodes.get(node.0).is_none() {
            return Err(GraphError::NoSuchNode);
        }
        let id = PortId(self.ports.insert(Port {
            node,
            direction,
            peer: None,
            cell: None,
            optional: false,
        }));
        let n = self.nodes.get_mut(node.0).expect("checked above");
        match direction {
            Direction::Input => n.inputs.push(id),
            Direction::Output => n.outputs.push(id),
        }
        Ok(id)
    }

    pub fn remove_port(&mut self, port: PortId) -> Result<(), GraphError> {
        let p = self.ports.get(port.0).ok_or(GraphError::NoSuchPort)?;
        if p.peer.is_some() {
            return Err(GraphError::Busy);
        }
        let (node, direction) = (p.node, p.direction);
        if let Some(n) = self.nodes.get_mut(node.0) {
            match direction {
                Direction::Input => n.inputs.retain(|x| *x != port),
                Direction::Output => n.outputs.retain(|x| *x != port),
            }
        }
        self.ports.remove(port.0);
        Ok(())
    }

    /// Connect an output port to an input port, allocating the shared
    /// status cell. A fresh edge starts in `NeedBuffer`: the consumer
    /// has not seen a buffer yet. The input's node gains one required
    /// input unless the port was marked optional.
    pub fn link(&mut self, out_port: PortId, in_port: PortId) -> Result<CellId, GraphError> {
        let out = self.ports.get(out_port.0).ok_or(GraphError::NoSuchPort)?;
        let inp = self.ports.get(in_port.0).ok_or(GraphError::NoSuchPort)?;
        if out.direction != Direction::Output || inp.direction != Direction::Input {
            return Err(GraphError::DirectionMismatch);
        }
        if out.peer.is_some() || inp.peer.is_some() {
            return Err(GraphError::AlreadyLinked);
        }
        let (out_node, in_node, optional) = (out.node, inp.node, inp.optional);
        if self.sync_path_exists(in_node, out_node) {
            return Err(GraphError::WouldDeadlock);
        }
        let cell = CellId(self.cells.insert(Cell {
            status: Status::NeedBuffer,
            buffer_id: 0,
        }));
        {
            let p = self.ports.get_mut(out_port.0).expect("checked above");
            p.peer = Some(in_port);
            p.cell = Some(cell);
        }
        {
            let p = self.ports.get_mut(in_port.0).expect("checked above");
            p.peer = Some(out_port);
            p.cell = Some(cell);
        }
        if !optional {
            self.nodes.get_mut(in_node.0).expect("port owner").required_in += 1;
        }
        debug!(
            target: "graph",
            "link {} -> {} cell {:?}",
            out_node, in_node, cell
        );
        Ok(cell)
    }

    /// Disconnect the edge through either of its endpoints.
    pub fn unlink(&mut self, port: PortId) -> Result<(), GraphError> {
        let p = self.ports.get(port.0).ok_or(GraphError::NoSuchPort)?;
        let peer = p.peer.ok_or(GraphError::NotLinked)?;
        let (a, b) = (port, peer);
        let cell = p.cell;
        let (in_port, _out_port) = if p.direction == Direction::Input {
            (a, b)
        } else {
            (b, a)
        };
        let (in_node, optional) = {
            let ip = self.ports.get(in_port.0).expect("peer exists");
            (ip.node, ip.optional)
        };
        for id in [a, b] {
            let p = self.ports.get_mut(id.0).expect("endpoints exist");
            p.peer = None;
            p.cell = None;
        }
        if let Some(cell) = cell {
            self.cells.remove(cell.0);
        }
        if !optional {
            let n = self.nodes.get_mut(in_node.0).expect("port owner");
            assert!(n.required_in > 0, "required_in underflow on node {in_node}");
            n.required_in -= 1;
        }
        Ok(())
    }

    /// Opt a linked input out of the firing requirement.
    pub fn mark_optional(&mut self, port: PortId) -> Result<(), GraphError> {
        let p = self.ports.get(port.0).ok_or(GraphError::NoSuchPort)?;
        if p.direction != Direction::Input {
            return Err(GraphError::DirectionMismatch);
        }
        if p.optional {
            return Ok(());
        }
        let (node, linked) = (p.node, p.peer.is_some());
        self.ports.get_mut(port.0).expect("checked above").optional = true;
        if linked {
            let n = self.nodes.get_mut(node.0).expect("port owner");
            assert!(n.required_in > 0, "required_in underflow on node {node}");
            n.required_in -= 1;
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(id.0)
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id.0)
    }

    pub fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.get_mut(id.0)
    }

    pub fn port_cell(&self, port: PortId) -> Option<&Cell> {
        self.cell(self.ports.get(port.0)?.cell?)
    }

    pub fn port_cell_mut(&mut self, port: PortId) -> Option<&mut Cell> {
        let cell = self.ports.get(port.0)?.cell?;
        self.cell_mut(cell)
    }

    pub fn inputs(&self, id: NodeId) -> &[PortId] {
        self.nodes.get(id.0).map_or(&[], |n| &n.inputs)
    }

    pub fn outputs(&self, id: NodeId) -> &[PortId] {
        self.nodes.get(id.0).map_or(&[], |n| &n.outputs)
    }

    /// Run one process callback with a cell view of the node's ports.
    pub(crate) fn call(&mut self, id: NodeId, direction: Direction) -> Status {
        let Some(mut hook) = self.nodes.get_mut(id.0).and_then(|n| n.hook.take()) else {
            return Status::Error;
        };
        let status = {
            let Graph {
                nodes,
                ports,
                cells,
            } = self;
            let node = nodes.get(id.0).expect("node exists while processing");
            let mut io = NodeIo {
                inputs: &node.inputs,
                outputs: &node.outputs,
                ports,
                cells,
            };
            match direction {
                Direction::Input => hook.process_input(&mut io),
                Direction::Output => hook.process_output(&mut io),
            }
        };
        if let Some(n) = self.nodes.get_mut(id.0) {
            n.hook = Some(hook);
        }
        status
    }

    // Is there a downstream path from `from` to `to` that stays on
    // synchronous nodes? Such a path plus the candidate edge would form
    // an unbreakable cycle.
    fn sync_path_exists(&self, from: NodeId, to: NodeId) -> bool {
        let is_sync = |id: NodeId| {
            self.nodes
                .get(id.0)
                .is_some_and(|n| !n.flags.contains(NodeFlags::ASYNC))
        };
        if !is_sync(from) || !is_sync(to) {
            return false;
        }
        if from == to {
            return true;
        }
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![from];
        seen.insert(from);
        while let Some(n) = stack.pop() {
            for &p in self.outputs(n) {
                let Some(peer) = self.ports.get(p.0).and_then(|q| q.peer) else {
                    continue;
                };
                let pn = self.ports.get(peer.0).expect("peer exists").node;
                if pn == to {
                    return true;
                }
                if is_sync(pn) && seen.insert(pn) {
                    stack.push(pn);
                }
            }
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A node that never runs; lifecycle tests only.
    pub(crate) struct Inert;

    impl Process for Inert {
        fn process_input(&mut self, _io: &mut NodeIo<'_>) -> Status {
            Status::Ok
        }

        fn process_output(&mut self, _io: &mut NodeIo<'_>) -> Status {
            Status::Ok
        }
    }

    fn two_linked(graph: &mut Graph) -> (NodeId, NodeId, PortId, PortId) {
        let a = graph.add_node("a", NodeFlags::empty(), Box::new(Inert));
        let b = graph.add_node("b", NodeFlags::empty(), Box::new(Inert));
        let out = graph.add_port(a, Direction::Output).unwrap();
        let inp = graph.add_port(b, Direction::Input).unwrap();
        graph.link(out, inp).unwrap();
        (a, b, out, inp)
    }

    #[test]
    fn link_bookkeeping() {
        let mut graph = Graph::new();
        let (_a, b, out, inp) = two_linked(&mut graph);
        assert_eq!(graph.node(b).unwrap().required_in(), 1);
        assert_eq!(graph.port(out).unwrap().peer, Some(inp));
        assert_eq!(
            graph.port_cell(out).unwrap().status,
            Status::NeedBuffer
        );
        graph.unlink(inp).unwrap();
        assert_eq!(graph.node(b).unwrap().required_in(), 0);
        assert!(graph.port(out).unwrap().peer.is_none());
    }

    #[test]
    fn link_rejections() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", NodeFlags::empty(), Box::new(Inert));
        let b = graph.add_node("b", NodeFlags::empty(), Box::new(Inert));
        let out = graph.add_port(a, Direction::Output).unwrap();
        let out2 = graph.add_port(a, Direction::Output).unwrap();
        let inp = graph.add_port(b, Direction::Input).unwrap();
        assert_eq!(graph.link(inp, out), Err(GraphError::DirectionMismatch));
        assert_eq!(graph.link(out, out2), Err(GraphError::DirectionMismatch));
        graph.link(out, inp).unwrap();
        assert_eq!(graph.link(out2, inp), Err(GraphError::AlreadyLinked));
    }

    #[test]
    fn busy_node_and_port() {
        let mut graph = Graph::new();
        let (a, _b, out, _inp) = two_linked(&mut graph);
        assert_eq!(graph.remove_node(a), Err(GraphError::Busy));
        assert_eq!(graph.remove_port(out), Err(GraphError::Busy));
        graph.unlink(out).unwrap();
        graph.remove_node(a).unwrap();
    }

    #[test]
    fn synchronous_cycle_rejected() {
        let mut graph = Graph::new();
        let (a, b, _out, _inp) = two_linked(&mut graph);
        let back_out = graph.add_port(b, Direction::Output).unwrap();
        let back_in = graph.add_port(a, Direction::Input).unwrap();
        assert_eq!(graph.link(back_out, back_in), Err(GraphError::WouldDeadlock));
    }

    #[test]
    fn async_breaks_cycle_at_link_time() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", NodeFlags::empty(), Box::new(Inert));
        let b = graph.add_node("b", NodeFlags::ASYNC, Box::new(Inert));
        let out = graph.add_port(a, Direction::Output).unwrap();
        let inp = graph.add_port(b, Direction::Input).unwrap();
        graph.link(out, inp).unwrap();
        let back_out = graph.add_port(b, Direction::Output).unwrap();
        let back_in = graph.add_port(a, Direction::Input).unwrap();
        graph.link(back_out, back_in).unwrap();
    }

    #[test]
    fn self_loop_needs_async() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", NodeFlags::empty(), Box::new(Inert));
        let out = graph.add_port(a, Direction::Output).unwrap();
        let inp = graph.add_port(a, Direction::Input).unwrap();
        assert_eq!(graph.link(out, inp), Err(GraphError::WouldDeadlock));
    }

    #[test]
    fn optional_input_not_required() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", NodeFlags::empty(), Box::new(Inert));
        let b = graph.add_node("b", NodeFlags::empty(), Box::new(Inert));
        let out = graph.add_port(a, Direction::Output).unwrap();
        let inp = graph.add_port(b, Direction::Input).unwrap();
        graph.mark_optional(inp).unwrap();
        graph.link(out, inp).unwrap();
        assert_eq!(graph.node(b).unwrap().required_in(), 0);
        graph.unlink(inp).unwrap();
        assert_eq!(graph.node(b).unwrap().required_in(), 0);
    }

    #[test]
    fn mark_optional_after_link_decrements() {
        let mut graph = Graph::new();
        let (_a, b, _out, inp) = two_linked(&mut graph);
        graph.mark_optional(inp).unwrap();
        assert_eq!(graph.node(b).unwrap().required_in(), 0);
    }
}
