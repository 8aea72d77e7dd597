//! The pull/push scheduler driving data through the graph.
//!
//! A FIFO ready queue holds the nodes to advance; each pump step pops
//! the head and executes the action for its state. `pull` declares a
//! sink of interest and chases upstream for buffers; `push` declares a
//! fresh producer and drives downstream. Queue membership is idempotent,
//! so a node re-readied mid-pass is coalesced, never double-queued.

use crate::graph::{Direction, Graph, NodeFlags, NodeId, NodeState, PortId, Status};
use log::{debug, trace};
use std::collections::VecDeque;

#[derive(Default)]
pub struct Scheduler {
    ready: VecDeque<NodeId>,
    sink: Option<NodeId>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// The node the current pump was entered for, if any.
    pub fn sink(&self) -> Option<NodeId> {
        self.sink
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    /// Declare `node` the sink of interest and chase upstream for
    /// buffers on the following `iterate` calls.
    pub fn pull(&mut self, graph: &mut Graph, node: NodeId) {
        debug!(target: "sched", "node {} start pull", node);
        graph.node_mut(node).expect("pulled node exists").state = NodeState::CheckIn;
        self.sink = Some(node);
        self.enqueue(graph, node);
    }

    /// Declare that `node` has produced and drive its output downstream.
    pub fn push(&mut self, graph: &mut Graph, node: NodeId) {
        debug!(target: "sched", "node {} start push", node);
        graph.node_mut(node).expect("pushed node exists").state = NodeState::Out;
        self.sink = Some(node);
        self.enqueue(graph, node);
    }

    /// Drop a node from the queue, e.g. ahead of its removal.
    pub fn forget(&mut self, graph: &mut Graph, node: NodeId) {
        self.dequeue(graph, node);
        if self.sink == Some(node) {
            self.sink = None;
        }
    }

    /// Advance the head node one step. Returns false exactly when the
    /// queue is empty and the caller should wait for outside stimulus.
    pub fn iterate(&mut self, graph: &mut Graph) -> bool {
        let Some(id) = self.ready.pop_front() else {
            return false;
        };
        graph.node_mut(id).expect("queued node exists").queued = false;
        let state = graph.node(id).expect("queued node exists").state;
        debug!(target: "sched", "node {} state {:?}", id, state);
        match state {
            NodeState::In => {
                // entering IN consumes the readiness that triggered it
                graph.node_mut(id).expect("node exists").ready_in = 0;
                let status = graph.call(id, Direction::Input);
                trace!(target: "sched", "node {} processed input: {:?}", id, status);
                self.apply(graph, id, status, NodeState::Out);
                // the sink is driven externally; everyone else continues
                if advances(status) && self.sink != Some(id) {
                    self.enqueue(graph, id);
                }
            }
            NodeState::Out => {
                let status = graph.call(id, Direction::Output);
                trace!(target: "sched", "node {} processed output: {:?}", id, status);
                self.apply(graph, id, status, NodeState::CheckOut);
                if advances(status) {
                    self.enqueue(graph, id);
                }
            }
            NodeState::CheckIn => {
                self.check_in(graph, id);
                self.check_out(graph, id);
            }
            NodeState::CheckOut => self.check_out(graph, id),
        }
        !self.ready.is_empty()
    }

    // Map a callback status onto the next state. `on_have` differs
    // between the two callbacks: consumed input still has to be
    // delivered through process_output, delivered output wakes the
    // downstream side.
    fn apply(&mut self, graph: &mut Graph, id: NodeId, status: Status, on_have: NodeState) {
        let next = match status {
            Status::NeedBuffer => Some(NodeState::CheckIn),
            Status::HaveBuffer => Some(on_have),
            Status::Ok | Status::Error => None,
        };
        if let Some(next) = next {
            graph.node_mut(id).expect("node exists").state = next;
        }
    }

    // Walk the input ports: count fed edges, and promote the upstream
    // side of hungry ones. A source peer goes straight to OUT, a filter
    // peer continues the chase through its own CHECK_IN. The sink is
    // left alone unless it is ASYNC.
    fn check_in(&mut self, graph: &mut Graph, id: NodeId) {
        graph.node_mut(id).expect("node exists").ready_in = 0;
        let inputs = graph.inputs(id).to_vec();
        for port in inputs {
            let Some(status) = graph.port_cell(port).map(|c| c.status) else {
                continue;
            };
            match status {
                Status::NeedBuffer => {
                    let peer = graph
                        .port(port)
                        .and_then(|p| p.peer)
                        .expect("port with a cell has a peer");
                    let peer_node = graph.port(peer).expect("peer exists").node;
                    let (required, is_async) = {
                        let n = graph.node(peer_node).expect("peer node exists");
                        (n.required_in, n.flags.contains(NodeFlags::ASYNC))
                    };
                    if self.sink != Some(peer_node) || is_async {
                        graph.node_mut(peer_node).expect("peer node exists").state =
                            if required == 0 {
                                NodeState::Out
                            } else {
                                NodeState::CheckIn
                            };
                        self.enqueue(graph, peer_node);
                    }
                }
                Status::HaveBuffer => {
                    graph.node_mut(id).expect("node exists").ready_in += 1;
                }
                Status::Ok | Status::Error => {}
            }
        }
    }

    fn check_out(&mut self, graph: &mut Graph, id: NodeId) {
        let outputs = graph.outputs(id).to_vec();
        for port in outputs {
            if let Some(peer) = graph.port(port).and_then(|p| p.peer) {
                self.port_check(graph, peer);
            }
        }
    }

    // Recompute the readiness of the node behind a downstream input
    // port, waking or parking it accordingly.
    fn port_check(&mut self, graph: &mut Graph, port: PortId) {
        let Some(p) = graph.port(port) else { return };
        let node_id = p.node;
        let status = graph.port_cell(port).map(|c| c.status).unwrap_or(Status::Ok);
        if status == Status::HaveBuffer {
            let n = graph.node_mut(node_id).expect("port owner exists");
            if n.ready_in < n.required_in {
                n.ready_in += 1;
            }
        }
        let (ready, required, queued) = {
            let n = graph.node(node_id).expect("port owner exists");
            (n.ready_in, n.required_in, n.queued)
        };
        trace!(
            target: "sched",
            "port {:?} node {} check {:?} {}/{}",
            port,
            node_id,
            status,
            ready,
            required
        );
        if required > 0 && ready == required {
            graph.node_mut(node_id).expect("port owner exists").state = NodeState::In;
            self.enqueue(graph, node_id);
        } else if queued {
            self.dequeue(graph, node_id);
        }
    }

    fn enqueue(&mut self, graph: &mut Graph, id: NodeId) {
        let n = graph.node_mut(id).expect("enqueued node exists");
        if n.queued {
            return;
        }
        n.queued = true;
        debug_assert!(
            !self.ready.contains(&id),
            "node {id} queued twice"
        );
        self.ready.push_back(id);
    }

    fn dequeue(&mut self, graph: &mut Graph, id: NodeId) {
        let n = graph.node_mut(id).expect("dequeued node exists");
        if !n.queued {
            return;
        }
        n.queued = false;
        self.ready.retain(|x| *x != id);
    }
}

fn advances(status: Status) -> bool {
    matches!(status, Status::NeedBuffer | Status::HaveBuffer)
}
