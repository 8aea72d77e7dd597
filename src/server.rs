//! The mediabus daemon: accept loop, per-connection dispatch, and the
//! behavior behind the core, registry and client-node objects.
//!
//! Error handling follows four lanes: malformed traffic closes the
//! offending connection with a diagnostic, would-block conditions retry
//! on the next tick, policy refusals (unknown factory, busy port) are
//! reported through `core.error` and the connection survives, and
//! invariant violations panic.

use crate::conn::{ConnError, Connection, Frame, SendHalf};
use crate::graph::{Direction, Graph, NodeFlags, NodeId, NodeIo, PortId, Process, Status};
use crate::proto::{
    client_event, client_node_event, core_event, link_event, module_event, node_event,
    registry_event, ClientInfo, ClientNodeRequest, CoreInfo, CoreRequest, LinkInfo, ModuleInfo,
    NodeInfo, NodeLifecycle, NodeUpdateFlags, ObjectKind, PortUpdateFlags, ProtocolError,
    RegistryRequest, CORE_ID, RES_ERROR_BUSY, RES_ERROR_GENERIC, RES_ERROR_INVALID,
    RES_ERROR_NO_FACTORY,
};
use crate::resource::{GlobalMap, Resource, ResourceTable};
use crate::sched::Scheduler;
use byteorder::{ByteOrder, LE};
use color_eyre::eyre::{ensure, WrapErr};
use color_eyre::Result;
use indexmap::IndexMap;
use log::{debug, info, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::Uid;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::rc::Rc;

/// Size of the shared area holding the per-port status cells of one
/// client node.
pub const TRANSPORT_AREA_SIZE: u32 = 4096;

// Each cell slot is `(u32 status, u32 buffer_id)`; output slots start
// at a fixed offset so both sides agree on the layout.
const CELL_SLOT_SIZE: usize = 8;
const OUTPUT_SLOT_BASE: usize = TRANSPORT_AREA_SIZE as usize / CELL_SLOT_SIZE / 2;

/// Hands ready-made nodes to the core; the device-discovery plugin
/// registers one of these per device class.
pub trait NodeFactory {
    fn name(&self) -> &str;

    fn create(
        &mut self,
        graph: &mut Graph,
        name: &str,
        props: &[(String, String)],
    ) -> std::result::Result<NodeId, String>;
}

/// Built-in factory for a sink that consumes and discards buffers.
pub struct NullSinkFactory;

struct NullSink;

impl Process for NullSink {
    fn process_input(&mut self, io: &mut NodeIo<'_>) -> Status {
        for i in 0..io.n_inputs() {
            if let Some(cell) = io.input_mut(i) {
                if cell.status == Status::HaveBuffer {
                    cell.status = Status::NeedBuffer;
                }
            }
        }
        Status::NeedBuffer
    }

    fn process_output(&mut self, _io: &mut NodeIo<'_>) -> Status {
        Status::Ok
    }
}

impl NodeFactory for NullSinkFactory {
    fn name(&self) -> &str {
        "support.null-sink"
    }

    fn create(
        &mut self,
        graph: &mut Graph,
        name: &str,
        _props: &[(String, String)],
    ) -> std::result::Result<NodeId, String> {
        let node = graph.add_node(name, NodeFlags::empty(), Box::new(NullSink));
        graph
            .add_port(node, Direction::Input)
            .map_err(|e| e.to_string())?;
        Ok(node)
    }
}

// The memfd-backed region a remote client maps to observe its node's
// status cells. The server writes through the fd, so both views share
// the same pages.
struct TransportArea {
    file: File,
}

impl TransportArea {
    fn new() -> io::Result<TransportArea> {
        let name = CString::new("mediabus-transport").expect("static name");
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(TRANSPORT_AREA_SIZE as u64)?;
        Ok(TransportArea { file })
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    fn write_slot(&self, slot: usize, status: Status, buffer_id: u32) -> io::Result<()> {
        if (slot + 1) * CELL_SLOT_SIZE > TRANSPORT_AREA_SIZE as usize {
            return Ok(());
        }
        let raw: u32 = match status {
            Status::Ok => 0,
            Status::NeedBuffer => 1,
            Status::HaveBuffer => 2,
            Status::Error => 3,
        };
        let mut bytes = [0u8; CELL_SLOT_SIZE];
        LE::write_u32(&mut bytes[0..4], raw);
        LE::write_u32(&mut bytes[4..8], buffer_id);
        self.file
            .write_all_at(&bytes, (slot * CELL_SLOT_SIZE) as u64)
    }
}

// In-graph stand-in for a remote node: mirrors cell state into the
// transport area and kicks the data-plane eventfd. Completion comes
// back asynchronously through push/pull, never inside the pump.
struct ClientNodeHook {
    area: Rc<TransportArea>,
    wake: Rc<EventFd>,
}

impl ClientNodeHook {
    fn mirror_and_kick(&self, io: &NodeIo<'_>) {
        for i in 0..io.n_inputs() {
            if let Some(cell) = io.input(i) {
                if let Err(e) = self.area.write_slot(i, cell.status, cell.buffer_id) {
                    warn!(target: "mediabus", "transport area write failed: {e}");
                }
            }
        }
        for i in 0..io.n_outputs() {
            if let Some(cell) = io.output(i) {
                if let Err(e) =
                    self.area
                        .write_slot(OUTPUT_SLOT_BASE + i, cell.status, cell.buffer_id)
                {
                    warn!(target: "mediabus", "transport area write failed: {e}");
                }
            }
        }
        if let Err(e) = nix::unistd::write(self.wake.as_fd(), &1u64.to_ne_bytes()) {
            warn!(target: "mediabus", "data wakeup failed: {e}");
        }
    }
}

impl Process for ClientNodeHook {
    fn process_input(&mut self, io: &mut NodeIo<'_>) -> Status {
        self.mirror_and_kick(io);
        Status::Ok
    }

    fn process_output(&mut self, io: &mut NodeIo<'_>) -> Status {
        self.mirror_and_kick(io);
        Status::Ok
    }
}

struct PortState {
    port: PortId,
    possible_formats: Vec<Vec<u8>>,
    format: Option<Vec<u8>>,
}

struct ClientNodeState {
    node: NodeId,
    global: u32,
    area: Rc<TransportArea>,
    wake: Rc<EventFd>,
    lifecycle: NodeLifecycle,
    max_inputs: u32,
    max_outputs: u32,
    ports: HashMap<(Direction, u32), PortState>,
}

struct ClientCtx {
    conn: Connection,
    resources: ResourceTable,
    nodes: HashMap<u32, ClientNodeState>,
    props: Vec<(String, String)>,
}

enum GlobalDetail {
    Module(ModuleInfo),
    Node { node: Option<NodeId>, info: NodeInfo },
    Client(ClientInfo),
    Link(LinkInfo),
}

/// The daemon core. One instance serves clients sequentially, the way
/// the reactor hands connections over.
pub struct Server {
    graph: Graph,
    sched: Scheduler,
    globals: GlobalMap,
    details: IndexMap<u32, GlobalDetail>,
    factories: Vec<Box<dyn NodeFactory>>,
    info: CoreInfo,
}

impl Server {
    pub fn new(name: &str) -> Server {
        let host_name = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Server {
            graph: Graph::new(),
            sched: Scheduler::new(),
            globals: GlobalMap::new(),
            details: IndexMap::new(),
            factories: Vec::new(),
            info: CoreInfo {
                id: CORE_ID,
                change_mask: 0,
                user_name: std::env::var("USER").unwrap_or_default(),
                host_name,
                version: env!("CARGO_PKG_VERSION").to_string(),
                name: name.to_string(),
                cookie: std::process::id(),
                props: Vec::new(),
            },
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn add_factory(&mut self, factory: Box<dyn NodeFactory>) {
        self.factories.push(factory);
    }

    pub fn add_module(&mut self, mut info: ModuleInfo) -> u32 {
        let id = self.globals.add(ObjectKind::Module);
        info.id = id;
        self.details.insert(id, GlobalDetail::Module(info));
        id
    }

    pub fn add_node_global(&mut self, node: Option<NodeId>, mut info: NodeInfo) -> u32 {
        let id = self.globals.add(ObjectKind::Node);
        info.id = id;
        self.details.insert(id, GlobalDetail::Node { node, info });
        id
    }

    pub fn add_client_global(&mut self, mut info: ClientInfo) -> u32 {
        let id = self.globals.add(ObjectKind::Client);
        info.id = id;
        self.details.insert(id, GlobalDetail::Client(info));
        id
    }

    pub fn add_link_global(&mut self, mut info: LinkInfo) -> u32 {
        let id = self.globals.add(ObjectKind::Link);
        info.id = id;
        self.details.insert(id, GlobalDetail::Link(info));
        id
    }

    /// Run queued graph work until the scheduler goes idle.
    pub fn pump(&mut self) {
        while self.sched.iterate(&mut self.graph) {}
    }

    /// Bind the listening socket and serve clients until the listener
    /// fails. One misbehaving client never takes the server down.
    pub fn start(mut self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .wrap_err_with(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener =
            UnixListener::bind(path).wrap_err_with(|| format!("binding {}", path.display()))?;
        info!(target: "mediabus", "listening on {}", path.display());
        for stream in listener.incoming() {
            let stream = stream?;
            match self.handle_client(stream) {
                Ok(()) => info!(target: "mediabus", "client disconnected"),
                Err(err) => warn!(target: "mediabus", "client failed: {err:#}"),
            }
        }
        Ok(())
    }

    /// Serve one connected client until it hangs up or misbehaves.
    pub fn handle_client(&mut self, stream: UnixStream) -> Result<()> {
        check_peer(&stream)?;
        let mut ctx = ClientCtx {
            conn: Connection::new(stream),
            resources: ResourceTable::new(),
            nodes: HashMap::new(),
            props: Vec::new(),
        };
        ctx.resources
            .insert(Resource {
                id: CORE_ID,
                kind: ObjectKind::Core,
                global: None,
            })
            .expect("fresh table");
        {
            let (mut tx, _rx) = ctx.conn.split();
            core_event::info(&mut tx, CORE_ID, &self.info);
            tx.flush()?;
        }
        loop {
            match self.service(&mut ctx) {
                Ok(()) => {}
                Err(ConnError::Closed) => {
                    self.drop_client(&mut ctx);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {}
                Err(ConnError::Protocol(msg)) => {
                    self.drop_client(&mut ctx);
                    return Err(ProtocolError::new(msg).into());
                }
                Err(ConnError::Io(e)) => {
                    self.drop_client(&mut ctx);
                    return Err(e).wrap_err("client connection");
                }
            }
        }
    }

    fn service(&mut self, ctx: &mut ClientCtx) -> Result<(), ConnError> {
        let ClientCtx {
            conn,
            resources,
            nodes,
            props,
        } = ctx;
        let (mut tx, mut rx) = conn.split();
        if rx.poll()? > 0 {
            let (frames, fds) = rx.inbound();
            for frame in frames {
                fds.start_message();
                self.dispatch(&mut tx, resources, nodes, props, frame)?;
            }
        }
        tx.flush()
    }

    fn dispatch(
        &mut self,
        tx: &mut SendHalf,
        resources: &mut ResourceTable,
        nodes: &mut HashMap<u32, ClientNodeState>,
        props: &mut Vec<(String, String)>,
        frame: Frame,
    ) -> Result<(), ConnError> {
        let Some(resource) = resources.get(frame.dest_id) else {
            return Err(ConnError::Protocol(format!(
                "unknown resource id {}",
                frame.dest_id
            )));
        };
        let kind = resource.kind;
        debug!(
            target: "mediabus",
            "request dest {} kind {} opcode {}",
            frame.dest_id,
            kind.as_str(),
            frame.opcode
        );
        match kind {
            ObjectKind::Core => self.core_request(tx, resources, nodes, props, frame),
            ObjectKind::Registry => self.registry_request(tx, resources, frame),
            ObjectKind::ClientNode => self.client_node_request(tx, resources, nodes, frame),
            other => Err(ConnError::Protocol(format!(
                "{} resources take no requests",
                other.as_str()
            ))),
        }
    }

    fn core_request(
        &mut self,
        tx: &mut SendHalf,
        resources: &mut ResourceTable,
        nodes: &mut HashMap<u32, ClientNodeState>,
        props: &mut Vec<(String, String)>,
        frame: Frame,
    ) -> Result<(), ConnError> {
        match CoreRequest::demarshal(frame.opcode, frame.payload)? {
            CoreRequest::ClientUpdate { props: update } => {
                *props = crate::proto::own_dict(&update);
                debug!(target: "mediabus", "client properties updated, {} entries", props.len());
            }
            CoreRequest::Sync { seq } => {
                // requests dispatch in order, so everything before this
                // one has already committed: done may go out right away
                core_event::done(tx, CORE_ID, seq);
            }
            CoreRequest::GetRegistry { seq, new_id } => {
                resources.insert(Resource {
                    id: new_id,
                    kind: ObjectKind::Registry,
                    global: None,
                })?;
                for global in self.globals.iter() {
                    registry_event::global(tx, new_id, global.id, global.kind);
                }
                core_event::done(tx, CORE_ID, seq);
            }
            CoreRequest::CreateNode {
                seq,
                factory,
                name,
                props: node_props,
                new_id,
            } => {
                let node_props = crate::proto::own_dict(&node_props);
                match self.create_via_factory(factory, name, &node_props) {
                    Ok(global_id) => {
                        resources.insert(Resource {
                            id: new_id,
                            kind: ObjectKind::Node,
                            global: Some(global_id),
                        })?;
                        for rid in registry_ids(resources) {
                            registry_event::global(tx, rid, global_id, ObjectKind::Node);
                        }
                        if let Some(GlobalDetail::Node { info, .. }) =
                            self.details.get(&global_id)
                        {
                            node_event::info(tx, new_id, info);
                        }
                        node_event::done(tx, new_id, seq);
                    }
                    Err((res, msg)) => {
                        warn!(target: "mediabus", "create_node {factory}: {msg}");
                        core_event::error(tx, CORE_ID, frame.dest_id, res, &msg);
                    }
                }
            }
            CoreRequest::CreateClientNode {
                seq,
                name,
                props: _,
                new_id,
            } => {
                let state = self.spawn_client_node(name).map_err(ConnError::Io)?;
                if let Err(e) = resources.insert(Resource {
                    id: new_id,
                    kind: ObjectKind::ClientNode,
                    global: Some(state.global),
                }) {
                    self.teardown_client_node(&state);
                    return Err(e.into());
                }
                for rid in registry_ids(resources) {
                    registry_event::global(tx, rid, state.global, ObjectKind::Node);
                }
                client_node_event::transport(tx, new_id, state.area.fd(), 0, TRANSPORT_AREA_SIZE)
                    .map_err(ConnError::Io)?;
                client_node_event::done(tx, new_id, seq, state.wake.as_fd())
                    .map_err(ConnError::Io)?;
                info!(target: "mediabus", "client node '{}' created as resource {}", name, new_id);
                nodes.insert(new_id, state);
            }
        }
        Ok(())
    }

    fn registry_request(
        &mut self,
        tx: &mut SendHalf,
        resources: &mut ResourceTable,
        frame: Frame,
    ) -> Result<(), ConnError> {
        let RegistryRequest::Bind { id, new_id } =
            RegistryRequest::demarshal(frame.opcode, frame.payload)?;
        let Some(global) = self.globals.get(id).copied() else {
            core_event::error(
                tx,
                CORE_ID,
                frame.dest_id,
                RES_ERROR_INVALID,
                &format!("no global {id}"),
            );
            return Ok(());
        };
        resources.insert(Resource {
            id: new_id,
            kind: global.kind,
            global: Some(id),
        })?;
        match self.details.get(&id) {
            Some(GlobalDetail::Module(info)) => module_event::info(tx, new_id, info),
            Some(GlobalDetail::Node { info, .. }) => node_event::info(tx, new_id, info),
            Some(GlobalDetail::Client(info)) => client_event::info(tx, new_id, info),
            Some(GlobalDetail::Link(info)) => link_event::info(tx, new_id, info),
            None => {}
        }
        info!(target: "mediabus", "global {} bound as resource {}", id, new_id);
        Ok(())
    }

    fn client_node_request(
        &mut self,
        tx: &mut SendHalf,
        resources: &mut ResourceTable,
        nodes: &mut HashMap<u32, ClientNodeState>,
        frame: Frame,
    ) -> Result<(), ConnError> {
        let id = frame.dest_id;
        let req = ClientNodeRequest::demarshal(frame.opcode, frame.payload)?;
        if let ClientNodeRequest::Destroy { seq } = req {
            let Some(state) = nodes.remove(&id) else {
                return Err(ConnError::Protocol(format!(
                    "resource {id} has no client-node state"
                )));
            };
            let global = state.global;
            self.teardown_client_node(&state);
            resources.remove(id);
            for rid in registry_ids(resources) {
                registry_event::global_remove(tx, rid, global);
            }
            core_event::remove_id(tx, CORE_ID, id);
            core_event::done(tx, CORE_ID, seq);
            info!(target: "mediabus", "client node resource {} destroyed", id);
            return Ok(());
        }
        let Some(state) = nodes.get_mut(&id) else {
            return Err(ConnError::Protocol(format!(
                "resource {id} has no client-node state"
            )));
        };
        match req {
            ClientNodeRequest::Update {
                change_mask,
                max_input_ports,
                max_output_ports,
                props: _,
            } => {
                if change_mask.contains(NodeUpdateFlags::MAX_INPUTS) {
                    state.max_inputs = max_input_ports;
                }
                if change_mask.contains(NodeUpdateFlags::MAX_OUTPUTS) {
                    state.max_outputs = max_output_ports;
                }
                debug!(
                    target: "mediabus",
                    "client node {} update: max {}/{}",
                    id,
                    state.max_inputs,
                    state.max_outputs
                );
            }
            ClientNodeRequest::PortUpdate {
                direction,
                port_id,
                change_mask,
                possible_formats,
                format,
                props: _,
                info: _,
            } => {
                let key = (direction, port_id);
                if change_mask.is_empty() {
                    // an empty mask removes the port
                    let Some(port_state) = state.ports.get(&key) else {
                        return Ok(());
                    };
                    let linked = self
                        .graph
                        .port(port_state.port)
                        .is_some_and(|p| p.peer.is_some());
                    if linked {
                        core_event::error(tx, CORE_ID, id, RES_ERROR_BUSY, "port is linked");
                        return Ok(());
                    }
                    let port_state = state.ports.remove(&key).expect("checked above");
                    if let Err(e) = self.graph.remove_port(port_state.port) {
                        warn!(target: "mediabus", "removing port of node {}: {e}", state.node);
                    }
                    return Ok(());
                }
                if !state.ports.contains_key(&key) {
                    let port = match self.graph.add_port(state.node, direction) {
                        Ok(port) => port,
                        Err(e) => {
                            core_event::error(tx, CORE_ID, id, RES_ERROR_GENERIC, &e.to_string());
                            return Ok(());
                        }
                    };
                    state.ports.insert(
                        key,
                        PortState {
                            port,
                            possible_formats: Vec::new(),
                            format: None,
                        },
                    );
                }
                let port_state = state.ports.get_mut(&key).expect("just ensured");
                if change_mask.contains(PortUpdateFlags::POSSIBLE_FORMATS) {
                    port_state.possible_formats =
                        possible_formats.iter().map(|f| f.to_vec()).collect();
                }
                if change_mask.contains(PortUpdateFlags::FORMAT) {
                    port_state.format = format.map(|f| f.to_vec());
                }
            }
            ClientNodeRequest::StateChange { state: lifecycle } => {
                state.lifecycle = lifecycle;
                if let Some(GlobalDetail::Node { info, .. }) =
                    self.details.get_mut(&state.global)
                {
                    info.state = lifecycle;
                }
                info!(target: "mediabus", "client node {} -> {:?}", id, lifecycle);
            }
            ClientNodeRequest::Event { body } => {
                debug!(target: "mediabus", "client node {} event, {} bytes", id, body.len());
            }
            ClientNodeRequest::Destroy { .. } => unreachable!("handled above"),
        }
        Ok(())
    }

    fn create_via_factory(
        &mut self,
        factory: &str,
        name: &str,
        props: &[(String, String)],
    ) -> std::result::Result<u32, (i32, String)> {
        let Some(f) = self.factories.iter_mut().find(|f| f.name() == factory) else {
            return Err((
                RES_ERROR_NO_FACTORY,
                format!("no factory named '{factory}'"),
            ));
        };
        let node = f
            .create(&mut self.graph, name, props)
            .map_err(|msg| (RES_ERROR_GENERIC, msg))?;
        let info = NodeInfo {
            name: name.to_string(),
            n_inputs: self.graph.inputs(node).len() as u32,
            max_inputs: self.graph.inputs(node).len() as u32,
            n_outputs: self.graph.outputs(node).len() as u32,
            max_outputs: self.graph.outputs(node).len() as u32,
            state: NodeLifecycle::Idle,
            props: props.to_vec(),
            ..Default::default()
        };
        Ok(self.add_node_global(Some(node), info))
    }

    fn spawn_client_node(&mut self, name: &str) -> io::Result<ClientNodeState> {
        let area = Rc::new(TransportArea::new()?);
        let wake = Rc::new(EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
        )?);
        let hook = ClientNodeHook {
            area: area.clone(),
            wake: wake.clone(),
        };
        // remote completion re-enters through push/pull, so the node
        // may break cycles
        let node = self.graph.add_node(name, NodeFlags::ASYNC, Box::new(hook));
        let info = NodeInfo {
            name: name.to_string(),
            state: NodeLifecycle::Creating,
            ..Default::default()
        };
        let global = self.add_node_global(Some(node), info);
        Ok(ClientNodeState {
            node,
            global,
            area,
            wake,
            lifecycle: NodeLifecycle::Creating,
            max_inputs: 0,
            max_outputs: 0,
            ports: HashMap::new(),
        })
    }

    fn teardown_client_node(&mut self, state: &ClientNodeState) {
        self.sched.forget(&mut self.graph, state.node);
        for port_state in state.ports.values() {
            let linked = self
                .graph
                .port(port_state.port)
                .is_some_and(|p| p.peer.is_some());
            if linked {
                if let Err(e) = self.graph.unlink(port_state.port) {
                    warn!(target: "mediabus", "unlinking node {}: {e}", state.node);
                }
            }
        }
        if let Err(e) = self.graph.remove_node(state.node) {
            warn!(target: "mediabus", "removing node {}: {e}", state.node);
        }
        if self.globals.remove(state.global).is_some() {
            self.details.shift_remove(&state.global);
        }
    }

    fn drop_client(&mut self, ctx: &mut ClientCtx) {
        let nodes: Vec<ClientNodeState> = ctx.nodes.drain().map(|(_, state)| state).collect();
        for state in &nodes {
            self.teardown_client_node(state);
        }
        // every id on the connection dies with it
        ctx.resources.clear();
        info!(
            target: "mediabus",
            "connection closed, {} client nodes reclaimed",
            nodes.len()
        );
    }
}

fn registry_ids(resources: &ResourceTable) -> Vec<u32> {
    resources
        .iter()
        .filter(|r| r.kind == ObjectKind::Registry)
        .map(|r| r.id)
        .collect()
}

fn check_peer(stream: &UnixStream) -> Result<()> {
    let creds = getsockopt(stream, PeerCredentials).wrap_err("reading peer credentials")?;
    let me = Uid::effective().as_raw();
    ensure!(
        creds.uid() == me || creds.uid() == 0,
        "refusing peer with uid {}",
        creds.uid()
    );
    info!(
        target: "mediabus",
        "client connected: pid {} uid {}",
        creds.pid(),
        creds.uid()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_factory_makes_a_sink() {
        let mut graph = Graph::new();
        let mut factory = NullSinkFactory;
        let node = factory.create(&mut graph, "sink", &[]).unwrap();
        assert_eq!(graph.inputs(node).len(), 1);
        assert_eq!(graph.outputs(node).len(), 0);
    }

    #[test]
    fn peer_check_accepts_own_uid() {
        let (a, _b) = UnixStream::pair().unwrap();
        check_peer(&a).unwrap();
    }

    #[test]
    fn transport_area_is_shared() {
        let area = TransportArea::new().unwrap();
        area.write_slot(0, Status::HaveBuffer, 7).unwrap();
        area.write_slot(OUTPUT_SLOT_BASE, Status::NeedBuffer, 1)
            .unwrap();
        let mut bytes = [0u8; 8];
        area.file.read_exact_at(&mut bytes, 0).unwrap();
        assert_eq!(LE::read_u32(&bytes[0..4]), 2);
        assert_eq!(LE::read_u32(&bytes[4..8]), 7);
    }
}
