//! Client endpoint speaking the mediabus wire protocol.
//!
//! The mirror image of the server's dispatch tables: typed requests go
//! out, server events come back through [`Client::next_event`]. Registry
//! globals and the core hello are tracked as they arrive, so a caller
//! can connect, round-trip once and then look at what the server
//! advertised.

use crate::conn::{ConnError, Connection, FdQueue, Frame};
use crate::graph::Direction;
use crate::pod::PodIter;
use crate::proto::{
    core_request, registry_request, client_node_request, ClientEvent, ClientInfo,
    ClientNodeEvent, CoreEvent, CoreInfo, LinkEvent, LinkInfo, MemFlags, ModuleEvent, ModuleInfo,
    NodeEvent, NodeInfo, NodeLifecycle, NodeUpdateFlags, ObjectKind, PortFormatFlags,
    PortInfoData, PortUpdateFlags, RegistryEvent, BufferDesc, CORE_ID,
};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// One server event, owned and detached from the receive buffer.
///
/// The hello and registry advertisements are folded into client state
/// as they arrive; query them through [`Client::core_info`] and
/// [`Client::globals`].
#[derive(Debug)]
pub enum Event {
    CoreInfo(CoreInfo),
    Done {
        id: u32,
        seq: u32,
    },
    Error {
        target: u32,
        res: i32,
        message: String,
    },
    RemoveId {
        id: u32,
    },
    Global {
        id: u32,
        kind: ObjectKind,
    },
    GlobalRemove {
        id: u32,
    },
    ModuleInfo {
        id: u32,
        info: ModuleInfo,
    },
    NodeInfo {
        id: u32,
        info: NodeInfo,
    },
    ClientInfo {
        id: u32,
        info: ClientInfo,
    },
    LinkInfo {
        id: u32,
        info: LinkInfo,
    },
    ClientNodeDone {
        id: u32,
        seq: u32,
        data_fd: OwnedFd,
    },
    NodeEvent {
        id: u32,
        body: Vec<u8>,
    },
    AddPort {
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    RemovePort {
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    SetFormat {
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
        flags: PortFormatFlags,
        format: Option<Vec<u8>>,
    },
    SetProperty {
        id: u32,
        seq: u32,
        prop_id: u32,
        value: Vec<u8>,
    },
    AddMem {
        id: u32,
        direction: Direction,
        port_id: u32,
        mem_id: u32,
        mem_type: u32,
        fd: OwnedFd,
        flags: MemFlags,
        offset: u32,
        size: u32,
    },
    UseBuffers {
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
        buffers: Vec<BufferDesc>,
    },
    NodeCommand {
        id: u32,
        seq: u32,
        body: Vec<u8>,
    },
    PortCommand {
        id: u32,
        port_id: u32,
        body: Vec<u8>,
    },
    Transport {
        id: u32,
        mem_fd: OwnedFd,
        offset: u32,
        size: u32,
    },
}

/// A client node created with [`Client::create_client_node`]: its
/// resource id, the data-plane wakeup channel and the transport area.
#[derive(Debug)]
pub struct ClientNodeHandle {
    pub id: u32,
    pub data_fd: OwnedFd,
    pub transport_fd: OwnedFd,
    pub transport_offset: u32,
    pub transport_size: u32,
}

pub struct Client {
    conn: Connection,
    seq: u32,
    next_id: u32,
    bindings: HashMap<u32, ObjectKind>,
    registry: Option<u32>,
    core_info: Option<CoreInfo>,
    globals: Vec<(u32, ObjectKind)>,
    events: VecDeque<Event>,
}

impl Client {
    pub fn connect(path: &Path) -> Result<Client, ConnError> {
        let stream = UnixStream::connect(path).map_err(ConnError::Io)?;
        Ok(Client::from_stream(stream))
    }

    /// Wrap an already-connected socket, e.g. one side of a socketpair.
    pub fn from_stream(stream: UnixStream) -> Client {
        let mut bindings = HashMap::new();
        bindings.insert(CORE_ID, ObjectKind::Core);
        Client {
            conn: Connection::new(stream),
            seq: 0,
            next_id: 0,
            bindings,
            registry: None,
            core_info: None,
            globals: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// The server hello, once it arrived.
    pub fn core_info(&self) -> Option<&CoreInfo> {
        self.core_info.as_ref()
    }

    /// Globals observed through the registry, in advertisement order.
    pub fn globals(&self) -> &[(u32, ObjectKind)] {
        &self.globals
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    // Block until at least one frame arrived and queue its events.
    fn pump(&mut self) -> Result<(), ConnError> {
        let Client {
            conn,
            bindings,
            core_info,
            globals,
            events,
            ..
        } = self;
        let (_tx, mut rx) = conn.split();
        while rx.poll()? == 0 {}
        let (frames, fds) = rx.inbound();
        for frame in frames {
            fds.start_message();
            let Some(kind) = bindings.get(&frame.dest_id).copied() else {
                return Err(ConnError::Protocol(format!(
                    "event for unknown id {}",
                    frame.dest_id
                )));
            };
            // the hello and registry advertisements feed client state
            // and are queried through core_info()/globals() instead of
            // surfacing as events
            match parse_event(kind, frame, fds)? {
                Event::CoreInfo(info) => *core_info = Some(info),
                Event::Global { id, kind } => globals.push((id, kind)),
                Event::GlobalRemove { id } => globals.retain(|(g, _)| *g != id),
                other => events.push_back(other),
            }
        }
        Ok(())
    }

    /// The next server event, blocking until one arrives.
    pub fn next_event(&mut self) -> Result<Event, ConnError> {
        while self.events.is_empty() {
            self.pump()?;
        }
        Ok(self.events.pop_front().expect("queue not empty"))
    }

    /// An already-queued event, if any, without blocking.
    pub fn take_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Wait for `done(seq)` on resource `id`, leaving other events
    /// queued. A `core.error` arriving first fails the wait, since the
    /// request it answers will never complete.
    pub fn wait_done(&mut self, id: u32, seq: u32) -> Result<(), ConnError> {
        loop {
            let found = self.events.iter().position(
                |e| matches!(e, Event::Done { id: i, seq: s } if *i == id && *s == seq),
            );
            if let Some(at) = found {
                self.events.remove(at);
                return Ok(());
            }
            let failed = self
                .events
                .iter()
                .position(|e| matches!(e, Event::Error { .. }));
            if let Some(at) = failed {
                let Some(Event::Error {
                    target,
                    res,
                    message,
                }) = self.events.remove(at)
                else {
                    unreachable!("position matched an error event");
                };
                return Err(ConnError::Protocol(format!(
                    "server error on {target}: {message} ({res})"
                )));
            }
            self.pump()?;
        }
    }

    /// Round-trip fence: all requests sent before this call have
    /// committed on the server once it returns.
    pub fn roundtrip(&mut self) -> Result<(), ConnError> {
        let seq = self.sync()?;
        self.wait_done(CORE_ID, seq)
    }

    pub fn sync(&mut self) -> Result<u32, ConnError> {
        let seq = self.next_seq();
        let (mut tx, _) = self.conn.split();
        core_request::sync(&mut tx, CORE_ID, seq);
        tx.flush()?;
        Ok(seq)
    }

    pub fn client_update(&mut self, props: &[(String, String)]) -> Result<(), ConnError> {
        let (mut tx, _) = self.conn.split();
        core_request::client_update(&mut tx, CORE_ID, props);
        tx.flush()
    }

    /// Bind a registry and replay the server's globals; returns the
    /// registry's resource id once the replay is complete.
    pub fn get_registry(&mut self) -> Result<u32, ConnError> {
        let new_id = self.alloc_id();
        let seq = self.next_seq();
        self.bindings.insert(new_id, ObjectKind::Registry);
        {
            let (mut tx, _) = self.conn.split();
            core_request::get_registry(&mut tx, CORE_ID, seq, new_id);
            tx.flush()?;
        }
        self.wait_done(CORE_ID, seq)?;
        self.registry = Some(new_id);
        debug!(target: "mediabus", "registry bound as {}, {} globals", new_id, self.globals.len());
        Ok(new_id)
    }

    /// Bind a previously advertised global into this connection's id
    /// space.
    pub fn bind(&mut self, global_id: u32) -> Result<u32, ConnError> {
        let registry = self
            .registry
            .ok_or_else(|| ConnError::Protocol("no registry bound yet".to_string()))?;
        let kind = self
            .globals
            .iter()
            .find(|(id, _)| *id == global_id)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| ConnError::Protocol(format!("unknown global {global_id}")))?;
        let new_id = self.alloc_id();
        self.bindings.insert(new_id, kind);
        let (mut tx, _) = self.conn.split();
        registry_request::bind(&mut tx, registry, global_id, new_id);
        tx.flush()?;
        Ok(new_id)
    }

    /// Ask a factory for a server-side node; resolves once the server
    /// acknowledged with `node.done`.
    pub fn create_node(
        &mut self,
        factory: &str,
        name: &str,
        props: &[(String, String)],
    ) -> Result<u32, ConnError> {
        let new_id = self.alloc_id();
        let seq = self.next_seq();
        self.bindings.insert(new_id, ObjectKind::Node);
        {
            let (mut tx, _) = self.conn.split();
            core_request::create_node(&mut tx, CORE_ID, seq, factory, name, props, new_id);
            tx.flush()?;
        }
        self.wait_done(new_id, seq)?;
        Ok(new_id)
    }

    /// Create a node living in this process; resolves with the data-fd
    /// and transport area the server handed over.
    pub fn create_client_node(
        &mut self,
        name: &str,
        props: &[(String, String)],
    ) -> Result<ClientNodeHandle, ConnError> {
        let new_id = self.alloc_id();
        let seq = self.next_seq();
        self.bindings.insert(new_id, ObjectKind::ClientNode);
        {
            let (mut tx, _) = self.conn.split();
            core_request::create_client_node(&mut tx, CORE_ID, seq, name, props, new_id);
            tx.flush()?;
        }
        let mut transport: Option<(OwnedFd, u32, u32)> = None;
        let mut data_fd: Option<OwnedFd> = None;
        let mut skipped = Vec::new();
        while data_fd.is_none() || transport.is_none() {
            match self.next_event()? {
                Event::Transport {
                    id,
                    mem_fd,
                    offset,
                    size,
                } if id == new_id => transport = Some((mem_fd, offset, size)),
                Event::ClientNodeDone { id, seq: s, data_fd: fd }
                    if id == new_id && s == seq =>
                {
                    data_fd = Some(fd)
                }
                other => skipped.push(other),
            }
        }
        // put unrelated events back in their arrival order
        for event in skipped.into_iter().rev() {
            self.events.push_front(event);
        }
        let (transport_fd, transport_offset, transport_size) =
            transport.expect("loop exits with transport");
        Ok(ClientNodeHandle {
            id: new_id,
            data_fd: data_fd.expect("loop exits with data fd"),
            transport_fd,
            transport_offset,
            transport_size,
        })
    }

    pub fn update(
        &mut self,
        id: u32,
        change_mask: NodeUpdateFlags,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<(&str, &[u8])>,
    ) -> Result<(), ConnError> {
        let (mut tx, _) = self.conn.split();
        client_node_request::update(
            &mut tx,
            id,
            change_mask,
            max_input_ports,
            max_output_ports,
            props,
        );
        tx.flush()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn port_update(
        &mut self,
        id: u32,
        direction: Direction,
        port_id: u32,
        change_mask: PortUpdateFlags,
        possible_formats: &[Vec<u8>],
        format: Option<&[u8]>,
        info: Option<&PortInfoData>,
    ) -> Result<(), ConnError> {
        let (mut tx, _) = self.conn.split();
        client_node_request::port_update(
            &mut tx,
            id,
            direction,
            port_id,
            change_mask,
            possible_formats,
            format,
            None,
            info,
        );
        tx.flush()
    }

    pub fn state_change(&mut self, id: u32, state: NodeLifecycle) -> Result<(), ConnError> {
        let (mut tx, _) = self.conn.split();
        client_node_request::state_change(&mut tx, id, state);
        tx.flush()
    }

    pub fn node_event(&mut self, id: u32, body: &[u8]) -> Result<(), ConnError> {
        let (mut tx, _) = self.conn.split();
        client_node_request::event(&mut tx, id, body);
        tx.flush()
    }

    /// Destroy a client node; resolves when the server acknowledged and
    /// released the id.
    pub fn destroy(&mut self, id: u32) -> Result<(), ConnError> {
        let seq = self.next_seq();
        {
            let (mut tx, _) = self.conn.split();
            client_node_request::destroy(&mut tx, id, seq);
            tx.flush()?;
        }
        self.wait_done(CORE_ID, seq)?;
        self.bindings.remove(&id);
        Ok(())
    }
}

fn parse_event(kind: ObjectKind, frame: Frame, fds: &mut FdQueue) -> Result<Event, ConnError> {
    let id = frame.dest_id;
    let opcode = frame.opcode;
    let bad_opcode =
        || ConnError::Protocol(format!("{} event opcode {opcode} out of range", kind.as_str()));
    match kind {
        ObjectKind::Core => match CoreEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            CoreEvent::Info => Ok(Event::CoreInfo(CoreInfo::demarshal(frame.payload)?)),
            CoreEvent::Done => {
                let mut it = PodIter::new(frame.payload)?;
                Ok(Event::Done {
                    id,
                    seq: it.pull_int()? as u32,
                })
            }
            CoreEvent::Error => {
                let mut it = PodIter::new(frame.payload)?;
                Ok(Event::Error {
                    target: it.pull_int()? as u32,
                    res: it.pull_int()?,
                    message: it.pull_str()?.to_string(),
                })
            }
            CoreEvent::RemoveId => {
                let mut it = PodIter::new(frame.payload)?;
                Ok(Event::RemoveId {
                    id: it.pull_int()? as u32,
                })
            }
        },
        ObjectKind::Registry => match RegistryEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            RegistryEvent::Global => {
                let mut it = PodIter::new(frame.payload)?;
                let global_id = it.pull_int()? as u32;
                let name = it.pull_str()?;
                let kind = ObjectKind::from_name(name).ok_or_else(|| {
                    ConnError::Protocol(format!("unknown global type '{name}'"))
                })?;
                Ok(Event::Global {
                    id: global_id,
                    kind,
                })
            }
            RegistryEvent::GlobalRemove => {
                let mut it = PodIter::new(frame.payload)?;
                Ok(Event::GlobalRemove {
                    id: it.pull_int()? as u32,
                })
            }
        },
        ObjectKind::Module => match ModuleEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            ModuleEvent::Info => Ok(Event::ModuleInfo {
                id,
                info: ModuleInfo::demarshal(frame.payload)?,
            }),
        },
        ObjectKind::Node => match NodeEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            NodeEvent::Done => {
                let mut it = PodIter::new(frame.payload)?;
                Ok(Event::Done {
                    id,
                    seq: it.pull_int()? as u32,
                })
            }
            NodeEvent::Info => Ok(Event::NodeInfo {
                id,
                info: NodeInfo::demarshal(frame.payload)?,
            }),
        },
        ObjectKind::Client => match ClientEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            ClientEvent::Info => Ok(Event::ClientInfo {
                id,
                info: ClientInfo::demarshal(frame.payload)?,
            }),
        },
        ObjectKind::Link => match LinkEvent::try_from(opcode).map_err(|_| bad_opcode())? {
            LinkEvent::Info => Ok(Event::LinkInfo {
                id,
                info: LinkInfo::demarshal(frame.payload)?,
            }),
        },
        ObjectKind::ClientNode => parse_client_node_event(id, frame, fds),
    }
}

fn parse_client_node_event(
    id: u32,
    frame: Frame,
    fds: &mut FdQueue,
) -> Result<Event, ConnError> {
    let opcode = frame.opcode;
    let op = ClientNodeEvent::try_from(opcode).map_err(|_| {
        ConnError::Protocol(format!("client-node event opcode {opcode} out of range"))
    })?;
    let mut it = PodIter::new(frame.payload)?;
    match op {
        ClientNodeEvent::Done => {
            let seq = it.pull_int()? as u32;
            let data_fd = fds.take(it.pull_fd_index()?)?;
            Ok(Event::ClientNodeDone { id, seq, data_fd })
        }
        ClientNodeEvent::Event => Ok(Event::NodeEvent {
            id,
            body: it.pull_bytes()?.to_vec(),
        }),
        ClientNodeEvent::AddPort | ClientNodeEvent::RemovePort => {
            let seq = it.pull_int()? as u32;
            let direction = direction_of(it.pull_int()? as u32)?;
            let port_id = it.pull_int()? as u32;
            Ok(if op == ClientNodeEvent::AddPort {
                Event::AddPort {
                    id,
                    seq,
                    direction,
                    port_id,
                }
            } else {
                Event::RemovePort {
                    id,
                    seq,
                    direction,
                    port_id,
                }
            })
        }
        ClientNodeEvent::SetFormat => {
            let seq = it.pull_int()? as u32;
            let direction = direction_of(it.pull_int()? as u32)?;
            let port_id = it.pull_int()? as u32;
            let bits = it.pull_int()? as u32;
            let flags = PortFormatFlags::from_bits(bits)
                .ok_or_else(|| ConnError::Protocol(format!("bad format flags {bits:#x}")))?;
            let format = if it.pull_int()? != 0 {
                Some(it.pull_pod()?.to_vec())
            } else {
                None
            };
            Ok(Event::SetFormat {
                id,
                seq,
                direction,
                port_id,
                flags,
                format,
            })
        }
        ClientNodeEvent::SetProperty => Ok(Event::SetProperty {
            id,
            seq: it.pull_int()? as u32,
            prop_id: it.pull_int()? as u32,
            value: it.pull_bytes()?.to_vec(),
        }),
        ClientNodeEvent::AddMem => {
            let direction = direction_of(it.pull_int()? as u32)?;
            let port_id = it.pull_int()? as u32;
            let mem_id = it.pull_int()? as u32;
            let mem_type = it.pull_int()? as u32;
            let fd = fds.take(it.pull_fd_index()?)?;
            let bits = it.pull_int()? as u32;
            let flags = MemFlags::from_bits(bits)
                .ok_or_else(|| ConnError::Protocol(format!("bad mem flags {bits:#x}")))?;
            Ok(Event::AddMem {
                id,
                direction,
                port_id,
                mem_id,
                mem_type,
                fd,
                flags,
                offset: it.pull_int()? as u32,
                size: it.pull_int()? as u32,
            })
        }
        ClientNodeEvent::UseBuffers => {
            let seq = it.pull_int()? as u32;
            let direction = direction_of(it.pull_int()? as u32)?;
            let port_id = it.pull_int()? as u32;
            let n = it.pull_int()?;
            let mut buffers = Vec::new();
            for _ in 0..n {
                buffers.push(crate::proto::pull_buffer(&mut it).map_err(ConnError::from)?);
            }
            Ok(Event::UseBuffers {
                id,
                seq,
                direction,
                port_id,
                buffers,
            })
        }
        ClientNodeEvent::NodeCommand => Ok(Event::NodeCommand {
            id,
            seq: it.pull_int()? as u32,
            body: it.pull_bytes()?.to_vec(),
        }),
        ClientNodeEvent::PortCommand => Ok(Event::PortCommand {
            id,
            port_id: it.pull_int()? as u32,
            body: it.pull_bytes()?.to_vec(),
        }),
        ClientNodeEvent::Transport => {
            let mem_fd = fds.take(it.pull_fd_index()?)?;
            Ok(Event::Transport {
                id,
                mem_fd,
                offset: it.pull_int()? as u32,
                size: it.pull_int()? as u32,
            })
        }
    }
}

fn direction_of(raw: u32) -> Result<Direction, ConnError> {
    Direction::try_from(raw)
        .map_err(|_| ConnError::Protocol(format!("bad direction {raw}")))
}
