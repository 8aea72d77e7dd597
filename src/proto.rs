//! Wire protocol: object types, positional opcodes and the marshalling
//! of every event and request.
//!
//! Opcodes are positional and stable per object type: reordering a
//! variant here is a protocol break. Events are what the server emits,
//! requests are what clients send; both sides of a message are one
//! balanced record built with [`PodBuilder`] and walked with
//! [`PodIter`].

use crate::conn::{ConnError, SendHalf};
use crate::graph::Direction;
use crate::pod::{PodBuilder, PodError, PodIter};
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::error::Error;
use std::fmt;
use std::io;
use std::os::unix::io::BorrowedFd;

/// Resource id of the per-connection core object.
pub const CORE_ID: u32 = 0;

/// `core.error` messages are capped at this many bytes, NUL included;
/// longer text is truncated silently.
pub const ERROR_MESSAGE_MAX: usize = 128;

/// Result codes carried by `core.error`.
pub const RES_ERROR_GENERIC: i32 = -1;
pub const RES_ERROR_BUSY: i32 = -2;
pub const RES_ERROR_NO_FACTORY: i32 = -3;
pub const RES_ERROR_INVALID: i32 = -4;

/// The closed set of server-side object types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    Core = 0,
    Registry = 1,
    Module = 2,
    Node = 3,
    Client = 4,
    ClientNode = 5,
    Link = 6,
}

impl ObjectKind {
    /// The symbolic name sent in `registry.global`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Core => "Core",
            ObjectKind::Registry => "Registry",
            ObjectKind::Module => "Module",
            ObjectKind::Node => "Node",
            ObjectKind::Client => "Client",
            ObjectKind::ClientNode => "ClientNode",
            ObjectKind::Link => "Link",
        }
    }

    pub fn from_name(name: &str) -> Option<ObjectKind> {
        Some(match name {
            "Core" => ObjectKind::Core,
            "Registry" => ObjectKind::Registry,
            "Module" => ObjectKind::Module,
            "Node" => ObjectKind::Node,
            "Client" => ObjectKind::Client,
            "ClientNode" => ObjectKind::ClientNode,
            "Link" => ObjectKind::Link,
            _ => return None,
        })
    }
}

/// Lifecycle state reported in `node.info` and `state_change`.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum NodeLifecycle {
    Error = -1,
    Creating = 0,
    Suspended = 1,
    Idle = 2,
    Running = 3,
}

#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mediabus protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

impl From<PodError> for ProtocolError {
    fn from(e: PodError) -> ProtocolError {
        ProtocolError(e.to_string())
    }
}

impl From<ProtocolError> for ConnError {
    fn from(e: ProtocolError) -> ConnError {
        ConnError::Protocol(e.to_string())
    }
}

impl From<PodError> for ConnError {
    fn from(e: PodError) -> ConnError {
        ConnError::Protocol(e.to_string())
    }
}

bitflags! {
    /// What a `client_node.update` request carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeUpdateFlags: u32 {
        const MAX_INPUTS = 1 << 0;
        const MAX_OUTPUTS = 1 << 1;
        const PROPS = 1 << 2;
    }

    /// What a `client_node.port_update` request carries. An empty mask
    /// removes the port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortUpdateFlags: u32 {
        const POSSIBLE_FORMATS = 1 << 0;
        const FORMAT = 1 << 1;
        const PROPS = 1 << 2;
        const INFO = 1 << 3;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFormatFlags: u32 {
        const TEST_ONLY = 1 << 0;
        const FIXATE = 1 << 1;
        const NEAREST = 1 << 2;
    }

    /// Access rights on a shared memory region from `add_mem`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

// ---------------------
// Opcodes, per type
// ---------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreEvent {
    Info = 0,
    Done = 1,
    Error = 2,
    RemoveId = 3,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreRequestOp {
    ClientUpdate = 0,
    Sync = 1,
    GetRegistry = 2,
    CreateNode = 3,
    CreateClientNode = 4,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum RegistryEvent {
    Global = 0,
    GlobalRemove = 1,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum RegistryRequestOp {
    Bind = 0,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ModuleEvent {
    Info = 0,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeEvent {
    Done = 0,
    Info = 1,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientEvent {
    Info = 0,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientNodeEvent {
    Done = 0,
    Event = 1,
    AddPort = 2,
    RemovePort = 3,
    SetFormat = 4,
    SetProperty = 5,
    AddMem = 6,
    UseBuffers = 7,
    NodeCommand = 8,
    PortCommand = 9,
    Transport = 10,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientNodeRequestOp {
    Update = 0,
    PortUpdate = 1,
    StateChange = 2,
    Event = 3,
    Destroy = 4,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum LinkEvent {
    Info = 0,
}

// ---------------------
// Info records
// ---------------------

pub type Props = Vec<(String, String)>;

#[derive(Debug, Clone, Default)]
pub struct CoreInfo {
    pub id: u32,
    pub change_mask: u64,
    pub user_name: String,
    pub host_name: String,
    pub version: String,
    pub name: String,
    pub cookie: u32,
    pub props: Props,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub id: u32,
    pub change_mask: u64,
    pub name: String,
    pub filename: String,
    pub args: String,
    pub props: Props,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: u32,
    pub change_mask: u64,
    pub name: String,
    pub max_inputs: u32,
    pub n_inputs: u32,
    pub input_formats: Vec<Vec<u8>>,
    pub max_outputs: u32,
    pub n_outputs: u32,
    pub output_formats: Vec<Vec<u8>>,
    pub state: NodeLifecycle,
    pub error: String,
    pub props: Props,
}

impl Default for NodeInfo {
    fn default() -> NodeInfo {
        NodeInfo {
            id: 0,
            change_mask: 0,
            name: String::new(),
            max_inputs: 0,
            n_inputs: 0,
            input_formats: Vec::new(),
            max_outputs: 0,
            n_outputs: 0,
            output_formats: Vec::new(),
            state: NodeLifecycle::Creating,
            error: String::new(),
            props: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub id: u32,
    pub change_mask: u64,
    pub props: Props,
}

#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub id: u32,
    pub change_mask: u64,
    pub output_node_id: u64,
    pub output_port_id: u64,
    pub input_node_id: u64,
    pub input_port_id: u64,
}

/// One shared buffer described by `use_buffers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDesc {
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
    pub buffer_id: u32,
    pub metas: Vec<(u32, u32)>,
    pub datas: Vec<BufferData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferData {
    pub data_type: u32,
    pub data_id: u32,
    pub flags: u32,
    pub map_offset: u32,
    pub max_size: u32,
}

/// Port description carried by `port_update` when INFO is set.
#[derive(Debug, Clone, Default)]
pub struct PortInfoData {
    pub flags: u32,
    pub max_buffering: u64,
    pub latency: u64,
    pub params: Vec<Vec<u8>>,
    pub extra: Props,
}

fn push_props(b: &mut PodBuilder, props: &[(String, String)]) {
    b.push_int(props.len() as i32);
    for (key, value) in props {
        b.push_string(key);
        b.push_string(value);
    }
}

fn pull_props(it: &mut PodIter) -> Result<Props, PodError> {
    let n = it.pull_int()?;
    let mut props = Vec::new();
    for _ in 0..n {
        let key = it.pull_str()?.to_string();
        let value = it.pull_str()?.to_string();
        props.push((key, value));
    }
    Ok(props)
}

impl CoreInfo {
    pub fn demarshal(payload: &[u8]) -> Result<CoreInfo, PodError> {
        let mut it = PodIter::new(payload)?;
        Ok(CoreInfo {
            id: it.pull_int()? as u32,
            change_mask: it.pull_long()? as u64,
            user_name: it.pull_str()?.to_string(),
            host_name: it.pull_str()?.to_string(),
            version: it.pull_str()?.to_string(),
            name: it.pull_str()?.to_string(),
            cookie: it.pull_int()? as u32,
            props: pull_props(&mut it)?,
        })
    }
}

impl ModuleInfo {
    pub fn demarshal(payload: &[u8]) -> Result<ModuleInfo, PodError> {
        let mut it = PodIter::new(payload)?;
        Ok(ModuleInfo {
            id: it.pull_int()? as u32,
            change_mask: it.pull_long()? as u64,
            name: it.pull_str()?.to_string(),
            filename: it.pull_str()?.to_string(),
            args: it.pull_str()?.to_string(),
            props: pull_props(&mut it)?,
        })
    }
}

impl NodeInfo {
    pub fn demarshal(payload: &[u8]) -> Result<NodeInfo, PodError> {
        let mut it = PodIter::new(payload)?;
        let id = it.pull_int()? as u32;
        let change_mask = it.pull_long()? as u64;
        let name = it.pull_str()?.to_string();
        let max_inputs = it.pull_int()? as u32;
        let n_inputs = it.pull_int()? as u32;
        let n_formats = it.pull_int()?;
        let mut input_formats = Vec::new();
        for _ in 0..n_formats {
            input_formats.push(it.pull_pod()?.to_vec());
        }
        let max_outputs = it.pull_int()? as u32;
        let n_outputs = it.pull_int()? as u32;
        let n_formats = it.pull_int()?;
        let mut output_formats = Vec::new();
        for _ in 0..n_formats {
            output_formats.push(it.pull_pod()?.to_vec());
        }
        let state = NodeLifecycle::try_from(it.pull_int()?).unwrap_or(NodeLifecycle::Error);
        let error = it.pull_str()?.to_string();
        let props = pull_props(&mut it)?;
        Ok(NodeInfo {
            id,
            change_mask,
            name,
            max_inputs,
            n_inputs,
            input_formats,
            max_outputs,
            n_outputs,
            output_formats,
            state,
            error,
            props,
        })
    }
}

impl ClientInfo {
    pub fn demarshal(payload: &[u8]) -> Result<ClientInfo, PodError> {
        let mut it = PodIter::new(payload)?;
        Ok(ClientInfo {
            id: it.pull_int()? as u32,
            change_mask: it.pull_long()? as u64,
            props: pull_props(&mut it)?,
        })
    }
}

impl LinkInfo {
    pub fn demarshal(payload: &[u8]) -> Result<LinkInfo, PodError> {
        let mut it = PodIter::new(payload)?;
        Ok(LinkInfo {
            id: it.pull_int()? as u32,
            change_mask: it.pull_long()? as u64,
            output_node_id: it.pull_long()? as u64,
            output_port_id: it.pull_long()? as u64,
            input_node_id: it.pull_long()? as u64,
            input_port_id: it.pull_long()? as u64,
        })
    }
}

fn push_buffer(b: &mut PodBuilder, buf: &BufferDesc) {
    b.push_int(buf.mem_id as i32);
    b.push_int(buf.offset as i32);
    b.push_int(buf.size as i32);
    b.push_int(buf.buffer_id as i32);
    b.push_int(buf.metas.len() as i32);
    for (meta_type, size) in &buf.metas {
        b.push_int(*meta_type as i32);
        b.push_int(*size as i32);
    }
    b.push_int(buf.datas.len() as i32);
    for d in &buf.datas {
        b.push_int(d.data_type as i32);
        b.push_int(d.data_id as i32);
        b.push_int(d.flags as i32);
        b.push_int(d.map_offset as i32);
        b.push_int(d.max_size as i32);
    }
}

pub(crate) fn pull_buffer(it: &mut PodIter) -> Result<BufferDesc, PodError> {
    let mem_id = it.pull_int()? as u32;
    let offset = it.pull_int()? as u32;
    let size = it.pull_int()? as u32;
    let buffer_id = it.pull_int()? as u32;
    let n_metas = it.pull_int()?;
    let mut metas = Vec::new();
    for _ in 0..n_metas {
        metas.push((it.pull_int()? as u32, it.pull_int()? as u32));
    }
    let n_datas = it.pull_int()?;
    let mut datas = Vec::new();
    for _ in 0..n_datas {
        datas.push(BufferData {
            data_type: it.pull_int()? as u32,
            data_id: it.pull_int()? as u32,
            flags: it.pull_int()? as u32,
            map_offset: it.pull_int()? as u32,
            max_size: it.pull_int()? as u32,
        });
    }
    Ok(BufferDesc {
        mem_id,
        offset,
        size,
        buffer_id,
        metas,
        datas,
    })
}

// ---------------------
// Server-side event marshalling
// ---------------------

pub mod core_event {
    use super::*;

    pub fn info(tx: &mut SendHalf, id: u32, info: &CoreInfo) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(info.id as i32);
            b.push_long(info.change_mask as i64);
            b.push_string(&info.user_name);
            b.push_string(&info.host_name);
            b.push_string(&info.version);
            b.push_string(&info.name);
            b.push_int(info.cookie as i32);
            push_props(&mut b, &info.props);
            b.end_struct();
        }
        tx.end_write(id, CoreEvent::Info.into(), buf);
    }

    pub fn done(tx: &mut SendHalf, id: u32, seq: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreEvent::Done.into(), buf);
    }

    pub fn error(tx: &mut SendHalf, id: u32, target: u32, res: i32, message: &str) {
        let mut message = message;
        if message.len() >= ERROR_MESSAGE_MAX {
            let mut end = ERROR_MESSAGE_MAX - 1;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message = &message[..end];
        }
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(target as i32);
            b.push_int(res);
            b.push_string(message);
            b.end_struct();
        }
        tx.end_write(id, CoreEvent::Error.into(), buf);
    }

    pub fn remove_id(tx: &mut SendHalf, id: u32, removed: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(removed as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreEvent::RemoveId.into(), buf);
    }
}

pub mod registry_event {
    use super::*;

    pub fn global(tx: &mut SendHalf, id: u32, global_id: u32, kind: ObjectKind) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(global_id as i32);
            b.push_string(kind.as_str());
            b.end_struct();
        }
        tx.end_write(id, RegistryEvent::Global.into(), buf);
    }

    pub fn global_remove(tx: &mut SendHalf, id: u32, global_id: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(global_id as i32);
            b.end_struct();
        }
        tx.end_write(id, RegistryEvent::GlobalRemove.into(), buf);
    }
}

pub mod module_event {
    use super::*;

    pub fn info(tx: &mut SendHalf, id: u32, info: &ModuleInfo) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(info.id as i32);
            b.push_long(info.change_mask as i64);
            b.push_string(&info.name);
            b.push_string(&info.filename);
            b.push_string(&info.args);
            push_props(&mut b, &info.props);
            b.end_struct();
        }
        tx.end_write(id, ModuleEvent::Info.into(), buf);
    }
}

pub mod node_event {
    use super::*;

    pub fn done(tx: &mut SendHalf, id: u32, seq: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.end_struct();
        }
        tx.end_write(id, NodeEvent::Done.into(), buf);
    }

    pub fn info(tx: &mut SendHalf, id: u32, info: &NodeInfo) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(info.id as i32);
            b.push_long(info.change_mask as i64);
            b.push_string(&info.name);
            b.push_int(info.max_inputs as i32);
            b.push_int(info.n_inputs as i32);
            b.push_int(info.input_formats.len() as i32);
            for format in &info.input_formats {
                b.push_pod(format);
            }
            b.push_int(info.max_outputs as i32);
            b.push_int(info.n_outputs as i32);
            b.push_int(info.output_formats.len() as i32);
            for format in &info.output_formats {
                b.push_pod(format);
            }
            b.push_int(info.state.into());
            b.push_string(&info.error);
            push_props(&mut b, &info.props);
            b.end_struct();
        }
        tx.end_write(id, NodeEvent::Info.into(), buf);
    }
}

pub mod client_event {
    use super::*;

    pub fn info(tx: &mut SendHalf, id: u32, info: &ClientInfo) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(info.id as i32);
            b.push_long(info.change_mask as i64);
            push_props(&mut b, &info.props);
            b.end_struct();
        }
        tx.end_write(id, ClientEvent::Info.into(), buf);
    }
}

pub mod link_event {
    use super::*;

    pub fn info(tx: &mut SendHalf, id: u32, info: &LinkInfo) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(info.id as i32);
            b.push_long(info.change_mask as i64);
            b.push_long(info.output_node_id as i64);
            b.push_long(info.output_port_id as i64);
            b.push_long(info.input_node_id as i64);
            b.push_long(info.input_port_id as i64);
            b.end_struct();
        }
        tx.end_write(id, LinkEvent::Info.into(), buf);
    }
}

pub mod client_node_event {
    use super::*;

    /// Completes client-node setup; `data_fd` is the wakeup channel for
    /// the data loop.
    pub fn done(tx: &mut SendHalf, id: u32, seq: u32, data_fd: BorrowedFd<'_>) -> io::Result<()> {
        let mut buf = tx.begin_write();
        let index = tx.attach_fd(data_fd)?;
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_fd(index);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::Done.into(), buf);
        Ok(())
    }

    pub fn event(tx: &mut SendHalf, id: u32, body: &[u8]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_bytes(body);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::Event.into(), buf);
    }

    pub fn add_port(tx: &mut SendHalf, id: u32, seq: u32, direction: Direction, port_id: u32) {
        port_event(tx, id, ClientNodeEvent::AddPort, seq, direction, port_id);
    }

    pub fn remove_port(tx: &mut SendHalf, id: u32, seq: u32, direction: Direction, port_id: u32) {
        port_event(tx, id, ClientNodeEvent::RemovePort, seq, direction, port_id);
    }

    fn port_event(
        tx: &mut SendHalf,
        id: u32,
        opcode: ClientNodeEvent,
        seq: u32,
        direction: Direction,
        port_id: u32,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_int(u32::from(direction) as i32);
            b.push_int(port_id as i32);
            b.end_struct();
        }
        tx.end_write(id, opcode.into(), buf);
    }

    pub fn set_format(
        tx: &mut SendHalf,
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
        flags: PortFormatFlags,
        format: Option<&[u8]>,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_int(u32::from(direction) as i32);
            b.push_int(port_id as i32);
            b.push_int(flags.bits() as i32);
            b.push_int(format.is_some() as i32);
            if let Some(format) = format {
                b.push_pod(format);
            }
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::SetFormat.into(), buf);
    }

    pub fn set_property(tx: &mut SendHalf, id: u32, seq: u32, prop_id: u32, value: &[u8]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_int(prop_id as i32);
            b.push_bytes(value);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::SetProperty.into(), buf);
    }

    /// Publish one shared memory region to the client.
    #[allow(clippy::too_many_arguments)]
    pub fn add_mem(
        tx: &mut SendHalf,
        id: u32,
        direction: Direction,
        port_id: u32,
        mem_id: u32,
        mem_type: u32,
        memfd: BorrowedFd<'_>,
        flags: MemFlags,
        offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let mut buf = tx.begin_write();
        let index = tx.attach_fd(memfd)?;
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(u32::from(direction) as i32);
            b.push_int(port_id as i32);
            b.push_int(mem_id as i32);
            b.push_int(mem_type as i32);
            b.push_fd(index);
            b.push_int(flags.bits() as i32);
            b.push_int(offset as i32);
            b.push_int(size as i32);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::AddMem.into(), buf);
        Ok(())
    }

    pub fn use_buffers(
        tx: &mut SendHalf,
        id: u32,
        seq: u32,
        direction: Direction,
        port_id: u32,
        buffers: &[BufferDesc],
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_int(u32::from(direction) as i32);
            b.push_int(port_id as i32);
            b.push_int(buffers.len() as i32);
            for desc in buffers {
                push_buffer(&mut b, desc);
            }
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::UseBuffers.into(), buf);
    }

    pub fn node_command(tx: &mut SendHalf, id: u32, seq: u32, command: &[u8]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_bytes(command);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::NodeCommand.into(), buf);
    }

    pub fn port_command(tx: &mut SendHalf, id: u32, port_id: u32, command: &[u8]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(port_id as i32);
            b.push_bytes(command);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::PortCommand.into(), buf);
    }

    /// Publish the transport area holding the per-port status cells.
    pub fn transport(
        tx: &mut SendHalf,
        id: u32,
        memfd: BorrowedFd<'_>,
        offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let mut buf = tx.begin_write();
        let index = tx.attach_fd(memfd)?;
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_fd(index);
            b.push_int(offset as i32);
            b.push_int(size as i32);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeEvent::Transport.into(), buf);
        Ok(())
    }
}

// ---------------------
// Server-side request demarshalling
// ---------------------

/// Dictionary entries borrowed from a request payload.
pub type Dict<'a> = Vec<(&'a str, &'a str)>;

fn pull_dict<'a>(it: &mut PodIter<'a>) -> Result<Dict<'a>, PodError> {
    let n = it.pull_int()?;
    let mut dict = Vec::new();
    for _ in 0..n {
        let key = it.pull_str()?;
        let value = it.pull_str()?;
        dict.push((key, value));
    }
    Ok(dict)
}

pub fn own_dict(dict: &Dict<'_>) -> Props {
    dict.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug)]
pub enum CoreRequest<'a> {
    ClientUpdate {
        props: Dict<'a>,
    },
    Sync {
        seq: u32,
    },
    GetRegistry {
        seq: u32,
        new_id: u32,
    },
    CreateNode {
        seq: u32,
        factory: &'a str,
        name: &'a str,
        props: Dict<'a>,
        new_id: u32,
    },
    CreateClientNode {
        seq: u32,
        name: &'a str,
        props: Dict<'a>,
        new_id: u32,
    },
}

impl<'a> CoreRequest<'a> {
    pub fn demarshal(opcode: u32, payload: &'a [u8]) -> Result<CoreRequest<'a>, ProtocolError> {
        let op = CoreRequestOp::try_from(opcode)
            .map_err(|_| ProtocolError::new(format!("core request opcode {opcode} out of range")))?;
        let mut it = PodIter::new(payload)?;
        Ok(match op {
            CoreRequestOp::ClientUpdate => CoreRequest::ClientUpdate {
                props: pull_dict(&mut it)?,
            },
            CoreRequestOp::Sync => CoreRequest::Sync {
                seq: it.pull_int()? as u32,
            },
            CoreRequestOp::GetRegistry => CoreRequest::GetRegistry {
                seq: it.pull_int()? as u32,
                new_id: it.pull_int()? as u32,
            },
            CoreRequestOp::CreateNode => {
                let seq = it.pull_int()? as u32;
                let factory = it.pull_str()?;
                let name = it.pull_str()?;
                let props = pull_dict(&mut it)?;
                let new_id = it.pull_int()? as u32;
                CoreRequest::CreateNode {
                    seq,
                    factory,
                    name,
                    props,
                    new_id,
                }
            }
            CoreRequestOp::CreateClientNode => {
                let seq = it.pull_int()? as u32;
                let name = it.pull_str()?;
                let props = pull_dict(&mut it)?;
                let new_id = it.pull_int()? as u32;
                CoreRequest::CreateClientNode {
                    seq,
                    name,
                    props,
                    new_id,
                }
            }
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryRequest {
    Bind { id: u32, new_id: u32 },
}

impl RegistryRequest {
    pub fn demarshal(opcode: u32, payload: &[u8]) -> Result<RegistryRequest, ProtocolError> {
        let op = RegistryRequestOp::try_from(opcode).map_err(|_| {
            ProtocolError::new(format!("registry request opcode {opcode} out of range"))
        })?;
        let mut it = PodIter::new(payload)?;
        Ok(match op {
            RegistryRequestOp::Bind => RegistryRequest::Bind {
                id: it.pull_int()? as u32,
                new_id: it.pull_int()? as u32,
            },
        })
    }
}

/// Port description carried by `port_update`, borrowed from the payload.
#[derive(Debug, Default)]
pub struct PortInfoUpdate<'a> {
    pub flags: u32,
    pub max_buffering: u64,
    pub latency: u64,
    pub params: Vec<&'a [u8]>,
    pub extra: Dict<'a>,
}

#[derive(Debug)]
pub enum ClientNodeRequest<'a> {
    Update {
        change_mask: NodeUpdateFlags,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<(&'a str, &'a [u8])>,
    },
    PortUpdate {
        direction: Direction,
        port_id: u32,
        change_mask: PortUpdateFlags,
        possible_formats: Vec<&'a [u8]>,
        format: Option<&'a [u8]>,
        props: Option<(&'a str, &'a [u8])>,
        info: Option<PortInfoUpdate<'a>>,
    },
    StateChange {
        state: NodeLifecycle,
    },
    Event {
        body: &'a [u8],
    },
    Destroy {
        seq: u32,
    },
}

impl<'a> ClientNodeRequest<'a> {
    pub fn demarshal(
        opcode: u32,
        payload: &'a [u8],
    ) -> Result<ClientNodeRequest<'a>, ProtocolError> {
        let op = ClientNodeRequestOp::try_from(opcode).map_err(|_| {
            ProtocolError::new(format!("client-node request opcode {opcode} out of range"))
        })?;
        let mut it = PodIter::new(payload)?;
        Ok(match op {
            ClientNodeRequestOp::Update => {
                let change_mask = flags_of::<NodeUpdateFlags>(it.pull_int()? as u32)?;
                let max_input_ports = it.pull_int()? as u32;
                let max_output_ports = it.pull_int()? as u32;
                let props = if it.pull_int()? != 0 {
                    Some(it.pull_object()?)
                } else {
                    None
                };
                ClientNodeRequest::Update {
                    change_mask,
                    max_input_ports,
                    max_output_ports,
                    props,
                }
            }
            ClientNodeRequestOp::PortUpdate => {
                let direction = direction_of(it.pull_int()? as u32)?;
                let port_id = it.pull_int()? as u32;
                let change_mask = flags_of::<PortUpdateFlags>(it.pull_int()? as u32)?;
                let n_formats = it.pull_int()?;
                let mut possible_formats = Vec::new();
                for _ in 0..n_formats {
                    possible_formats.push(it.pull_pod()?);
                }
                let format = if it.pull_int()? != 0 {
                    Some(it.pull_pod()?)
                } else {
                    None
                };
                let props = if it.pull_int()? != 0 {
                    Some(it.pull_object()?)
                } else {
                    None
                };
                let info = if it.pull_int()? != 0 {
                    let flags = it.pull_int()? as u32;
                    let max_buffering = it.pull_long()? as u64;
                    let latency = it.pull_long()? as u64;
                    let n_params = it.pull_int()?;
                    let mut params = Vec::new();
                    for _ in 0..n_params {
                        params.push(it.pull_bytes()?);
                    }
                    let extra = pull_dict(&mut it)?;
                    Some(PortInfoUpdate {
                        flags,
                        max_buffering,
                        latency,
                        params,
                        extra,
                    })
                } else {
                    None
                };
                ClientNodeRequest::PortUpdate {
                    direction,
                    port_id,
                    change_mask,
                    possible_formats,
                    format,
                    props,
                    info,
                }
            }
            ClientNodeRequestOp::StateChange => {
                let raw = it.pull_int()?;
                let state = NodeLifecycle::try_from(raw)
                    .map_err(|_| ProtocolError::new(format!("unknown node state {raw}")))?;
                ClientNodeRequest::StateChange { state }
            }
            ClientNodeRequestOp::Event => ClientNodeRequest::Event {
                body: it.pull_bytes()?,
            },
            ClientNodeRequestOp::Destroy => ClientNodeRequest::Destroy {
                seq: it.pull_int()? as u32,
            },
        })
    }
}

fn direction_of(raw: u32) -> Result<Direction, ProtocolError> {
    Direction::try_from(raw).map_err(|_| ProtocolError::new(format!("bad direction {raw}")))
}

fn flags_of<F: bitflags::Flags<Bits = u32>>(raw: u32) -> Result<F, ProtocolError> {
    F::from_bits(raw).ok_or_else(|| ProtocolError::new(format!("unexpected flag bits {raw:#x}")))
}

// ---------------------
// Client-side request marshalling
// ---------------------

pub mod core_request {
    use super::*;

    pub fn client_update(tx: &mut SendHalf, id: u32, props: &[(String, String)]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            push_props(&mut b, props);
            b.end_struct();
        }
        tx.end_write(id, CoreRequestOp::ClientUpdate.into(), buf);
    }

    pub fn sync(tx: &mut SendHalf, id: u32, seq: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreRequestOp::Sync.into(), buf);
    }

    pub fn get_registry(tx: &mut SendHalf, id: u32, seq: u32, new_id: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_int(new_id as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreRequestOp::GetRegistry.into(), buf);
    }

    pub fn create_node(
        tx: &mut SendHalf,
        id: u32,
        seq: u32,
        factory: &str,
        name: &str,
        props: &[(String, String)],
        new_id: u32,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_string(factory);
            b.push_string(name);
            push_props(&mut b, props);
            b.push_int(new_id as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreRequestOp::CreateNode.into(), buf);
    }

    pub fn create_client_node(
        tx: &mut SendHalf,
        id: u32,
        seq: u32,
        name: &str,
        props: &[(String, String)],
        new_id: u32,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.push_string(name);
            push_props(&mut b, props);
            b.push_int(new_id as i32);
            b.end_struct();
        }
        tx.end_write(id, CoreRequestOp::CreateClientNode.into(), buf);
    }
}

pub mod registry_request {
    use super::*;

    pub fn bind(tx: &mut SendHalf, id: u32, global_id: u32, new_id: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(global_id as i32);
            b.push_int(new_id as i32);
            b.end_struct();
        }
        tx.end_write(id, RegistryRequestOp::Bind.into(), buf);
    }
}

pub mod client_node_request {
    use super::*;

    pub fn update(
        tx: &mut SendHalf,
        id: u32,
        change_mask: NodeUpdateFlags,
        max_input_ports: u32,
        max_output_ports: u32,
        props: Option<(&str, &[u8])>,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(change_mask.bits() as i32);
            b.push_int(max_input_ports as i32);
            b.push_int(max_output_ports as i32);
            b.push_int(props.is_some() as i32);
            if let Some((kind, body)) = props {
                b.push_object(kind, body);
            }
            b.end_struct();
        }
        tx.end_write(id, ClientNodeRequestOp::Update.into(), buf);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn port_update(
        tx: &mut SendHalf,
        id: u32,
        direction: Direction,
        port_id: u32,
        change_mask: PortUpdateFlags,
        possible_formats: &[Vec<u8>],
        format: Option<&[u8]>,
        props: Option<(&str, &[u8])>,
        info: Option<&PortInfoData>,
    ) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(u32::from(direction) as i32);
            b.push_int(port_id as i32);
            b.push_int(change_mask.bits() as i32);
            b.push_int(possible_formats.len() as i32);
            for format in possible_formats {
                b.push_pod(format);
            }
            b.push_int(format.is_some() as i32);
            if let Some(format) = format {
                b.push_pod(format);
            }
            b.push_int(props.is_some() as i32);
            if let Some((kind, body)) = props {
                b.push_object(kind, body);
            }
            b.push_int(info.is_some() as i32);
            if let Some(info) = info {
                b.push_int(info.flags as i32);
                b.push_long(info.max_buffering as i64);
                b.push_long(info.latency as i64);
                b.push_int(info.params.len() as i32);
                for param in &info.params {
                    b.push_bytes(param);
                }
                push_props(&mut b, &info.extra);
            }
            b.end_struct();
        }
        tx.end_write(id, ClientNodeRequestOp::PortUpdate.into(), buf);
    }

    pub fn state_change(tx: &mut SendHalf, id: u32, state: NodeLifecycle) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(state.into());
            b.end_struct();
        }
        tx.end_write(id, ClientNodeRequestOp::StateChange.into(), buf);
    }

    pub fn event(tx: &mut SendHalf, id: u32, body: &[u8]) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_bytes(body);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeRequestOp::Event.into(), buf);
    }

    pub fn destroy(tx: &mut SendHalf, id: u32, seq: u32) {
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(seq as i32);
            b.end_struct();
        }
        tx.end_write(id, ClientNodeRequestOp::Destroy.into(), buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a), Connection::new(b))
    }

    fn roundtrip(send: impl FnOnce(&mut SendHalf)) -> (u32, u32, Vec<u8>) {
        let (mut a, mut b) = pair();
        {
            let (mut tx, _) = a.split();
            send(&mut tx);
            tx.flush().unwrap();
        }
        let (_, mut rx) = b.split();
        loop {
            if rx.poll().unwrap() > 0 {
                let (mut frames, _) = rx.inbound();
                let f = frames.next().unwrap();
                return (f.dest_id, f.opcode, f.payload.to_vec());
            }
        }
    }

    #[test]
    fn opcodes_are_positionally_stable() {
        assert_eq!(u32::from(CoreEvent::Done), 1);
        assert_eq!(u32::from(CoreEvent::RemoveId), 3);
        assert_eq!(u32::from(CoreRequestOp::Sync), 1);
        assert_eq!(u32::from(CoreRequestOp::CreateClientNode), 4);
        assert_eq!(u32::from(RegistryRequestOp::Bind), 0);
        assert_eq!(u32::from(ClientNodeEvent::AddMem), 6);
        assert_eq!(u32::from(ClientNodeEvent::Transport), 10);
        assert_eq!(u32::from(ClientNodeRequestOp::Destroy), 4);
    }

    #[test]
    fn sync_request_layout() {
        let (dest, opcode, payload) = roundtrip(|tx| core_request::sync(tx, CORE_ID, 7));
        assert_eq!((dest, opcode), (CORE_ID, 1));
        // struct { int } is exactly start + field + end
        assert_eq!(payload.len(), 28);
        match CoreRequest::demarshal(opcode, &payload).unwrap() {
            CoreRequest::Sync { seq } => assert_eq!(seq, 7),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn create_node_roundtrip() {
        let props = vec![("media.class".to_string(), "Audio/Sink".to_string())];
        let (_, opcode, payload) = roundtrip(|tx| {
            core_request::create_node(tx, CORE_ID, 3, "support.null-sink", "sink", &props, 42)
        });
        match CoreRequest::demarshal(opcode, &payload).unwrap() {
            CoreRequest::CreateNode {
                seq,
                factory,
                name,
                props,
                new_id,
            } => {
                assert_eq!(seq, 3);
                assert_eq!(factory, "support.null-sink");
                assert_eq!(name, "sink");
                assert_eq!(props, vec![("media.class", "Audio/Sink")]);
                assert_eq!(new_id, 42);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn error_event_truncates_long_messages() {
        let long = "x".repeat(500);
        let (_, opcode, payload) = roundtrip(|tx| {
            core_event::error(tx, CORE_ID, 9, RES_ERROR_GENERIC, &long);
        });
        assert_eq!(opcode, u32::from(CoreEvent::Error));
        let mut it = PodIter::new(&payload).unwrap();
        assert_eq!(it.pull_int().unwrap(), 9);
        assert_eq!(it.pull_int().unwrap(), RES_ERROR_GENERIC);
        let message = it.pull_str().unwrap();
        // message plus NUL stays within the cap
        assert_eq!(message.len(), ERROR_MESSAGE_MAX - 1);
    }

    #[test]
    fn node_info_roundtrip() {
        let mut format = Vec::new();
        {
            let mut b = PodBuilder::new(&mut format);
            b.begin_struct();
            b.push_string("audio/raw");
            b.end_struct();
        }
        let info = NodeInfo {
            id: 42,
            change_mask: 1,
            name: "alsa-capture".to_string(),
            max_inputs: 0,
            n_inputs: 0,
            input_formats: Vec::new(),
            max_outputs: 2,
            n_outputs: 1,
            output_formats: vec![format],
            state: NodeLifecycle::Running,
            error: String::new(),
            props: vec![("media.role".to_string(), "capture".to_string())],
        };
        let (_, opcode, payload) = roundtrip(|tx| node_event::info(tx, 100, &info));
        assert_eq!(opcode, u32::from(NodeEvent::Info));
        let got = NodeInfo::demarshal(&payload).unwrap();
        assert_eq!(got.id, 42);
        assert_eq!(got.name, "alsa-capture");
        assert_eq!(got.output_formats, info.output_formats);
        assert_eq!(got.state, NodeLifecycle::Running);
        assert_eq!(got.props, info.props);
        // decode-encode is byte-identical
        let (_, _, again) = roundtrip(move |tx| node_event::info(tx, 100, &got));
        assert_eq!(again, payload);
    }

    #[test]
    fn port_update_roundtrip() {
        let mut format = Vec::new();
        {
            let mut b = PodBuilder::new(&mut format);
            b.begin_struct();
            b.push_string("audio/raw");
            b.push_int(48000);
            b.end_struct();
        }
        let info = PortInfoData {
            flags: 3,
            max_buffering: 1024,
            latency: 125,
            params: vec![vec![1, 2, 3]],
            extra: vec![("port.dsp".to_string(), "32 bit float".to_string())],
        };
        let (_, opcode, payload) = roundtrip(|tx| {
            client_node_request::port_update(
                tx,
                5,
                Direction::Output,
                0,
                PortUpdateFlags::POSSIBLE_FORMATS | PortUpdateFlags::INFO,
                std::slice::from_ref(&format),
                None,
                None,
                Some(&info),
            )
        });
        match ClientNodeRequest::demarshal(opcode, &payload).unwrap() {
            ClientNodeRequest::PortUpdate {
                direction,
                port_id,
                change_mask,
                possible_formats,
                format: got_format,
                props,
                info: got_info,
            } => {
                assert_eq!(direction, Direction::Output);
                assert_eq!(port_id, 0);
                assert_eq!(
                    change_mask,
                    PortUpdateFlags::POSSIBLE_FORMATS | PortUpdateFlags::INFO
                );
                assert_eq!(possible_formats, vec![&format[..]]);
                assert!(got_format.is_none());
                assert!(props.is_none());
                let got_info = got_info.unwrap();
                assert_eq!(got_info.flags, 3);
                assert_eq!(got_info.max_buffering, 1024);
                assert_eq!(got_info.params, vec![&[1u8, 2, 3][..]]);
                assert_eq!(got_info.extra, vec![("port.dsp", "32 bit float")]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        let payload = {
            let mut buf = Vec::new();
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.end_struct();
            buf
        };
        assert!(CoreRequest::demarshal(99, &payload).is_err());
        assert!(RegistryRequest::demarshal(1, &payload).is_err());
        assert!(ClientNodeRequest::demarshal(5, &payload).is_err());
    }

    #[test]
    fn use_buffers_roundtrip() {
        let buffers = vec![BufferDesc {
            mem_id: 1,
            offset: 0,
            size: 4096,
            buffer_id: 0,
            metas: vec![(1, 64)],
            datas: vec![BufferData {
                data_type: 2,
                data_id: 0,
                flags: 0,
                map_offset: 64,
                max_size: 4032,
            }],
        }];
        let (_, opcode, payload) =
            roundtrip(|tx| client_node_event::use_buffers(tx, 8, 11, Direction::Input, 0, &buffers));
        assert_eq!(opcode, u32::from(ClientNodeEvent::UseBuffers));
        let mut it = PodIter::new(&payload).unwrap();
        assert_eq!(it.pull_int().unwrap(), 11);
        assert_eq!(it.pull_int().unwrap() as u32, u32::from(Direction::Input));
        assert_eq!(it.pull_int().unwrap(), 0);
        let n = it.pull_int().unwrap();
        assert_eq!(n, 1);
        let got = pull_buffer(&mut it).unwrap();
        assert_eq!(got, buffers[0]);
        it.finish().unwrap();
    }
}
